//! Legacy layout import tests

use std::time::Duration;

use rolegate::rules::legacy::migrate;
use rolegate::rules::store::{FileRuleStore, RuleStore};
use rolegate::{CommunityId, RoleId};
use tempfile::TempDir;

fn r(id: &str) -> RoleId {
    RoleId::from(id)
}

#[tokio::test]
async fn test_imports_both_layouts() {
    let dir = TempDir::new().unwrap();
    let legacy_exclusive = dir.path().join("exclusivestorage");
    let legacy_family = dir.path().join("familystorage");
    std::fs::create_dir_all(&legacy_exclusive).unwrap();
    std::fs::create_dir_all(&legacy_family).unwrap();

    std::fs::write(legacy_exclusive.join("a.txt"), "b\nc\n\nb\n").unwrap();
    std::fs::write(legacy_exclusive.join("x.txt"), "x\n").unwrap();
    std::fs::write(legacy_exclusive.join("notes.md"), "ignored").unwrap();
    std::fs::write(legacy_family.join("k1.txt"), "p1\n").unwrap();
    std::fs::write(
        legacy_family.join("family-links.json"),
        r#"{ "k1": "p2", "k2": "p1" }"#,
    )
    .unwrap();

    let store = FileRuleStore::new(dir.path().join("data"), Duration::from_secs(5));
    let g = CommunityId::from("g1");
    let summary = migrate(&store, &g, Some(&legacy_exclusive), Some(&legacy_family))
        .await
        .unwrap();

    assert_eq!(summary.exclusive_imported, 2);
    assert_eq!(summary.exclusive_duplicates, 1);
    assert_eq!(summary.rejected.len(), 1);
    assert_eq!(summary.family_imported, 3);

    let exclusive = store.list_exclusive(&g).await.unwrap();
    assert_eq!(exclusive.conflicts(&r("a")), &[r("b"), r("c")]);
    assert!(!exclusive.is_trigger(&r("x")));

    // The JSON document wins over the text file
    let family = store.list_family(&g).await.unwrap();
    assert_eq!(family.parent_of(&r("k1")), Some(&r("p2")));
    assert_eq!(family.parent_of(&r("k2")), Some(&r("p1")));

    // Legacy files stay in place
    assert!(legacy_exclusive.join("a.txt").exists());
    assert!(legacy_family.join("family-links.json").exists());
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let legacy = dir.path().join("legacy");
    std::fs::create_dir_all(&legacy).unwrap();
    std::fs::write(legacy.join("k.txt"), "p").unwrap();

    let store = FileRuleStore::new(dir.path().join("data"), Duration::from_secs(5));
    let g = CommunityId::from("g1");

    let first = migrate(&store, &g, None, Some(&legacy)).await.unwrap();
    assert_eq!(first.family_imported, 1);

    let second = migrate(&store, &g, None, Some(&legacy)).await.unwrap();
    assert_eq!(second.family_imported, 0);
    assert_eq!(second.family_unchanged, 1);
}

#[tokio::test]
async fn test_missing_directories_import_nothing() {
    let dir = TempDir::new().unwrap();
    let store = FileRuleStore::new(dir.path().join("data"), Duration::from_secs(5));
    let summary = migrate(
        &store,
        &CommunityId::from("g1"),
        Some(&dir.path().join("nope")),
        Some(&dir.path().join("nope")),
    )
    .await
    .unwrap();
    assert_eq!(summary, Default::default());
}
