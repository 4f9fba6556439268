//! Listener end-to-end tests against the in-process platform

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rolegate::listener::{IntentOutcome, ListenerConfig, MemberSnapshot, MemberUpdate, RoleListener};
use rolegate::platform::{MemoryPlatform, RoleEffector};
use rolegate::rules::store::{FileRuleStore, RuleStore};
use rolegate::{CommunityId, MemberId, MutationAction, RoleId, RoleSet, RuleError};
use tempfile::TempDir;
use tokio::sync::mpsc;

fn r(id: &str) -> RoleId {
    RoleId::from(id)
}

fn set(ids: &[&str]) -> RoleSet {
    ids.iter().map(|id| r(id)).collect::<BTreeSet<_>>()
}

struct Harness {
    _dir: TempDir,
    store: Arc<FileRuleStore>,
    platform: Arc<MemoryPlatform>,
    community: CommunityId,
    member: MemberId,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileRuleStore::new(dir.path(), Duration::from_secs(5)));
        Self {
            _dir: dir,
            store,
            platform: Arc::new(MemoryPlatform::new()),
            community: CommunityId::from("g1"),
            member: MemberId::from("m1"),
        }
    }

    fn listener(&self, config: ListenerConfig) -> RoleListener {
        RoleListener::new(self.store.clone(), self.platform.clone(), config)
    }

    /// Member now holds `after`; the event reports the change from `before`
    fn update(&self, before: &[&str], after: &[&str]) -> MemberUpdate {
        self.platform
            .set_member_roles(&self.community, &self.member, set(after));
        MemberUpdate {
            community_id: self.community.clone(),
            member_id: self.member.clone(),
            before: MemberSnapshot {
                roles: set(before),
                pending: false,
            },
            after: MemberSnapshot {
                roles: set(after),
                pending: false,
            },
        }
    }

    fn roles_now(&self) -> RoleSet {
        self.platform
            .member_roles_now(&self.community, &self.member)
            .unwrap()
    }
}

#[tokio::test]
async fn test_exclusive_trigger_removes_conflict() {
    let h = Harness::new();
    h.store.add_exclusive(&h.community, &r("a"), &r("b")).await.unwrap();

    let report = h
        .listener(ListenerConfig::default())
        .handle(h.update(&["b"], &["a", "b"]))
        .await
        .unwrap();

    assert_eq!(report.applied(), 1);
    assert_eq!(h.roles_now(), set(&["a"]));

    let calls = h.platform.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].action, MutationAction::Remove);
    assert_eq!(calls[0].role, r("b"));
    assert_eq!(
        calls[0].reason,
        "Exclusive logic: Trigger a added, removing conflicting role b"
    );
}

#[tokio::test]
async fn test_family_kid_adds_parent() {
    let h = Harness::new();
    h.store.set_family(&h.community, &r("k"), &r("p")).await.unwrap();

    let report = h
        .listener(ListenerConfig::default())
        .handle(h.update(&[], &["k"]))
        .await
        .unwrap();

    assert_eq!(report.applied(), 1);
    assert_eq!(h.roles_now(), set(&["k", "p"]));
}

#[tokio::test]
async fn test_failed_intent_does_not_stop_batch() {
    let h = Harness::new();
    h.store.add_exclusive(&h.community, &r("a"), &r("b")).await.unwrap();
    h.store.add_exclusive(&h.community, &r("a"), &r("c")).await.unwrap();
    h.platform.forbid_role(&h.community, &r("b"));

    let report = h
        .listener(ListenerConfig::default())
        .handle(h.update(&["b", "c"], &["a", "b", "c"]))
        .await
        .unwrap();

    assert_eq!(report.results.len(), 2);
    assert!(matches!(report.results[0].outcome, IntentOutcome::Failed { .. }));
    assert_eq!(report.results[1].outcome, IntentOutcome::Applied);
    assert_eq!(report.failed(), 1);
    assert_eq!(h.roles_now(), set(&["a", "b"]));
}

#[tokio::test]
async fn test_rate_limited_mutation_retried_once() {
    let h = Harness::new();
    h.store.add_exclusive(&h.community, &r("a"), &r("b")).await.unwrap();
    h.platform.rate_limit_role(&r("b"), 1);

    let report = h
        .listener(ListenerConfig::default())
        .handle(h.update(&["b"], &["a", "b"]))
        .await
        .unwrap();

    assert_eq!(report.results[0].outcome, IntentOutcome::Applied);
    assert_eq!(report.results[0].attempts, 2);
    assert_eq!(h.roles_now(), set(&["a"]));
}

#[tokio::test]
async fn test_rate_limit_beyond_cap_fails() {
    let h = Harness::new();
    h.store.add_exclusive(&h.community, &r("a"), &r("b")).await.unwrap();
    h.platform.rate_limit_role(&r("b"), 1);

    let config = ListenerConfig {
        rate_limit_retry_cap: Duration::ZERO,
        ..ListenerConfig::default()
    };
    let report = h
        .listener(config)
        .handle(h.update(&["b"], &["a", "b"]))
        .await
        .unwrap();

    assert!(matches!(report.results[0].outcome, IntentOutcome::Failed { .. }));
    assert_eq!(report.results[0].attempts, 1);
}

#[tokio::test]
async fn test_already_satisfied_intent_is_skipped() {
    let h = Harness::new();
    h.store.set_family(&h.community, &r("k"), &r("p")).await.unwrap();

    let update = h.update(&[], &["k"]);
    // Someone else granted the parent before we got to it
    h.platform
        .set_member_roles(&h.community, &h.member, set(&["k", "p"]));

    let report = h
        .listener(ListenerConfig::default())
        .handle(update)
        .await
        .unwrap();

    assert_eq!(report.skipped(), 1);
    assert!(h.platform.calls().await.is_empty());
}

#[tokio::test]
async fn test_screening_completion_is_ignored() {
    let h = Harness::new();
    h.store.set_family(&h.community, &r("k"), &r("p")).await.unwrap();

    let mut update = h.update(&[], &["k"]);
    update.before.pending = true;
    update.after.pending = false;

    let report = h
        .listener(ListenerConfig::default())
        .handle(update)
        .await
        .unwrap();

    assert!(report.ignored);
    assert!(report.results.is_empty());
    assert!(h.platform.calls().await.is_empty());
}

#[tokio::test]
async fn test_corrupt_rules_abort_event() {
    let h = Harness::new();
    std::fs::create_dir_all(h.store.root().join("g1")).unwrap();
    std::fs::write(h.store.root().join("g1").join("exclusive.json"), b"[1, 2").unwrap();

    let result = h
        .listener(ListenerConfig::default())
        .handle(h.update(&["b"], &["a", "b"]))
        .await;

    assert!(matches!(result, Err(RuleError::Integrity { .. })));
    assert!(h.platform.calls().await.is_empty());
}

#[tokio::test]
async fn test_unknown_member_falls_back_to_snapshot() {
    let h = Harness::new();
    h.store.add_exclusive(&h.community, &r("a"), &r("b")).await.unwrap();

    let update = MemberUpdate {
        community_id: h.community.clone(),
        member_id: MemberId::from("gone"),
        before: MemberSnapshot {
            roles: set(&["b"]),
            pending: false,
        },
        after: MemberSnapshot {
            roles: set(&["a", "b"]),
            pending: false,
        },
    };
    let report = h
        .listener(ListenerConfig::default())
        .handle(update)
        .await
        .unwrap();

    // Member lookup fails, the intent is still attempted and fails in isolation
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.failed(), 1);
}

#[tokio::test]
async fn test_run_consumes_channel() {
    let h = Harness::new();
    h.store.add_exclusive(&h.community, &r("a"), &r("b")).await.unwrap();

    let listener = Arc::new(h.listener(ListenerConfig::default()));
    let (tx, rx) = mpsc::channel(8);
    let task = tokio::spawn(listener.run(rx));

    tx.send(h.update(&["b"], &["a", "b"])).await.unwrap();
    drop(tx);
    task.await.unwrap();

    for _ in 0..100 {
        if h.roles_now() == set(&["a"]) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.roles_now(), set(&["a"]));
    assert_eq!(
        h.platform.member_roles(&h.community, &h.member).await.unwrap(),
        set(&["a"])
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_member_updates_apply_in_arrival_order() {
    let h = Harness::new();
    const EVENTS: usize = 8;
    for i in 0..EVENTS {
        h.store
            .set_family(&h.community, &r(&format!("a{i}")), &r(&format!("pa{i}")))
            .await
            .unwrap();
        h.store
            .set_family(&h.community, &r(&format!("b{i}")), &r(&format!("pb{i}")))
            .await
            .unwrap();
    }

    let kids = |upto: usize| -> RoleSet {
        (0..upto)
            .flat_map(|i| [r(&format!("a{i}")), r(&format!("b{i}"))])
            .collect()
    };
    h.platform
        .set_member_roles(&h.community, &h.member, kids(EVENTS));
    h.platform.delay_mutations(Duration::from_millis(5));

    let listener = Arc::new(h.listener(ListenerConfig::default()));
    let (tx, rx) = mpsc::channel(EVENTS);
    let task = tokio::spawn(listener.clone().run(rx));

    // Each event grants two kids, so it yields two parent additions
    for i in 0..EVENTS {
        tx.send(MemberUpdate {
            community_id: h.community.clone(),
            member_id: h.member.clone(),
            before: MemberSnapshot {
                roles: kids(i),
                pending: false,
            },
            after: MemberSnapshot {
                roles: kids(i + 1),
                pending: false,
            },
        })
        .await
        .unwrap();
    }
    drop(tx);
    task.await.unwrap();

    for _ in 0..500 {
        if h.platform.calls().await.len() == 2 * EVENTS && listener.active_members() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let applied: Vec<RoleId> = h.platform.calls().await.into_iter().map(|c| c.role).collect();
    let expected: Vec<RoleId> = (0..EVENTS)
        .flat_map(|i| [r(&format!("pa{i}")), r(&format!("pb{i}"))])
        .collect();
    assert_eq!(applied, expected);
    assert_eq!(listener.active_members(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_members_are_handled_concurrently() {
    let h = Harness::new();
    h.store.set_family(&h.community, &r("k"), &r("p")).await.unwrap();
    h.platform.delay_mutations(Duration::from_millis(200));

    let members: Vec<MemberId> = (0..4).map(|i| MemberId::from(format!("m{i}"))).collect();
    for member in &members {
        h.platform.set_member_roles(&h.community, member, set(&["k"]));
    }

    let listener = Arc::new(h.listener(ListenerConfig::default()));
    let (tx, rx) = mpsc::channel(8);
    let task = tokio::spawn(listener.clone().run(rx));

    let started = std::time::Instant::now();
    for member in &members {
        tx.send(MemberUpdate {
            community_id: h.community.clone(),
            member_id: member.clone(),
            before: MemberSnapshot::default(),
            after: MemberSnapshot {
                roles: set(&["k"]),
                pending: false,
            },
        })
        .await
        .unwrap();
    }
    drop(tx);
    task.await.unwrap();

    for _ in 0..200 {
        if listener.active_members() == 0 && h.platform.calls().await.len() == members.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(h.platform.calls().await.len(), members.len());
    assert_eq!(listener.active_members(), 0);
    // Four serialized mutations would take at least 800ms
    assert!(started.elapsed() < Duration::from_millis(700));
}
