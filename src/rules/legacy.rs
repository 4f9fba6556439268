//! Import of the legacy per-file rule layout
//!
//! Older deployments kept one text file per rule:
//!
//! - exclusive: `<exclusive_dir>/<trigger>.txt`, one conflict id per line
//! - family: `<family_dir>/<kid>.txt` holding the parent id, and/or a
//!   `<family_dir>/family-links.json` object `{ "<kid>": "<parent>" }`
//!
//! Everything goes through [`RuleStore`] so the usual validation applies.
//! The legacy files are left untouched.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use super::store::RuleStore;
use super::{CommunityId, RoleId};
use crate::error::{Result, RuleError};

const FAMILY_LINKS_FILE: &str = "family-links.json";

/// Outcome counts of a migration run
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationSummary {
    pub exclusive_imported: usize,
    pub exclusive_duplicates: usize,
    pub family_imported: usize,
    pub family_unchanged: usize,
    /// Entries refused by validation, with the reason
    pub rejected: Vec<String>,
}

/// Import legacy exclusive rules from `dir`
pub async fn import_exclusive(
    store: &dyn RuleStore,
    community: &CommunityId,
    dir: &Path,
    summary: &mut MigrationSummary,
) -> Result<()> {
    for (trigger, content) in read_txt_files(dir).await? {
        for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let conflict = RoleId::from(line);
            match store.add_exclusive(community, &trigger, &conflict).await {
                Ok(true) => summary.exclusive_imported += 1,
                Ok(false) => summary.exclusive_duplicates += 1,
                Err(RuleError::Validation(reason)) => {
                    warn!(%trigger, %conflict, %reason, "Skipping legacy exclusive rule");
                    summary
                        .rejected
                        .push(format!("exclusive {trigger} -> {conflict}: {reason}"));
                }
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}

/// Import legacy family rules from `dir` (text files first, then the JSON
/// document, so the JSON mapping wins where both define a kid)
pub async fn import_family(
    store: &dyn RuleStore,
    community: &CommunityId,
    dir: &Path,
    summary: &mut MigrationSummary,
) -> Result<()> {
    let mut links: Vec<(RoleId, RoleId)> = Vec::new();

    for (kid, content) in read_txt_files(dir).await? {
        let parent = content.trim();
        if !parent.is_empty() {
            links.push((kid, RoleId::from(parent)));
        }
    }

    let json_path = dir.join(FAMILY_LINKS_FILE);
    match tokio::fs::read(&json_path).await {
        Ok(bytes) => {
            let doc: BTreeMap<String, String> = serde_json::from_slice(&bytes)
                .map_err(|e| RuleError::integrity(&json_path, e.to_string()))?;
            links.extend(
                doc.into_iter()
                    .map(|(kid, parent)| (RoleId::from(kid), RoleId::from(parent))),
            );
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    for (kid, parent) in links {
        match store.set_family(community, &kid, &parent).await {
            Ok(Some(previous)) if previous == parent => summary.family_unchanged += 1,
            Ok(_) => summary.family_imported += 1,
            Err(RuleError::Validation(reason)) => {
                warn!(%kid, %parent, %reason, "Skipping legacy family rule");
                summary
                    .rejected
                    .push(format!("family {kid} -> {parent}: {reason}"));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Run both imports for one community
pub async fn migrate(
    store: &dyn RuleStore,
    community: &CommunityId,
    exclusive_dir: Option<&Path>,
    family_dir: Option<&Path>,
) -> Result<MigrationSummary> {
    let mut summary = MigrationSummary::default();

    if let Some(dir) = exclusive_dir {
        import_exclusive(store, community, dir, &mut summary).await?;
    }
    if let Some(dir) = family_dir {
        import_family(store, community, dir, &mut summary).await?;
    }

    info!(
        %community,
        exclusive = summary.exclusive_imported,
        family = summary.family_imported,
        rejected = summary.rejected.len(),
        "Legacy migration finished"
    );
    Ok(summary)
}

/// `(file stem, content)` of every `*.txt` file in `dir`, sorted by stem.
/// A missing directory yields nothing.
async fn read_txt_files(dir: &Path) -> Result<Vec<(RoleId, String)>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("txt") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let content = tokio::fs::read_to_string(&path).await?;
        files.push((RoleId::from(stem), content));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}
