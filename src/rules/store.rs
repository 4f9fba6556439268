//! Rule store - persistence for the exclusive and family tables
//!
//! Each (community, kind) pair is one JSON document:
//!
//! ```text
//! <data_dir>/<community>/exclusive.json   { "<trigger>": ["<conflict>", ...] }
//! <data_dir>/<community>/family.json      { "<kid>": "<parent>" }
//! ```
//!
//! Writes replace the whole document (write temp file, then rename), so a
//! reader always sees a complete table. Read-modify-write cycles hold a
//! per-(community, kind) lock; reads take no lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{CommunityId, ExclusiveTable, FamilyTable, RoleId, RuleKind};
use crate::error::{Result, RuleError};

/// Rule mutation interface shared by commands, dashboard and listener
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn list_exclusive(&self, community: &CommunityId) -> Result<ExclusiveTable>;

    /// Returns `false` when the pair already exists (no-op)
    async fn add_exclusive(
        &self,
        community: &CommunityId,
        trigger: &RoleId,
        conflict: &RoleId,
    ) -> Result<bool>;

    /// Without `conflict` the whole trigger entry goes; with it only that
    /// pair, pruning the trigger if it ends up empty.
    async fn remove_exclusive(
        &self,
        community: &CommunityId,
        trigger: &RoleId,
        conflict: Option<&RoleId>,
    ) -> Result<bool>;

    async fn list_family(&self, community: &CommunityId) -> Result<FamilyTable>;

    /// Overwrites any previous parent of `kid` and returns it
    async fn set_family(
        &self,
        community: &CommunityId,
        kid: &RoleId,
        parent: &RoleId,
    ) -> Result<Option<RoleId>>;

    async fn remove_family(&self, community: &CommunityId, kid: &RoleId) -> Result<bool>;
}

/// JSON-document rule store rooted at a data directory
pub struct FileRuleStore {
    root: PathBuf,
    io_timeout: Duration,
    write_locks: DashMap<(CommunityId, RuleKind), Arc<Mutex<()>>>,
}

impl FileRuleStore {
    pub fn new(root: impl Into<PathBuf>, io_timeout: Duration) -> Self {
        let root = root.into();
        info!(path = %root.display(), "Rule store initialized");
        Self {
            root,
            io_timeout,
            write_locks: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_path(&self, community: &CommunityId, kind: RuleKind) -> Result<PathBuf> {
        community.validate()?;
        Ok(self
            .root
            .join(community.as_str())
            .join(format!("{}.json", kind.as_str())))
    }

    fn write_lock(&self, community: &CommunityId, kind: RuleKind) -> Arc<Mutex<()>> {
        self.write_locks
            .entry((community.clone(), kind))
            .or_default()
            .clone()
    }

    async fn with_timeout<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::io::Result<T>>,
    {
        match tokio::time::timeout(self.io_timeout, fut).await {
            Ok(result) => result.map_err(RuleError::from),
            Err(_) => Err(RuleError::Timeout(self.io_timeout)),
        }
    }

    async fn load<T>(&self, path: &Path) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let bytes = match self.with_timeout(tokio::fs::read(path)).await {
            Ok(bytes) => bytes,
            Err(RuleError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(T::default());
            }
            Err(e) => return Err(e),
        };

        serde_json::from_slice(&bytes).map_err(|e| RuleError::integrity(path, e.to_string()))
    }

    async fn save<T: Serialize>(&self, path: &Path, table: &T) -> Result<()> {
        let data = serde_json::to_vec_pretty(table)
            .map_err(|e| RuleError::integrity(path, format!("serializing table: {e}")))?;

        if let Some(dir) = path.parent() {
            self.with_timeout(tokio::fs::create_dir_all(dir)).await?;
        }

        // Writers are serialized by the table lock, so a fixed temp name is safe.
        let tmp = path.with_extension("json.tmp");
        self.with_timeout(tokio::fs::write(&tmp, &data)).await?;
        self.with_timeout(tokio::fs::rename(&tmp, path)).await?;

        debug!(path = %path.display(), bytes = data.len(), "Saved rule table");
        Ok(())
    }

    /// Locked read-modify-write. `apply` returns its result and whether the
    /// table changed; unchanged tables are not rewritten.
    async fn modify<T, R, F>(&self, community: &CommunityId, kind: RuleKind, apply: F) -> Result<R>
    where
        T: DeserializeOwned + Serialize + Default,
        F: FnOnce(&mut T) -> Result<(R, bool)> + Send,
    {
        let path = self.table_path(community, kind)?;
        let lock = self.write_lock(community, kind);
        let _guard = lock.lock().await;

        let mut table: T = self.load(&path).await?;
        let (result, changed) = apply(&mut table)?;
        if changed {
            self.save(&path, &table).await?;
        }
        Ok(result)
    }
}

#[async_trait]
impl RuleStore for FileRuleStore {
    async fn list_exclusive(&self, community: &CommunityId) -> Result<ExclusiveTable> {
        let path = self.table_path(community, RuleKind::Exclusive)?;
        self.load(&path).await
    }

    async fn add_exclusive(
        &self,
        community: &CommunityId,
        trigger: &RoleId,
        conflict: &RoleId,
    ) -> Result<bool> {
        let inserted = self
            .modify(community, RuleKind::Exclusive, |table: &mut ExclusiveTable| {
                let inserted = table.insert(trigger.clone(), conflict.clone())?;
                Ok((inserted, inserted))
            })
            .await?;

        if inserted {
            info!(%community, %trigger, %conflict, "Exclusive rule added");
        } else {
            debug!(%community, %trigger, %conflict, "Exclusive rule already present");
        }
        Ok(inserted)
    }

    async fn remove_exclusive(
        &self,
        community: &CommunityId,
        trigger: &RoleId,
        conflict: Option<&RoleId>,
    ) -> Result<bool> {
        let removed = self
            .modify(community, RuleKind::Exclusive, |table: &mut ExclusiveTable| {
                let removed = match conflict {
                    Some(conflict) => table.remove_pair(trigger, conflict),
                    None => table.remove_trigger(trigger),
                };
                Ok((removed, removed))
            })
            .await?;

        if removed {
            info!(%community, %trigger, conflict = ?conflict, "Exclusive rule removed");
        }
        Ok(removed)
    }

    async fn list_family(&self, community: &CommunityId) -> Result<FamilyTable> {
        let path = self.table_path(community, RuleKind::Family)?;
        self.load(&path).await
    }

    async fn set_family(
        &self,
        community: &CommunityId,
        kid: &RoleId,
        parent: &RoleId,
    ) -> Result<Option<RoleId>> {
        let previous = self
            .modify(community, RuleKind::Family, |table: &mut FamilyTable| {
                let previous = table.set(kid.clone(), parent.clone())?;
                let changed = previous.as_ref() != Some(parent);
                Ok((previous, changed))
            })
            .await?;

        match &previous {
            Some(old) if old != parent => {
                info!(%community, %kid, %parent, previous = %old, "Family rule overwritten")
            }
            Some(_) => debug!(%community, %kid, %parent, "Family rule unchanged"),
            None => info!(%community, %kid, %parent, "Family rule added"),
        }
        Ok(previous)
    }

    async fn remove_family(&self, community: &CommunityId, kid: &RoleId) -> Result<bool> {
        let removed = self
            .modify(community, RuleKind::Family, |table: &mut FamilyTable| {
                let removed = table.remove(kid).is_some();
                Ok((removed, removed))
            })
            .await?;

        if removed {
            info!(%community, %kid, "Family rule removed");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> FileRuleStore {
        FileRuleStore::new(dir.path(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_missing_tables_are_empty() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let c = CommunityId::from("guild1");

        assert!(store.list_exclusive(&c).await.unwrap().is_empty());
        assert!(store.list_family(&c).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_path_like_community() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let c = CommunityId::from("../outside");

        let err = store.list_family(&c).await.unwrap_err();
        assert!(matches!(err, RuleError::Validation(_)));
    }

    #[tokio::test]
    async fn test_no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let c = CommunityId::from("guild1");

        store
            .add_exclusive(&c, &RoleId::from("a"), &RoleId::from("b"))
            .await
            .unwrap();

        let community_dir = dir.path().join("guild1");
        assert!(community_dir.join("exclusive.json").exists());
        assert!(!community_dir.join("exclusive.json.tmp").exists());
    }
}
