//! Read-through role cache
//!
//! Role names, colours and positions change rarely but are looked up for
//! every rendered listing. Entries live for a fixed TTL and are refreshed on
//! the next miss. Lookup failures are never cached.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{CommunityInfo, PlatformError, RoleDirectory, RoleInfo};
use crate::rules::CommunityId;

struct Entry<T> {
    value: T,
    fetched_at: Instant,
}

pub struct CachedDirectory {
    inner: Arc<dyn RoleDirectory>,
    ttl: Duration,
    roles: DashMap<CommunityId, Entry<Vec<RoleInfo>>>,
    communities: DashMap<CommunityId, Entry<Option<CommunityInfo>>>,
}

impl CachedDirectory {
    pub fn new(inner: Arc<dyn RoleDirectory>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            roles: DashMap::new(),
            communities: DashMap::new(),
        }
    }

    /// Drop everything cached for one community
    pub fn invalidate(&self, community: &CommunityId) {
        self.roles.remove(community);
        self.communities.remove(community);
    }

    fn fresh<T: Clone>(&self, map: &DashMap<CommunityId, Entry<T>>, key: &CommunityId) -> Option<T> {
        map.get(key)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.value.clone())
    }
}

#[async_trait]
impl RoleDirectory for CachedDirectory {
    async fn community(&self, community: &CommunityId) -> Result<Option<CommunityInfo>, PlatformError> {
        if let Some(info) = self.fresh(&self.communities, community) {
            return Ok(info);
        }

        let info = self.inner.community(community).await?;
        self.communities.insert(
            community.clone(),
            Entry {
                value: info.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(info)
    }

    async fn roles(&self, community: &CommunityId) -> Result<Vec<RoleInfo>, PlatformError> {
        if let Some(roles) = self.fresh(&self.roles, community) {
            return Ok(roles);
        }

        debug!(%community, "Role cache miss");
        let roles = self.inner.roles(community).await?;
        self.roles.insert(
            community.clone(),
            Entry {
                value: roles.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(roles)
    }
}
