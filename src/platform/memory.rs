//! In-process platform
//!
//! Holds communities, roles and member role sets in memory. Used by the
//! offline CLI (role names render as unknown) and by tests, which can also
//! make role mutations fail (hierarchy) or get rate limited.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::Mutex;

use super::{CommunityInfo, PlatformError, RoleDirectory, RoleEffector, RoleInfo};
use crate::reconcile::MutationAction;
use crate::rules::{CommunityId, MemberId, RoleId, RoleSet};

#[derive(Debug, Default)]
struct CommunityState {
    name: String,
    roles: Vec<RoleInfo>,
    members: HashMap<MemberId, RoleSet>,
}

/// A role mutation that reached the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub community: CommunityId,
    pub member: MemberId,
    pub action: MutationAction,
    pub role: RoleId,
    pub reason: String,
}

#[derive(Default)]
pub struct MemoryPlatform {
    communities: DashMap<CommunityId, CommunityState>,
    /// Roles above the bot in the hierarchy
    forbidden: DashSet<(CommunityId, RoleId)>,
    /// Remaining rate-limit answers per role
    rate_limited: DashMap<RoleId, u32>,
    /// Latency of every role mutation, in milliseconds
    mutation_delay_ms: AtomicU64,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_community(&self, id: &CommunityId, name: &str) {
        self.communities.entry(id.clone()).or_default().name = name.to_string();
    }

    pub fn define_role(&self, community: &CommunityId, role: RoleInfo) {
        let mut state = self.communities.entry(community.clone()).or_default();
        state.roles.retain(|r| r.id != role.id);
        state.roles.push(role);
    }

    pub fn set_member_roles(&self, community: &CommunityId, member: &MemberId, roles: RoleSet) {
        self.communities
            .entry(community.clone())
            .or_default()
            .members
            .insert(member.clone(), roles);
    }

    pub fn member_roles_now(&self, community: &CommunityId, member: &MemberId) -> Option<RoleSet> {
        self.communities
            .get(community)
            .and_then(|c| c.members.get(member).cloned())
    }

    /// Mutations of `role` will be refused as a hierarchy violation
    pub fn forbid_role(&self, community: &CommunityId, role: &RoleId) {
        self.forbidden.insert((community.clone(), role.clone()));
    }

    /// The next `times` mutations of `role` are answered with a rate limit
    pub fn rate_limit_role(&self, role: &RoleId, times: u32) {
        self.rate_limited.insert(role.clone(), times);
    }

    /// Every role mutation takes `delay` before it lands
    pub fn delay_mutations(&self, delay: Duration) {
        self.mutation_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().await.clone()
    }

    async fn mutate(
        &self,
        community: &CommunityId,
        member: &MemberId,
        role: &RoleId,
        action: MutationAction,
        reason: &str,
    ) -> Result<(), PlatformError> {
        let delay = self.mutation_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.forbidden.contains(&(community.clone(), role.clone())) {
            return Err(PlatformError::Forbidden(format!(
                "role {role} is above the bot in the hierarchy"
            )));
        }

        if let Some(mut remaining) = self.rate_limited.get_mut(role) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(PlatformError::RateLimited {
                    retry_after: Duration::from_millis(10),
                });
            }
        }

        {
            let mut state = self
                .communities
                .get_mut(community)
                .ok_or_else(|| PlatformError::NotFound(format!("community {community}")))?;
            let roles = state
                .members
                .get_mut(member)
                .ok_or_else(|| PlatformError::NotFound(format!("member {member}")))?;
            match action {
                MutationAction::Add => roles.insert(role.clone()),
                MutationAction::Remove => roles.remove(role),
            };
        }

        self.calls.lock().await.push(RecordedCall {
            community: community.clone(),
            member: member.clone(),
            action,
            role: role.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl RoleDirectory for MemoryPlatform {
    async fn community(&self, community: &CommunityId) -> Result<Option<CommunityInfo>, PlatformError> {
        Ok(self.communities.get(community).map(|c| CommunityInfo {
            id: community.clone(),
            name: c.name.clone(),
        }))
    }

    async fn roles(&self, community: &CommunityId) -> Result<Vec<RoleInfo>, PlatformError> {
        Ok(self
            .communities
            .get(community)
            .map(|c| c.roles.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl RoleEffector for MemoryPlatform {
    async fn member_roles(
        &self,
        community: &CommunityId,
        member: &MemberId,
    ) -> Result<RoleSet, PlatformError> {
        self.member_roles_now(community, member)
            .ok_or_else(|| PlatformError::NotFound(format!("member {member}")))
    }

    async fn add_role(
        &self,
        community: &CommunityId,
        member: &MemberId,
        role: &RoleId,
        reason: &str,
    ) -> Result<(), PlatformError> {
        self.mutate(community, member, role, MutationAction::Add, reason)
            .await
    }

    async fn remove_role(
        &self,
        community: &CommunityId,
        member: &MemberId,
        role: &RoleId,
        reason: &str,
    ) -> Result<(), PlatformError> {
        self.mutate(community, member, role, MutationAction::Remove, reason)
            .await
    }
}
