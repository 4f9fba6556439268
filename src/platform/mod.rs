//! Platform capabilities used around the engine
//!
//! The chat platform is an external collaborator. The rest of the crate only
//! sees two capabilities:
//!
//! - [`RoleDirectory`]: community and role lookup (display only)
//! - [`RoleEffector`]: read a member's roles, add or remove one role
//!
//! Adapters:
//!
//! - `discord`: REST implementation of both
//! - `memory`: in-process implementation of both
//! - `cache`: TTL read-through cache over any directory

pub mod cache;
pub mod discord;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::rules::{CommunityId, MemberId, RoleId, RoleSet};

pub use cache::CachedDirectory;
pub use discord::DiscordClient;
pub use memory::MemoryPlatform;

/// Name of the implicit role every member holds
pub const EVERYONE_ROLE: &str = "@everyone";

/// Errors reported by the platform
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlatformError {
    /// Missing permission or role hierarchy too low
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Community, member or role does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Platform asked us to slow down
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Request never got a response
    #[error("Transport error: {0}")]
    Transport(String),

    /// An id that cannot be placed in a request path
    #[error("Invalid path segment: {0}")]
    InvalidPath(String),

    /// Any other non-success answer
    #[error("Unexpected response {status}: {body}")]
    Unexpected { status: u16, body: String },
}

/// A role as the platform describes it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleInfo {
    pub id: RoleId,
    pub name: String,
    /// RGB colour, 0 when the role has no colour
    pub color: u32,
    pub position: i64,
}

/// A community as the platform describes it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityInfo {
    pub id: CommunityId,
    pub name: String,
}

/// Display view of a role id; unresolved ids still render
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedRole {
    pub id: RoleId,
    pub name: String,
    pub color: String,
    pub position: i64,
    pub exists: bool,
}

impl ResolvedRole {
    pub fn found(role: &RoleInfo) -> Self {
        Self {
            id: role.id.clone(),
            name: role.name.clone(),
            color: color_hex(role.color),
            position: role.position,
            exists: true,
        }
    }

    pub fn unknown(id: &RoleId) -> Self {
        Self {
            id: id.clone(),
            name: unknown_role_name(id),
            color: "#AAAAAA".to_string(),
            position: -1,
            exists: false,
        }
    }
}

pub fn unknown_role_name(id: &RoleId) -> String {
    format!("Unknown ({id})")
}

/// `#RRGGBB`; colourless roles render white
pub fn color_hex(color: u32) -> String {
    if color == 0 {
        "#FFFFFF".to_string()
    } else {
        format!("#{:06X}", color & 0xFF_FFFF)
    }
}

/// Community / role lookup
#[async_trait]
pub trait RoleDirectory: Send + Sync {
    async fn community(&self, community: &CommunityId) -> Result<Option<CommunityInfo>, PlatformError>;

    /// All roles of a community, in platform order
    async fn roles(&self, community: &CommunityId) -> Result<Vec<RoleInfo>, PlatformError>;

    /// Resolve one role id; misses are not errors
    async fn resolve_role(&self, community: &CommunityId, role: &RoleId) -> ResolvedRole {
        RoleNames::load(self, community).await.resolve(role)
    }
}

/// Role lookup that never fails: lookup errors and misses both render as
/// `Unknown (<id>)`.
pub struct RoleNames {
    roles: Vec<RoleInfo>,
}

impl RoleNames {
    pub async fn load<D>(directory: &D, community: &CommunityId) -> Self
    where
        D: RoleDirectory + ?Sized,
    {
        let roles = match directory.roles(community).await {
            Ok(roles) => roles,
            Err(e) => {
                tracing::warn!(%community, error = %e, "Role lookup failed, names will show as unknown");
                Vec::new()
            }
        };
        Self { roles }
    }

    pub fn from_roles(roles: Vec<RoleInfo>) -> Self {
        Self { roles }
    }

    pub fn resolve(&self, id: &RoleId) -> ResolvedRole {
        self.roles
            .iter()
            .find(|r| &r.id == id)
            .map(ResolvedRole::found)
            .unwrap_or_else(|| ResolvedRole::unknown(id))
    }

    pub fn name(&self, id: &RoleId) -> String {
        self.resolve(id).name
    }
}

/// Role mutation on a member
#[async_trait]
pub trait RoleEffector: Send + Sync {
    /// The member's current roles
    async fn member_roles(
        &self,
        community: &CommunityId,
        member: &MemberId,
    ) -> Result<RoleSet, PlatformError>;

    async fn add_role(
        &self,
        community: &CommunityId,
        member: &MemberId,
        role: &RoleId,
        reason: &str,
    ) -> Result<(), PlatformError>;

    async fn remove_role(
        &self,
        community: &CommunityId,
        member: &MemberId,
        role: &RoleId,
        reason: &str,
    ) -> Result<(), PlatformError>;
}
