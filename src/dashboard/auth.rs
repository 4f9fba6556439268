//! Password gate
//!
//! Each dashboard password unlocks exactly one community. Protected routes
//! take `?password=`; a community path segment equal to the literal
//! placeholder `:guildId` stands for the authenticated community, any other
//! value must match it.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use axum::{
    async_trait,
    extract::{FromRequestParts, Query},
    http::request::Parts,
};
use serde::Deserialize;
use tracing::{error, info};

use super::error::ApiError;
use super::SharedState;
use crate::rules::CommunityId;

pub const COMMUNITY_PLACEHOLDER: &str = ":guildId";

/// Two communities configured with the same password
#[derive(Debug, thiserror::Error)]
#[error("communities {first} and {second} share a dashboard password")]
pub struct SharedPassword {
    pub first: CommunityId,
    pub second: CommunityId,
}

/// password → community
#[derive(Debug, Clone, Default)]
pub struct Passwords {
    by_password: HashMap<String, CommunityId>,
}

impl Passwords {
    /// Read the password file (community → password). Missing, unreadable or
    /// ambiguous files lock the dashboard.
    pub fn load(path: &Path) -> Option<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Password file not readable, dashboard access will be blocked");
                return None;
            }
        };
        let entries = match serde_json::from_str::<BTreeMap<CommunityId, String>>(&content) {
            Ok(entries) => entries,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Password file is not valid JSON, dashboard access will be blocked");
                return None;
            }
        };
        match Self::from_entries(entries) {
            Ok(passwords) => {
                info!(communities = passwords.by_password.len(), "Dashboard passwords loaded");
                Some(passwords)
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Password file is ambiguous, dashboard access will be blocked");
                None
            }
        }
    }

    pub fn from_entries(
        entries: impl IntoIterator<Item = (CommunityId, String)>,
    ) -> Result<Self, SharedPassword> {
        let mut by_password = HashMap::new();
        for (community, password) in entries {
            if let Some(first) = by_password.insert(password, community.clone()) {
                return Err(SharedPassword {
                    first,
                    second: community,
                });
            }
        }
        Ok(Self { by_password })
    }

    pub fn authenticate(&self, password: &str) -> Option<&CommunityId> {
        if password.is_empty() {
            return None;
        }
        self.by_password.get(password)
    }
}

#[derive(Deserialize)]
struct PasswordQuery {
    password: Option<String>,
}

/// Community unlocked by the request's password
#[derive(Debug, Clone)]
pub struct Authenticated(pub CommunityId);

impl Authenticated {
    /// Resolve a community path segment against the authenticated one
    pub fn scope(&self, requested: &str) -> Result<CommunityId, ApiError> {
        if requested == COMMUNITY_PLACEHOLDER || requested == self.0.as_str() {
            Ok(self.0.clone())
        } else {
            Err(ApiError::Forbidden(
                "Access restricted to the server tied to this password.".to_string(),
            ))
        }
    }
}

#[async_trait]
impl FromRequestParts<SharedState> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &SharedState) -> Result<Self, Self::Rejection> {
        let Some(passwords) = state.passwords.as_ref() else {
            return Err(ApiError::Unauthorized(
                "Missing password or server configuration error.".to_string(),
            ));
        };

        let Query(query) = Query::<PasswordQuery>::from_request_parts(parts, state)
            .await
            .map_err(|_| ApiError::Unauthorized("Missing password.".to_string()))?;
        let password = query
            .password
            .ok_or_else(|| ApiError::Unauthorized("Missing password.".to_string()))?;

        passwords
            .authenticate(&password)
            .cloned()
            .map(Authenticated)
            .ok_or_else(|| ApiError::Unauthorized("Invalid password.".to_string()))
    }
}
