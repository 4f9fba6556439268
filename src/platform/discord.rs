//! Discord REST adapter
//!
//! Implements [`RoleDirectory`] and [`RoleEffector`] over the HTTP API, plus
//! the two calls the command surface needs (command registration and
//! interaction follow-up messages).
//!
//! Status mapping:
//!
//! - 2xx → success
//! - 403 → `Forbidden` (missing permission / role hierarchy)
//! - 404 → `NotFound`
//! - 429 → `RateLimited` with the advertised retry delay
//! - anything else → `Unexpected`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::{CommunityInfo, PlatformError, RoleDirectory, RoleEffector, RoleInfo};
use crate::rules::{CommunityId, MemberId, RoleId, RoleSet};

const AUDIT_LOG_REASON: &str = "X-Audit-Log-Reason";
/// Platform limit on audit log reasons
const MAX_REASON_LEN: usize = 512;

pub struct DiscordClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

#[derive(Deserialize)]
struct GuildPayload {
    id: String,
    name: String,
}

#[derive(Deserialize)]
struct RolePayload {
    id: String,
    name: String,
    #[serde(default)]
    color: u32,
    #[serde(default)]
    position: i64,
}

#[derive(Deserialize)]
struct MemberPayload {
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Deserialize)]
struct RateLimitPayload {
    retry_after: f64,
}

impl DiscordClient {
    pub fn new(api_base: &str, token: &str, timeout: Duration) -> Result<Self, PlatformError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("rolegate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PlatformError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.api_base, path))
            .header("Authorization", format!("Bot {}", self.token))
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, PlatformError> {
        let response = builder
            .send()
            .await
            .map_err(|e| PlatformError::Transport(e.to_string()))?;
        check_status(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, PlatformError> {
        let response = self.send(self.request(Method::GET, path)).await?;
        response
            .json()
            .await
            .map_err(|e| PlatformError::Transport(format!("decoding {path}: {e}")))
    }

    async fn member_role(
        &self,
        method: Method,
        community: &CommunityId,
        member: &MemberId,
        role: &RoleId,
        reason: &str,
    ) -> Result<(), PlatformError> {
        let path = api_path(&[
            "guilds",
            community.as_str(),
            "members",
            member.as_str(),
            "roles",
            role.as_str(),
        ])?;
        let reason: String = reason.chars().take(MAX_REASON_LEN).collect();
        let builder = self
            .request(method, &path)
            .header(AUDIT_LOG_REASON, urlencoding::encode(&reason).into_owned());
        self.send(builder).await?;
        Ok(())
    }

    /// Replace the community's slash commands with `commands`
    pub async fn register_commands(
        &self,
        application_id: &str,
        community: &CommunityId,
        commands: &serde_json::Value,
    ) -> Result<(), PlatformError> {
        let path = api_path(&[
            "applications",
            application_id,
            "guilds",
            community.as_str(),
            "commands",
        ])?;
        self.send(self.request(Method::PUT, &path).json(commands)).await?;
        debug!(%community, "Registered slash commands");
        Ok(())
    }

    /// Post an additional message to an interaction
    pub async fn follow_up(
        &self,
        application_id: &str,
        interaction_token: &str,
        content: &str,
        ephemeral: bool,
    ) -> Result<(), PlatformError> {
        let path = api_path(&["webhooks", application_id, interaction_token])?;
        let body = serde_json::json!({
            "content": content,
            "flags": if ephemeral { crate::interactions::EPHEMERAL_FLAG } else { 0 },
        });
        // Interaction webhooks are authenticated by their token alone.
        let builder = self
            .http
            .post(format!("{}{}", self.api_base, path))
            .json(&body);
        self.send(builder).await?;
        Ok(())
    }
}

/// Join raw segments into `/a/b/c`. Every segment is percent-encoded and dot
/// segments are refused, so an id can never escape its position in the path.
fn api_path(segments: &[&str]) -> Result<String, PlatformError> {
    let mut path = String::new();
    for segment in segments {
        if segment.is_empty() || *segment == "." || *segment == ".." {
            return Err(PlatformError::InvalidPath(format!("'{segment}'")));
        }
        path.push('/');
        path.push_str(&urlencoding::encode(segment));
    }
    Ok(path)
}

async fn check_status(response: Response) -> Result<Response, PlatformError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let header_retry = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok());
    let body = response.text().await.unwrap_or_default();

    Err(match status {
        StatusCode::FORBIDDEN => PlatformError::Forbidden(body),
        StatusCode::NOT_FOUND => PlatformError::NotFound(body),
        StatusCode::TOO_MANY_REQUESTS => {
            let seconds = serde_json::from_str::<RateLimitPayload>(&body)
                .map(|p| p.retry_after)
                .ok()
                .or(header_retry)
                .unwrap_or(1.0);
            PlatformError::RateLimited {
                retry_after: Duration::from_secs_f64(seconds.clamp(0.0, 3600.0)),
            }
        }
        other => PlatformError::Unexpected {
            status: other.as_u16(),
            body,
        },
    })
}

#[async_trait]
impl RoleDirectory for DiscordClient {
    async fn community(&self, community: &CommunityId) -> Result<Option<CommunityInfo>, PlatformError> {
        let path = api_path(&["guilds", community.as_str()])?;
        match self.get_json::<GuildPayload>(&path).await {
            Ok(guild) => Ok(Some(CommunityInfo {
                id: CommunityId::from(guild.id),
                name: guild.name,
            })),
            Err(PlatformError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn roles(&self, community: &CommunityId) -> Result<Vec<RoleInfo>, PlatformError> {
        let roles: Vec<RolePayload> = self
            .get_json(&api_path(&["guilds", community.as_str(), "roles"])?)
            .await?;
        Ok(roles
            .into_iter()
            .map(|r| RoleInfo {
                id: RoleId::from(r.id),
                name: r.name,
                color: r.color,
                position: r.position,
            })
            .collect())
    }
}

#[async_trait]
impl RoleEffector for DiscordClient {
    async fn member_roles(
        &self,
        community: &CommunityId,
        member: &MemberId,
    ) -> Result<RoleSet, PlatformError> {
        let payload: MemberPayload = self
            .get_json(&api_path(&["guilds", community.as_str(), "members", member.as_str()])?)
            .await?;
        Ok(payload.roles.into_iter().map(RoleId::from).collect())
    }

    async fn add_role(
        &self,
        community: &CommunityId,
        member: &MemberId,
        role: &RoleId,
        reason: &str,
    ) -> Result<(), PlatformError> {
        self.member_role(Method::PUT, community, member, role, reason)
            .await
    }

    async fn remove_role(
        &self,
        community: &CommunityId,
        member: &MemberId,
        role: &RoleId,
        reason: &str,
    ) -> Result<(), PlatformError> {
        self.member_role(Method::DELETE, community, member, role, reason)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_path_encodes_segments() {
        assert_eq!(
            api_path(&["guilds", "1", "members", "2", "roles", "3"]).unwrap(),
            "/guilds/1/members/2/roles/3"
        );
        assert_eq!(
            api_path(&["roles", "../../bans/m1"]).unwrap(),
            "/roles/..%2F..%2Fbans%2Fm1"
        );
        assert_eq!(api_path(&["roles", "a?b#c"]).unwrap(), "/roles/a%3Fb%23c");
    }

    #[test]
    fn test_api_path_refuses_dot_segments() {
        for bad in ["..", ".", ""] {
            assert!(matches!(
                api_path(&["guilds", "1", "roles", bad]),
                Err(PlatformError::InvalidPath(_))
            ));
        }
    }
}
