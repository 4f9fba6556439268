//! Dashboard HTTP routes
//!
//! Handlers for pages, the rule API, event ingestion and interactions

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::auth::Authenticated;
use super::error::{ApiError, ApiResult};
use super::SharedState;
use crate::interactions::{self, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::listener::MemberUpdate;
use crate::platform::{color_hex, PlatformError, ResolvedRole, RoleNames, EVERYONE_ROLE};
use crate::rules::RoleId;

pub const RELAY_TOKEN_HEADER: &str = "X-Relay-Token";

/// Login page
pub async fn login_page() -> impl IntoResponse {
    Html(include_str!("../../static/login.html"))
}

/// Dashboard page, only with a valid password
pub async fn dashboard_page(_auth: Authenticated) -> impl IntoResponse {
    Html(include_str!("../../static/index.html"))
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    "OK"
}

// === Rule API ===

/// GET /api/auth-guild
pub async fn api_auth_guild(Authenticated(community): Authenticated) -> Json<Value> {
    Json(json!({ "success": true, "guildId": community }))
}

/// GET /api/guild/:community
pub async fn api_guild(
    State(state): State<SharedState>,
    auth: Authenticated,
    Path(community): Path<String>,
) -> ApiResult<Json<Value>> {
    let community = auth.scope(&community)?;
    match state.directory.community(&community).await {
        Ok(Some(info)) => Ok(Json(json!({ "id": info.id, "name": info.name }))),
        Ok(None) => Err(ApiError::NotFound(
            "Guild not found or bot is not a member.".to_string(),
        )),
        Err(e) => {
            warn!(%community, error = %e, "Community lookup failed");
            Err(ApiError::Internal("Failed to fetch guild.".to_string()))
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RoleView {
    pub id: RoleId,
    pub name: String,
    pub color: String,
    pub position: i64,
}

/// GET /api/roles/:community
///
/// Roles except `@everyone`, highest position first.
pub async fn api_roles(
    State(state): State<SharedState>,
    auth: Authenticated,
    Path(community): Path<String>,
) -> ApiResult<Json<Vec<RoleView>>> {
    let community = auth.scope(&community)?;
    let lookup_failed = |e: PlatformError| {
        warn!(%community, error = %e, "Role listing failed");
        ApiError::Internal("Failed to fetch roles.".to_string())
    };

    if state
        .directory
        .community(&community)
        .await
        .map_err(lookup_failed)?
        .is_none()
    {
        return Err(ApiError::NotFound("Guild not found.".to_string()));
    }

    let mut roles = state.directory.roles(&community).await.map_err(lookup_failed)?;
    roles.retain(|r| r.name != EVERYONE_ROLE);
    roles.sort_by(|a, b| b.position.cmp(&a.position));

    Ok(Json(
        roles
            .into_iter()
            .map(|r| RoleView {
                color: color_hex(r.color),
                id: r.id,
                name: r.name,
                position: r.position,
            })
            .collect(),
    ))
}

/// One rule pair with both ends resolved for display
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRow {
    pub id: RoleId,
    pub id_name: String,
    pub id_color: String,
    pub id_position: i64,
    pub target: RoleId,
    pub target_name: String,
    pub target_color: String,
    pub target_position: i64,
}

impl LinkRow {
    fn new(id: ResolvedRole, target: ResolvedRole) -> Self {
        Self {
            id: id.id,
            id_name: id.name,
            id_color: id.color,
            id_position: id.position,
            target: target.id,
            target_name: target.name,
            target_color: target.color,
            target_position: target.position,
        }
    }
}

/// GET /api/exclusive/:community
pub async fn api_list_exclusive(
    State(state): State<SharedState>,
    auth: Authenticated,
    Path(community): Path<String>,
) -> ApiResult<Json<Vec<LinkRow>>> {
    let community = auth.scope(&community)?;
    let table = state.store.list_exclusive(&community).await?;
    if table.is_empty() {
        return Ok(Json(Vec::new()));
    }

    let names = RoleNames::load(state.directory.as_ref(), &community).await;
    Ok(Json(
        table
            .pairs()
            .map(|(trigger, conflict)| LinkRow::new(names.resolve(trigger), names.resolve(conflict)))
            .collect(),
    ))
}

/// GET /api/family/:community
pub async fn api_list_family(
    State(state): State<SharedState>,
    auth: Authenticated,
    Path(community): Path<String>,
) -> ApiResult<Json<Vec<LinkRow>>> {
    let community = auth.scope(&community)?;
    let table = state.store.list_family(&community).await?;
    if table.is_empty() {
        return Ok(Json(Vec::new()));
    }

    let names = RoleNames::load(state.directory.as_ref(), &community).await;
    Ok(Json(
        table
            .iter()
            .map(|(kid, parent)| LinkRow::new(names.resolve(kid), names.resolve(parent)))
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExclusiveRequest {
    pub trigger_id: RoleId,
    pub remove_id: RoleId,
}

/// POST /api/exclusive/:community
pub async fn api_add_exclusive(
    State(state): State<SharedState>,
    auth: Authenticated,
    Path(community): Path<String>,
    req: Result<Json<ExclusiveRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let community = auth.scope(&community)?;
    let Json(req) = req?;
    if !state
        .store
        .add_exclusive(&community, &req.trigger_id, &req.remove_id)
        .await?
    {
        return Err(ApiError::Conflict(
            "Link already exists. No changes made.".to_string(),
        ));
    }

    let names = RoleNames::load(state.directory.as_ref(), &community).await;
    Ok(Json(json!({
        "success": true,
        "message": format!(
            "Exclusive link created: IF {} THEN REMOVE {}",
            names.name(&req.trigger_id),
            names.name(&req.remove_id)
        ),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyRequest {
    pub kid_id: RoleId,
    pub parent_id: RoleId,
}

/// POST /api/family/:community
pub async fn api_set_family(
    State(state): State<SharedState>,
    auth: Authenticated,
    Path(community): Path<String>,
    req: Result<Json<FamilyRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let community = auth.scope(&community)?;
    let Json(req) = req?;
    let previous = state
        .store
        .set_family(&community, &req.kid_id, &req.parent_id)
        .await?
        .filter(|old| old != &req.parent_id);

    let names = RoleNames::load(state.directory.as_ref(), &community).await;
    Ok(Json(json!({
        "success": true,
        "message": format!(
            "Family link created: Kid {} -> Parent {}",
            names.name(&req.kid_id),
            names.name(&req.parent_id)
        ),
        "replaced": previous.map(|old| names.name(&old)),
    })))
}

#[derive(Debug, Deserialize)]
pub struct RemoveQuery {
    #[serde(rename = "targetId")]
    pub target_id: Option<String>,
}

/// DELETE /api/exclusive/:community/:trigger[?targetId=]
pub async fn api_remove_exclusive(
    State(state): State<SharedState>,
    auth: Authenticated,
    Path((community, trigger)): Path<(String, String)>,
    Query(query): Query<RemoveQuery>,
) -> ApiResult<Json<Value>> {
    let community = auth.scope(&community)?;
    let target = query
        .target_id
        .filter(|t| !t.is_empty())
        .map(RoleId::from);

    let removed = state
        .store
        .remove_exclusive(&community, &RoleId::from(trigger), target.as_ref())
        .await?;
    if !removed {
        return Err(ApiError::NotFound("Link not found".to_string()));
    }
    Ok(Json(json!({ "success": true })))
}

/// DELETE /api/family/:community/:kid
pub async fn api_remove_family(
    State(state): State<SharedState>,
    auth: Authenticated,
    Path((community, kid)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let community = auth.scope(&community)?;
    if !state
        .store
        .remove_family(&community, &RoleId::from(kid))
        .await?
    {
        return Err(ApiError::NotFound("Link not found".to_string()));
    }
    Ok(Json(json!({ "success": true })))
}

// === Relay ingestion ===

/// POST /api/events/member-update
pub async fn api_member_update(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let Some(expected) = state.relay_token.as_deref() else {
        return Err(ApiError::NotFound("Event ingestion is disabled.".to_string()));
    };
    let presented = headers
        .get(RELAY_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    if presented != Some(expected) {
        return Err(ApiError::Unauthorized("Invalid relay token.".to_string()));
    }

    let update: MemberUpdate = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Malformed member update: {e}")))?;
    update.community_id.validate()?;
    update.member_id.validate()?;
    for role in update.before.roles.iter().chain(&update.after.roles) {
        role.validate()?;
    }

    let events = state
        .events
        .as_ref()
        .ok_or_else(|| ApiError::Internal("Role listener is not running.".to_string()))?;

    debug!(community = %update.community_id, member = %update.member_id, "Queueing member update");
    events
        .send(update)
        .await
        .map_err(|_| ApiError::Internal("Role listener is not running.".to_string()))?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "success": true }))))
}

// === Interactions ===

/// POST /interactions
pub async fn interactions(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let Some(settings) = state.interactions.as_ref() else {
        return Err(ApiError::NotFound("Interactions are not configured.".to_string()));
    };

    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let (Some(signature), Some(timestamp)) = (header(SIGNATURE_HEADER), header(TIMESTAMP_HEADER))
    else {
        return Err(ApiError::Unauthorized("Missing request signature.".to_string()));
    };
    settings
        .verifier
        .verify(signature, timestamp, &body)
        .map_err(|e| ApiError::Unauthorized(e.to_string()))?;

    let (interaction, handled) =
        interactions::handle(state.store.as_ref(), state.directory.as_ref(), &body)
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    if !handled.follow_ups.is_empty() {
        match (settings.client.clone(), settings.application_id.clone()) {
            (Some(client), Some(application_id)) => {
                let pages = handled.follow_ups;
                let ephemeral = handled.ephemeral;
                let token = interaction.token;
                tokio::spawn(async move {
                    for page in pages {
                        if let Err(e) = client
                            .follow_up(&application_id, &token, &page, ephemeral)
                            .await
                        {
                            warn!(error = %e, "Follow-up message failed");
                            break;
                        }
                    }
                });
            }
            _ => info!(
                pages = handled.follow_ups.len(),
                "No platform client configured, dropping follow-up pages"
            ),
        }
    }

    Ok(Json(handled.response))
}
