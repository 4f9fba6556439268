//! Dashboard - web UI and HTTP API around the rule store
//!
//! Provides:
//! - Login and dashboard pages, static assets
//! - Rule CRUD and role listing for one password-gated community
//! - Membership-event ingestion for the gateway relay
//! - The signed slash-command interaction endpoint

pub mod auth;
pub mod error;
pub mod routes;

use std::path::Path;
use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tokio::sync::mpsc;

use crate::interactions::SignatureVerifier;
use crate::listener::MemberUpdate;
use crate::platform::{DiscordClient, RoleDirectory};
use crate::rules::store::RuleStore;

pub use auth::{Authenticated, Passwords};
pub use error::ApiError;

/// Interaction endpoint settings
pub struct InteractionSettings {
    pub verifier: SignatureVerifier,
    pub application_id: Option<String>,
    /// Sends pages that did not fit in the first reply
    pub client: Option<Arc<DiscordClient>>,
}

/// Dashboard state shared across handlers
pub struct AppState {
    pub store: Arc<dyn RuleStore>,
    pub directory: Arc<dyn RoleDirectory>,
    /// `None` when the password file is missing: every protected route is 401
    pub passwords: Option<Passwords>,
    /// Relay secret; event ingestion is disabled without it
    pub relay_token: Option<String>,
    pub events: Option<mpsc::Sender<MemberUpdate>>,
    pub interactions: Option<InteractionSettings>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(store: Arc<dyn RuleStore>, directory: Arc<dyn RoleDirectory>) -> Self {
        Self {
            store,
            directory,
            passwords: None,
            relay_token: None,
            events: None,
            interactions: None,
        }
    }
}

/// Create the dashboard router
pub fn create_router(state: SharedState, static_dir: &Path) -> Router {
    Router::new()
        // Pages
        .route("/", get(routes::login_page))
        .route("/index.html", get(routes::dashboard_page))
        .route("/health", get(routes::health))
        // Rule API
        .route("/api/auth-guild", get(routes::api_auth_guild))
        .route("/api/guild/:community", get(routes::api_guild))
        .route("/api/roles/:community", get(routes::api_roles))
        .route(
            "/api/exclusive/:community",
            get(routes::api_list_exclusive).post(routes::api_add_exclusive),
        )
        .route(
            "/api/exclusive/:community/:trigger",
            delete(routes::api_remove_exclusive),
        )
        .route(
            "/api/family/:community",
            get(routes::api_list_family).post(routes::api_set_family),
        )
        .route("/api/family/:community/:kid", delete(routes::api_remove_family))
        // Relay and platform callbacks
        .route("/api/events/member-update", post(routes::api_member_update))
        .route("/interactions", post(routes::interactions))
        // Static files
        .nest_service("/static", tower_http::services::ServeDir::new(static_dir))
        .with_state(state)
}
