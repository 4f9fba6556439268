//! rolegate - role relationship rules for chat communities
//!
//! Administrators declare two kinds of directed relationships between roles:
//!
//! - **Exclusive**: adding a trigger role removes its conflict roles
//! - **Family**: holding a kid role implies holding its parent role
//!
//! The listener enforces those rules whenever a member's role set changes.
//! A small dashboard and a slash-command surface edit the same rule set.
//!
//! ## Modules
//!
//! - **rules**: identifiers, rule tables and the persistent rule store
//! - **reconcile**: the pure engine turning a role diff into mutation intents
//! - **platform**: role lookup / role mutation capabilities and their adapters
//! - **listener**: membership-change handling around the engine
//! - **commands**: slash command table, dispatch and rendering
//! - **interactions**: signed HTTP endpoint for slash commands
//! - **dashboard**: HTTP dashboard and event ingestion

pub mod commands;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod interactions;
pub mod listener;
pub mod platform;
pub mod reconcile;
pub mod rules;

pub use config::Config;
pub use error::{Result, RuleError};
pub use listener::{BatchReport, MemberSnapshot, MemberUpdate, RoleListener};
pub use reconcile::{reconcile, ChainMode, MutationAction, MutationIntent, ReconcileOptions};
pub use rules::store::{FileRuleStore, RuleStore};
pub use rules::{CommunityId, ExclusiveTable, FamilyTable, MemberId, RoleId, RoleSet, RuleKind};
