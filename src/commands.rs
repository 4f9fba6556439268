//! Slash command surface
//!
//! A static table of the rule commands, the dispatcher that runs them
//! against the rule store, and the text rendering of their replies.
//!
//! | command            | options                   |
//! |--------------------|---------------------------|
//! | `exclusive`        | trigger, remove           |
//! | `exclusive-list`   |                           |
//! | `exclusive-remove` | trigger, remove (opt.)    |
//! | `family`           | kid, parent               |
//! | `family-list`      |                           |
//! | `family-remove`    | kid                       |
//!
//! Every command requires administrator permission.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::json;
use tracing::{error, info};

use crate::error::RuleError;
use crate::platform::{RoleDirectory, RoleNames};
use crate::rules::store::RuleStore;
use crate::rules::{CommunityId, RoleId};

/// Platform message length limit
pub const MESSAGE_LIMIT: usize = 2000;
/// Room kept free on every page for its header line
const PAGE_HEADER_RESERVE: usize = 64;

pub const NO_PERMISSION: &str = "🚫 You don’t have permission to use this command.";
pub const COMMAND_FAILED: &str = "There was an error executing that command.";

/// Role option of a command
pub struct OptionSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub required: bool,
}

pub struct CommandSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub options: &'static [OptionSpec],
}

pub static COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "exclusive",
        description: "Define a logic gate: IF this role is added, THEN remove another",
        options: &[
            OptionSpec {
                name: "trigger",
                description: "The role that triggers removal",
                required: true,
            },
            OptionSpec {
                name: "remove",
                description: "The role to remove when trigger is added",
                required: true,
            },
        ],
    },
    CommandSpec {
        name: "exclusive-list",
        description: "List all exclusive logic gates",
        options: &[],
    },
    CommandSpec {
        name: "exclusive-remove",
        description: "Delete a logic gate (or all gates of a trigger)",
        options: &[
            OptionSpec {
                name: "trigger",
                description: "The trigger role",
                required: true,
            },
            OptionSpec {
                name: "remove",
                description: "Only delete the gate removing this role",
                required: false,
            },
        ],
    },
    CommandSpec {
        name: "family",
        description: "Link one Kid role to one Parent role",
        options: &[
            OptionSpec {
                name: "kid",
                description: "The Kid role",
                required: true,
            },
            OptionSpec {
                name: "parent",
                description: "The Parent role",
                required: true,
            },
        ],
    },
    CommandSpec {
        name: "family-list",
        description: "List all Parent roles and their linked Kid roles",
        options: &[],
    },
    CommandSpec {
        name: "family-remove",
        description: "Unlink a Kid role from its Parent role",
        options: &[OptionSpec {
            name: "kid",
            description: "The Kid role",
            required: true,
        }],
    },
];

/// Command table in the platform's bulk-registration format
pub fn registration_payload() -> serde_json::Value {
    const CHAT_INPUT: u8 = 1;
    const ROLE_OPTION: u8 = 8;
    const ADMINISTRATOR: &str = "8";

    COMMANDS
        .iter()
        .map(|def| {
            let options: Vec<serde_json::Value> = def
                .options
                .iter()
                .map(|o| {
                    json!({
                        "type": ROLE_OPTION,
                        "name": o.name,
                        "description": o.description,
                        "required": o.required,
                    })
                })
                .collect();
            json!({
                "name": def.name,
                "description": def.description,
                "type": CHAT_INPUT,
                "default_member_permissions": ADMINISTRATOR,
                "options": options,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ExclusiveAdd { trigger: RoleId, conflict: RoleId },
    ExclusiveList,
    ExclusiveRemove { trigger: RoleId, conflict: Option<RoleId> },
    FamilyAdd { kid: RoleId, parent: RoleId },
    FamilyList,
    FamilyRemove { kid: RoleId },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    Unknown(String),

    #[error("Missing option '{option}' for command {command}")]
    MissingOption {
        command: &'static str,
        option: &'static str,
    },
}

impl Command {
    /// Build a command from its name and `option name → role id` values
    pub fn parse(name: &str, options: &HashMap<String, String>) -> Result<Self, CommandError> {
        let def = COMMANDS
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| CommandError::Unknown(name.to_string()))?;

        let opt = |option: &'static str| options.get(option).map(|v| RoleId::from(v.as_str()));
        let req = |option: &'static str| {
            opt(option).ok_or(CommandError::MissingOption {
                command: def.name,
                option,
            })
        };

        Ok(match def.name {
            "exclusive" => Command::ExclusiveAdd {
                trigger: req("trigger")?,
                conflict: req("remove")?,
            },
            "exclusive-list" => Command::ExclusiveList,
            "exclusive-remove" => Command::ExclusiveRemove {
                trigger: req("trigger")?,
                conflict: opt("remove"),
            },
            "family" => Command::FamilyAdd {
                kid: req("kid")?,
                parent: req("parent")?,
            },
            "family-list" => Command::FamilyList,
            "family-remove" => Command::FamilyRemove { kid: req("kid")? },
            other => return Err(CommandError::Unknown(other.to_string())),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::ExclusiveAdd { .. } => "exclusive",
            Command::ExclusiveList => "exclusive-list",
            Command::ExclusiveRemove { .. } => "exclusive-remove",
            Command::FamilyAdd { .. } => "family",
            Command::FamilyList => "family-list",
            Command::FamilyRemove { .. } => "family-remove",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub community: CommunityId,
    pub invoker_is_admin: bool,
    pub command: Command,
}

/// Reply text, one entry per message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reply {
    pub pages: Vec<String>,
    pub ephemeral: bool,
}

impl Reply {
    fn public(text: impl Into<String>) -> Self {
        Self {
            pages: vec![text.into()],
            ephemeral: false,
        }
    }

    fn private(text: impl Into<String>) -> Self {
        Self {
            pages: vec![text.into()],
            ephemeral: true,
        }
    }

    pub fn first(&self) -> &str {
        self.pages.first().map(String::as_str).unwrap_or_default()
    }
}

/// Run one command. Never fails: errors become ephemeral replies.
pub async fn dispatch(
    store: &dyn RuleStore,
    directory: &dyn RoleDirectory,
    invocation: Invocation,
) -> Reply {
    if !invocation.invoker_is_admin {
        return Reply::private(NO_PERMISSION);
    }

    let community = invocation.community;
    let name = invocation.command.name();
    match run(store, directory, &community, invocation.command).await {
        Ok(reply) => reply,
        Err(RuleError::Validation(reason)) => Reply::private(format!("❌ {reason}")),
        Err(e) => {
            error!(%community, command = name, error = %e, "Command failed");
            Reply::private(COMMAND_FAILED)
        }
    }
}

async fn run(
    store: &dyn RuleStore,
    directory: &dyn RoleDirectory,
    community: &CommunityId,
    command: Command,
) -> Result<Reply, RuleError> {
    match command {
        Command::ExclusiveAdd { trigger, conflict } => {
            let inserted = store.add_exclusive(community, &trigger, &conflict).await?;
            let gate = format!("**IF** {} **THEN REMOVE** {}", mention(&trigger), mention(&conflict));
            if inserted {
                info!(%community, %trigger, %conflict, "Logic gate added by command");
                Ok(Reply::public(format!("✅ Logic gate added:\n{gate}")))
            } else {
                Ok(Reply::private(format!("⚠️ Logic gate already exists:\n{gate}")))
            }
        }
        Command::ExclusiveList => {
            let table = store.list_exclusive(community).await?;
            if table.is_empty() {
                return Ok(Reply::private("📭 No exclusive gates found."));
            }
            let names = RoleNames::load(directory, community).await;
            Ok(Reply {
                pages: render_exclusive_list(&table, &names),
                ephemeral: true,
            })
        }
        Command::ExclusiveRemove { trigger, conflict } => {
            let removed = store
                .remove_exclusive(community, &trigger, conflict.as_ref())
                .await?;
            Ok(match (removed, conflict) {
                (false, _) => Reply::private("⚠️ No such rule."),
                (true, Some(conflict)) => Reply::public(format!(
                    "🗑️ Logic gate removed:\n**IF** {} **THEN REMOVE** {}",
                    mention(&trigger),
                    mention(&conflict)
                )),
                (true, None) => Reply::public(format!(
                    "🗑️ All logic gates for {} removed.",
                    mention(&trigger)
                )),
            })
        }
        Command::FamilyAdd { kid, parent } => {
            let previous = store.set_family(community, &kid, &parent).await?;
            let names = RoleNames::load(directory, community).await;
            let mut text = format!(
                "✅ Linked **{}** to parent role: **{}**",
                names.name(&kid),
                names.name(&parent)
            );
            if let Some(old) = previous.filter(|old| old != &parent) {
                text.push_str(&format!(" (replaced previous parent **{}**)", names.name(&old)));
            }
            Ok(Reply::public(text))
        }
        Command::FamilyList => {
            let table = store.list_family(community).await?;
            if table.is_empty() {
                return Ok(Reply::private("📭 No family links found."));
            }
            let names = RoleNames::load(directory, community).await;
            Ok(Reply {
                pages: render_family_list(&table, &names),
                ephemeral: true,
            })
        }
        Command::FamilyRemove { kid } => {
            if !store.remove_family(community, &kid).await? {
                return Ok(Reply::private("⚠️ No such rule."));
            }
            let names = RoleNames::load(directory, community).await;
            Ok(Reply::public(format!(
                "🗑️ Unlinked **{}** from its parent role.",
                names.name(&kid)
            )))
        }
    }
}

fn mention(role: &RoleId) -> String {
    format!("<@&{role}>")
}

pub fn render_exclusive_list(table: &crate::rules::ExclusiveTable, names: &RoleNames) -> Vec<String> {
    let blocks: Vec<String> = table
        .iter()
        .map(|(trigger, conflicts)| {
            let lines: Vec<String> = conflicts
                .iter()
                .map(|c| format!("   ❌ {}", names.name(c)))
                .collect();
            format!("🎯 **{}**\n{}", names.name(trigger), lines.join("\n"))
        })
        .collect();

    let pages = pack_pages(&blocks, MESSAGE_LIMIT - PAGE_HEADER_RESERVE);
    pages
        .into_iter()
        .enumerate()
        .map(|(i, page)| {
            if i == 0 {
                format!("📜 Exclusive Logic Gates:\n\n{page}")
            } else {
                page
            }
        })
        .collect()
}

pub fn render_family_list(table: &crate::rules::FamilyTable, names: &RoleNames) -> Vec<String> {
    let blocks: Vec<String> = table
        .grouped_by_parent()
        .into_iter()
        .map(|(parent, kids)| {
            let lines: Vec<String> = kids
                .iter()
                .map(|k| format!("   👶 {}", names.name(k)))
                .collect();
            format!("👑 **{}** (Parent):\n{}", names.name(parent), lines.join("\n"))
        })
        .collect();

    let pages = pack_pages(&blocks, MESSAGE_LIMIT - PAGE_HEADER_RESERVE);
    let total = pages.len();
    pages
        .into_iter()
        .enumerate()
        .map(|(i, page)| format!("--- Family Links (Page {}/{}) ---\n\n{}", i + 1, total, page))
        .collect()
}

/// Join blocks with blank lines into pages of at most `limit` characters.
/// A block longer than `limit` gets a page of its own.
fn pack_pages(blocks: &[String], limit: usize) -> Vec<String> {
    let mut pages = Vec::new();
    let mut current = String::new();

    for block in blocks {
        let needed = if current.is_empty() {
            block.chars().count()
        } else {
            current.chars().count() + 2 + block.chars().count()
        };
        if needed > limit && !current.is_empty() {
            pages.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(block);
    }
    if !current.is_empty() {
        pages.push(current);
    }
    pages
}
