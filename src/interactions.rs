//! Slash-command interactions over HTTP
//!
//! The platform POSTs every interaction to a public endpoint, signed with
//! the application's Ed25519 key over `timestamp ‖ body`. Verified requests
//! are decoded here: PINGs get a PONG, application commands become
//! [`Invocation`]s for the command dispatcher.

use std::collections::HashMap;

use ed25519_dalek::{Signature, VerifyingKey};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::commands::{self, Command, CommandError, Invocation, Reply};
use crate::platform::RoleDirectory;
use crate::rules::store::RuleStore;
use crate::rules::CommunityId;

pub const SIGNATURE_HEADER: &str = "X-Signature-Ed25519";
pub const TIMESTAMP_HEADER: &str = "X-Signature-Timestamp";

/// Message flag: only the invoker sees the reply
pub const EPHEMERAL_FLAG: u64 = 1 << 6;
/// Administrator bit of a permission bitfield
pub const ADMINISTRATOR: u64 = 1 << 3;

const PING: u8 = 1;
const APPLICATION_COMMAND: u8 = 2;
const PONG: u8 = 1;
const CHANNEL_MESSAGE: u8 = 4;

#[derive(Debug, thiserror::Error)]
pub enum InteractionError {
    #[error("Invalid public key: {0}")]
    InvalidKey(String),

    #[error("Invalid request signature")]
    BadSignature,

    #[error("Malformed interaction: {0}")]
    Malformed(String),

    #[error("Unsupported interaction type {0}")]
    Unsupported(u8),
}

/// Checks request signatures against the application's public key
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    key: VerifyingKey,
}

impl SignatureVerifier {
    pub fn from_hex(public_key: &str) -> Result<Self, InteractionError> {
        let bytes = hex::decode(public_key.trim())
            .map_err(|e| InteractionError::InvalidKey(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| InteractionError::InvalidKey("expected 32 bytes".to_string()))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| InteractionError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }

    pub fn verify(&self, signature_hex: &str, timestamp: &str, body: &[u8]) -> Result<(), InteractionError> {
        let sig = hex::decode(signature_hex).map_err(|_| InteractionError::BadSignature)?;
        let sig: [u8; 64] = sig.try_into().map_err(|_| InteractionError::BadSignature)?;
        let signature = Signature::from_bytes(&sig);

        let mut message = Vec::with_capacity(timestamp.len() + body.len());
        message.extend_from_slice(timestamp.as_bytes());
        message.extend_from_slice(body);

        self.key
            .verify_strict(&message, &signature)
            .map_err(|_| InteractionError::BadSignature)
    }
}

#[derive(Debug, Deserialize)]
pub struct Interaction {
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub guild_id: Option<String>,
    #[serde(default)]
    pub member: Option<InteractionMember>,
    #[serde(default)]
    pub data: Option<CommandData>,
    /// Token for follow-up messages
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct InteractionMember {
    /// Permission bitfield, serialized as a decimal string
    #[serde(default)]
    pub permissions: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CommandData {
    pub name: String,
    #[serde(default)]
    pub options: Vec<CommandOption>,
}

#[derive(Debug, Deserialize)]
pub struct CommandOption {
    pub name: String,
    pub value: Value,
}

impl Interaction {
    fn is_admin(&self) -> bool {
        self.member
            .as_ref()
            .and_then(|m| m.permissions.as_deref())
            .and_then(|p| p.parse::<u64>().ok())
            .is_some_and(|bits| bits & ADMINISTRATOR != 0)
    }

    /// Application command → dispatcher invocation
    pub fn invocation(&self) -> Result<Invocation, InteractionError> {
        let data = self
            .data
            .as_ref()
            .ok_or_else(|| InteractionError::Malformed("missing command data".to_string()))?;
        let community = self
            .guild_id
            .as_deref()
            .map(CommunityId::from)
            .ok_or_else(|| InteractionError::Malformed("command used outside a community".to_string()))?;

        let options: HashMap<String, String> = data
            .options
            .iter()
            .map(|o| {
                let value = match &o.value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (o.name.clone(), value)
            })
            .collect();

        let command = Command::parse(&data.name, &options).map_err(|e: CommandError| {
            InteractionError::Malformed(e.to_string())
        })?;

        Ok(Invocation {
            community,
            invoker_is_admin: self.is_admin(),
            command,
        })
    }
}

/// Response body plus pages that did not fit in it
#[derive(Debug)]
pub struct Handled {
    pub response: Value,
    pub follow_ups: Vec<String>,
    pub ephemeral: bool,
}

/// Decode and run one verified interaction
pub async fn handle(
    store: &dyn RuleStore,
    directory: &dyn RoleDirectory,
    body: &[u8],
) -> Result<(Interaction, Handled), InteractionError> {
    let interaction: Interaction =
        serde_json::from_slice(body).map_err(|e| InteractionError::Malformed(e.to_string()))?;

    let handled = match interaction.kind {
        PING => Handled {
            response: json!({ "type": PONG }),
            follow_ups: Vec::new(),
            ephemeral: false,
        },
        APPLICATION_COMMAND => {
            let invocation = interaction.invocation()?;
            debug!(
                community = %invocation.community,
                command = invocation.command.name(),
                "Dispatching interaction"
            );
            let reply = commands::dispatch(store, directory, invocation).await;
            message_response(reply)
        }
        other => return Err(InteractionError::Unsupported(other)),
    };
    Ok((interaction, handled))
}

fn message_response(reply: Reply) -> Handled {
    let mut pages = reply.pages.into_iter();
    let first = pages.next().unwrap_or_default();
    Handled {
        response: json!({
            "type": CHANNEL_MESSAGE,
            "data": {
                "content": first,
                "flags": if reply.ephemeral { EPHEMERAL_FLAG } else { 0 },
            },
        }),
        follow_ups: pages.collect(),
        ephemeral: reply.ephemeral,
    }
}
