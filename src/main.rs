//! rolegate: role relationship rules for chat communities
//!
//! Runs the role listener and the dashboard, or performs one-off rule
//! maintenance from the command line:
//!
//! - `serve` (default): listener, dashboard API, event ingestion, interactions
//! - `rules <op>`: inspect or edit one community's rules
//! - `migrate`: import the legacy per-file rule layout
//! - `register-commands`: install the slash commands in a community

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rolegate::commands::{self, Command, Invocation};
use rolegate::config::Config;
use rolegate::dashboard::{create_router, AppState, InteractionSettings, Passwords};
use rolegate::interactions::SignatureVerifier;
use rolegate::listener::RoleListener;
use rolegate::platform::{
    CachedDirectory, DiscordClient, MemoryPlatform, RoleDirectory, RoleEffector,
};
use rolegate::rules::legacy;
use rolegate::rules::store::{FileRuleStore, RuleStore};
use rolegate::rules::{CommunityId, RoleId};

/// Queue depth between event ingestion and the listener
const EVENT_QUEUE: usize = 1024;

#[derive(Parser)]
#[command(name = "rolegate")]
#[command(about = "Exclusive and family role rules for chat communities")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "ROLEGATE_CONFIG", default_value = "rolegate.toml")]
    config: PathBuf,

    /// Rule data directory
    #[arg(short, long, env = "ROLEGATE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Dashboard listen address
    #[arg(long, env = "ROLEGATE_LISTEN")]
    listen: Option<SocketAddr>,

    /// Shared secret of the gateway relay
    #[arg(long, env = "ROLEGATE_RELAY_TOKEN", hide_env_values = true)]
    relay_token: Option<String>,

    /// Platform bot token
    #[arg(long, env = "DISCORD_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Platform application id
    #[arg(long, env = "DISCORD_APPLICATION_ID")]
    application_id: Option<String>,

    /// Hex public key for interaction verification
    #[arg(long, env = "DISCORD_PUBLIC_KEY")]
    public_key: Option<String>,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run listener and dashboard (default)
    Serve,

    /// Inspect or edit rules
    Rules {
        #[command(subcommand)]
        op: RulesOp,
    },

    /// Import the legacy per-file rule layout
    Migrate {
        #[arg(long)]
        community: String,

        /// Directory of `<trigger>.txt` files
        #[arg(long)]
        exclusive_dir: Option<PathBuf>,

        /// Directory of `<kid>.txt` files and/or family-links.json
        #[arg(long)]
        family_dir: Option<PathBuf>,
    },

    /// Overwrite a community's slash commands with ours
    RegisterCommands {
        #[arg(long)]
        community: String,
    },
}

#[derive(Subcommand)]
enum RulesOp {
    /// IF trigger is added THEN remove conflict
    ExclusiveAdd {
        community: String,
        trigger: String,
        conflict: String,
    },
    ExclusiveList {
        community: String,
    },
    /// Remove one gate, or every gate of the trigger
    ExclusiveRemove {
        community: String,
        trigger: String,
        conflict: Option<String>,
    },
    /// Link kid to parent, replacing any previous parent
    FamilySet {
        community: String,
        kid: String,
        parent: String,
    },
    FamilyList {
        community: String,
    },
    FamilyRemove {
        community: String,
        kid: String,
    },
}

impl RulesOp {
    fn into_invocation(self) -> Invocation {
        let (community, command) = match self {
            RulesOp::ExclusiveAdd { community, trigger, conflict } => (
                community,
                Command::ExclusiveAdd {
                    trigger: RoleId::from(trigger),
                    conflict: RoleId::from(conflict),
                },
            ),
            RulesOp::ExclusiveList { community } => (community, Command::ExclusiveList),
            RulesOp::ExclusiveRemove { community, trigger, conflict } => (
                community,
                Command::ExclusiveRemove {
                    trigger: RoleId::from(trigger),
                    conflict: conflict.map(RoleId::from),
                },
            ),
            RulesOp::FamilySet { community, kid, parent } => (
                community,
                Command::FamilyAdd {
                    kid: RoleId::from(kid),
                    parent: RoleId::from(parent),
                },
            ),
            RulesOp::FamilyList { community } => (community, Command::FamilyList),
            RulesOp::FamilyRemove { community, kid } => (
                community,
                Command::FamilyRemove {
                    kid: RoleId::from(kid),
                },
            ),
        };
        Invocation {
            community: CommunityId::from(community),
            invoker_is_admin: true,
            command,
        }
    }
}

/// Platform adapters selected from the configuration
struct Platform {
    directory: Arc<dyn RoleDirectory>,
    effector: Arc<dyn RoleEffector>,
    client: Option<Arc<DiscordClient>>,
}

impl Platform {
    fn from_config(config: &Config) -> anyhow::Result<Self> {
        let Some(token) = config.platform.token.as_deref() else {
            warn!("No platform token configured, using an empty in-process platform");
            let memory = Arc::new(MemoryPlatform::new());
            return Ok(Self {
                directory: memory.clone(),
                effector: memory,
                client: None,
            });
        };

        let client = Arc::new(
            DiscordClient::new(&config.platform.api_base, token, config.request_timeout())
                .context("Failed to build platform client")?,
        );
        Ok(Self {
            directory: Arc::new(CachedDirectory::new(client.clone(), config.role_cache_ttl())),
            effector: client.clone(),
            client: Some(client),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "rolegate=info".into());
    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let mut config = Config::load(&cli.config)?;

    // Apply CLI / env overrides
    if let Some(data_dir) = cli.data_dir {
        config.store.data_dir = data_dir;
    }
    if let Some(listen) = cli.listen {
        config.dashboard.listen = listen;
    }
    if cli.relay_token.is_some() {
        config.dashboard.relay_token = cli.relay_token;
    }
    if cli.token.is_some() {
        config.platform.token = cli.token;
    }
    if cli.application_id.is_some() {
        config.platform.application_id = cli.application_id;
    }
    if cli.public_key.is_some() {
        config.platform.public_key = cli.public_key;
    }

    let store = Arc::new(FileRuleStore::new(&config.store.data_dir, config.io_timeout()));

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config, store).await,
        Commands::Rules { op } => {
            let platform = Platform::from_config(&config)?;
            let reply = commands::dispatch(
                store.as_ref(),
                platform.directory.as_ref(),
                op.into_invocation(),
            )
            .await;
            for page in reply.pages {
                println!("{page}");
            }
            Ok(())
        }
        Commands::Migrate {
            community,
            exclusive_dir,
            family_dir,
        } => {
            let community = CommunityId::from(community);
            let summary = legacy::migrate(
                store.as_ref(),
                &community,
                exclusive_dir.as_deref(),
                family_dir.as_deref(),
            )
            .await
            .context("Legacy migration failed")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::RegisterCommands { community } => register_commands(&config, &community).await,
    }
}

async fn serve(config: Config, store: Arc<FileRuleStore>) -> anyhow::Result<()> {
    info!(data_dir = %config.store.data_dir.display(), "Starting rolegate");

    let platform = Platform::from_config(&config)?;
    let rule_store: Arc<dyn RuleStore> = store;

    let listener = Arc::new(RoleListener::new(
        rule_store.clone(),
        platform.effector.clone(),
        config.listener(),
    ));
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    let listener_task = tokio::spawn(listener.run(events_rx));

    if !config.dashboard.enabled {
        warn!("Dashboard disabled, no member updates can be received");
        drop(events_tx);
        tokio::signal::ctrl_c().await?;
        listener_task.abort();
        return Ok(());
    }

    let interactions = match config.platform.public_key.as_deref() {
        Some(key) => Some(InteractionSettings {
            verifier: SignatureVerifier::from_hex(key).context("Invalid DISCORD_PUBLIC_KEY")?,
            application_id: config.platform.application_id.clone(),
            client: platform.client.clone(),
        }),
        None => {
            info!("No public key configured, interaction endpoint disabled");
            None
        }
    };

    let state = AppState {
        passwords: Passwords::load(&config.dashboard.passwords_file),
        relay_token: config.dashboard.relay_token.clone(),
        events: Some(events_tx),
        interactions,
        ..AppState::new(rule_store, platform.directory.clone())
    };
    if state.relay_token.is_none() {
        warn!("No relay token configured, member-update ingestion disabled");
    }

    let app = create_router(Arc::new(state), &config.dashboard.static_dir);
    let addr = config.dashboard.listen;
    info!("Dashboard listening on http://{}", addr);

    let tcp = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    axum::serve(tcp, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    listener_task.abort();
    Ok(())
}

async fn register_commands(config: &Config, community: &str) -> anyhow::Result<()> {
    let token = config
        .platform
        .token
        .as_deref()
        .context("DISCORD_TOKEN is required to register commands")?;
    let application_id = config
        .platform
        .application_id
        .as_deref()
        .context("DISCORD_APPLICATION_ID is required to register commands")?;

    let client = DiscordClient::new(&config.platform.api_base, token, config.request_timeout())?;
    let community = CommunityId::from(community);
    client
        .register_commands(application_id, &community, &commands::registration_payload())
        .await
        .with_context(|| format!("Failed to register commands for {community}"))?;

    println!("Registered {} commands for {community}", commands::COMMANDS.len());
    Ok(())
}
