//! # Courier — notification dispatch and chat account-linking
//!
//! Usage:
//!   courier                                  # Serve the linking webhook (default)
//!   courier serve
//!   courier issue-link-token --user 7 --ttl-hours 48
//!   courier seed-contact --user 7 --name "Kim Dao" --email kim@example.com
//!   courier notify task_assigned --user 7 --payload '{"title": "Audit Q3"}'
//!   courier deliveries --limit 20

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use courier_channels::{ChatTransport, MailTransport};
use courier_core::config::CourierConfig;
use courier_core::traits::{ChatChannel, MailChannel, ReminderScheduler};
use courier_core::types::{ContactRecord, NotificationEvent};
use courier_dispatch::{Dispatcher, TemplateRegistry};
use courier_gateway::LinkService;
use courier_store::SqliteStore;

#[derive(Parser)]
#[command(
    name = "courier",
    version,
    about = "📮 Courier — portal notification dispatch & chat account linking"
)]
struct Cli {
    /// Config file path (default: ~/.courier/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the account-linking webhook (default)
    Serve,
    /// Create a single-use chat-linking token for a user
    IssueLinkToken {
        /// Portal user id the token binds to
        #[arg(long)]
        user: i64,
        /// Hours until the token expires; omit for a token that never expires
        #[arg(long)]
        ttl_hours: Option<i64>,
    },
    /// Create or update a directory contact
    SeedContact {
        #[arg(long)]
        user: i64,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "staff")]
        role: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        chat_username: Option<String>,
    },
    /// Dispatch one event to explicit users or a role, end to end
    Notify {
        /// Event kind, e.g. task_assigned, event_reminder
        event: String,
        /// Recipient user id; repeatable
        #[arg(long = "user")]
        users: Vec<i64>,
        /// Dispatch to an organizational role instead of explicit users
        #[arg(long, conflicts_with = "users")]
        role: Option<String>,
        /// Event payload as a JSON object
        #[arg(long, default_value = "{}")]
        payload: String,
    },
    /// Show recent delivery-log entries
    Deliveries {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

/// Stand-in for the portal's reminder-scheduling collaborator: the hand-off
/// is recorded in the log so operators can see follow-ups being requested.
struct LogOnlyReminders;

#[async_trait::async_trait]
impl ReminderScheduler for LogOnlyReminders {
    async fn schedule_followup(
        &self,
        event: &NotificationEvent,
        assignee_names: &[String],
    ) -> courier_core::error::Result<()> {
        tracing::info!(
            "follow-up reminder requested for {} (assignees: {})",
            event.kind(),
            assignee_names.join(", ")
        );
        Ok(())
    }
}

fn open_store(config: &CourierConfig) -> Result<Arc<SqliteStore>> {
    let path = PathBuf::from(&config.store.db_path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(Arc::new(SqliteStore::open(&path)?))
}

fn chat_channel(config: &CourierConfig) -> Result<Option<Arc<dyn ChatChannel>>> {
    match &config.chat {
        Some(chat) => Ok(Some(Arc::new(ChatTransport::new(chat.clone())?))),
        None => Ok(None),
    }
}

fn mail_channel(config: &CourierConfig) -> Option<Arc<dyn MailChannel>> {
    config
        .mail
        .clone()
        .map(|mail| Arc::new(MailTransport::new(mail)) as Arc<dyn MailChannel>)
}

/// Build the event from its kind plus a payload object: the kind becomes the
/// tag, so any field the payload omits stays `None` and is dropped from the
/// rendered message.
fn parse_event(kind: &str, payload: &str) -> Result<NotificationEvent> {
    let mut value: serde_json::Value = serde_json::from_str(payload)?;
    if !value.is_object() {
        bail!("--payload must be a JSON object");
    }
    value["event"] = kind.into();
    serde_json::from_value(value).map_err(|e| anyhow::anyhow!("unknown event or payload: {e}"))
}

async fn serve(config: CourierConfig) -> Result<()> {
    let store = open_store(&config)?;
    let chat = chat_channel(&config)?;
    let links = Arc::new(LinkService::new(store.clone(), store.clone(), chat));

    println!("📮 Courier v{}", env!("CARGO_PKG_VERSION"));
    println!(
        "   🌐 Webhook:  http://{}:{}{}",
        config.gateway.host, config.gateway.port, config.gateway.webhook_path
    );
    println!("   🗄️  Database: {}", config.store.db_path);
    println!();

    courier_gateway::start(&config.gateway, links).await?;
    Ok(())
}

async fn notify(
    config: CourierConfig,
    event: String,
    users: Vec<i64>,
    role: Option<String>,
    payload: String,
) -> Result<()> {
    let event = parse_event(&event, &payload)?;
    let store = open_store(&config)?;
    let dispatcher = Dispatcher::new(
        store.clone(),
        mail_channel(&config),
        chat_channel(&config)?,
        store.clone(),
        Some(Arc::new(LogOnlyReminders)),
        TemplateRegistry::new(config.portal_url.clone()),
    );

    let delivered = match role {
        Some(role) => dispatcher.dispatch_to_role(&event, &role).await,
        None => dispatcher.dispatch(&event, &users).await,
    };
    // Give the fire-and-forget reminder hand-off a beat before the process exits.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    if delivered {
        println!("✅ Delivered {} to at least one recipient", event.kind());
    } else {
        println!("❌ No delivery succeeded for {}", event.kind());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => CourierConfig::load_from(path)?,
        None => CourierConfig::load()?,
    };

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await?,
        Command::IssueLinkToken { user, ttl_hours } => {
            let store = open_store(&config)?;
            let token = store.issue_link_token(user, ttl_hours)?;
            println!("🔗 Link token for user {user}:");
            println!("   Send to the bot:  /start {}", token.token);
            match token.expires_at {
                Some(at) => println!("   Expires:          {at}"),
                None => println!("   Expires:          never"),
            }
        }
        Command::SeedContact {
            user,
            name,
            role,
            email,
            chat_username,
        } => {
            let store = open_store(&config)?;
            store.upsert_contact(&ContactRecord {
                user_id: user,
                display_name: name.clone(),
                role,
                email,
                chat_username: chat_username.map(|u| u.trim_start_matches('@').to_string()),
                ..Default::default()
            })?;
            println!("✅ Contact {user} ({name}) saved");
        }
        Command::Notify {
            event,
            users,
            role,
            payload,
        } => notify(config, event, users, role, payload).await?,
        Command::Deliveries { limit } => {
            let store = open_store(&config)?;
            for entry in store.recent_deliveries(limit)? {
                println!(
                    "{}  {:5}  {:22}  ok={} failed={}  {}",
                    entry.sent_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.channel,
                    entry.event_kind,
                    entry.successful_count,
                    entry.failed_count,
                    entry.recipients.join(", ")
                );
            }
        }
    }
    Ok(())
}
