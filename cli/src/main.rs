use anyhow::{bail, Context, Result};
use chatsync_core::{Conversation, ConversationId, ConversationStore, SqliteStore};
use clap::Parser;
use clap_derive::{Parser, Subcommand};
use config::{load_env_file, PathManager, Settings};
use std::io::{self, Write};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,chatsync_core=info";

#[derive(Parser, Debug)]
#[command(name = "chatsync", author, version, about = "Inspect captured conversations")]
struct Args {
    /// Conversation database (defaults to the settings file, then the data dir)
    #[arg(long, env = "CHATSYNC_DB")]
    db: Option<PathBuf>,

    /// Log to stderr
    #[arg(long, short)]
    tracing: bool,

    /// Also log to a daily file under the data dir
    #[arg(long)]
    log_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Conversations, most recently active first
    List {
        #[arg(long)]
        platform: Option<String>,
    },
    /// Print one conversation
    Show { id: String },
    /// Delete one conversation
    Delete { id: String },
    /// Dump every conversation as JSON
    Export {
        #[arg(long, short)]
        out: Option<PathBuf>,
    },
}

fn setup_tracing(stderr: bool, log_file: bool) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let stderr_layer = stderr.then(|| fmt::layer().with_writer(io::stderr));

    let (file_layer, guard) = if log_file {
        let log_dir = PathManager::logs_dir().context("no data directory for logs")?;
        PathManager::ensure_dirs_exist()?;
        let appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "chatsync.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        (
            Some(fmt::layer().with_writer(non_blocking).with_ansi(false)),
            Some(guard),
        )
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(guard)
}

fn format_time(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

async fn find(store: &SqliteStore, id: &str) -> Result<Conversation> {
    let id = ConversationId::from(id);
    match store.get_by_id(&id).await? {
        Some(conversation) => Ok(conversation),
        None => bail!("no conversation with id {}", id),
    }
}

async fn list(store: &SqliteStore, platform: Option<&str>) -> Result<()> {
    let conversations = store.list_all().await?;
    let mut out = io::stdout().lock();
    for c in conversations
        .iter()
        .filter(|c| platform.is_none_or(|p| c.platform == p))
    {
        writeln!(
            out,
            "{}  {}  {:<10} {:>4}  {}",
            c.conversation_id,
            format_time(c.last_activity()),
            c.platform,
            c.messages.len(),
            c.title
        )?;
    }
    Ok(())
}

async fn show(store: &SqliteStore, id: &str) -> Result<()> {
    let conversation = find(store, id).await?;
    let mut out = io::stdout().lock();
    writeln!(out, "{}", conversation.title)?;
    writeln!(out, "{} ({})", conversation.link, conversation.platform)?;
    if let Some(external_id) = &conversation.external_id {
        writeln!(out, "external id: {}", external_id)?;
    }
    writeln!(
        out,
        "created {}, updated {}",
        format_time(conversation.created_at),
        format_time(conversation.updated_at)
    )?;
    for message in &conversation.messages {
        writeln!(out)?;
        writeln!(out, "[{}] {}", message.sender.as_str(), message.message_id)?;
        if let Some(thinking) = &message.thinking {
            writeln!(out, "(thinking) {}", thinking)?;
        }
        writeln!(out, "{}", message.content)?;
    }
    Ok(())
}

async fn delete(store: &SqliteStore, id: &str) -> Result<()> {
    let conversation = find(store, id).await?;
    store.delete(&conversation.conversation_id).await?;
    tracing::info!("deleted {} ({})", conversation.conversation_id, conversation.link);
    println!("Deleted \"{}\"", conversation.title);
    Ok(())
}

async fn export(store: &SqliteStore, out: Option<PathBuf>) -> Result<()> {
    let conversations = store.list_all().await?;
    let json = serde_json::to_string_pretty(&conversations)?;
    match out {
        Some(path) => {
            std::fs::write(&path, json)
                .with_context(|| format!("writing {}", path.display()))?;
            eprintln!("Exported {} conversations to {}", conversations.len(), path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env_file();
    let args = Args::parse();
    let _guard = setup_tracing(args.tracing, args.log_file)?;

    let settings = Settings::load();
    let db = args
        .db
        .or_else(|| settings.db_path())
        .context("could not determine the database location; pass --db")?;
    tracing::debug!("using database {}", db.display());
    let store = SqliteStore::open(&db);

    match args.command {
        Command::List { platform } => list(&store, platform.as_deref()).await,
        Command::Show { id } => show(&store, &id).await,
        Command::Delete { id } => delete(&store, &id).await,
        Command::Export { out } => export(&store, out).await,
    }
}
