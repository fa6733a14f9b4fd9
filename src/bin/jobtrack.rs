//! jobtrack - command line front end for the sync engine
//!
//! Every command loads the local cache first, so it works offline;
//! writes that cannot reach the backend are queued and replayed on a
//! later run.
//!
//! ```bash
//! jobtrack add-application --job-title "Backend Engineer" --company Acme
//! jobtrack list applications
//! jobtrack replay
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use console::{style, Emoji};
use serde_json::Value;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use jobtrack_sync::{
    Config, ConnectivityState, Fields, FileStore, HttpRemote, Mutation, RecordType, SyncEngine,
    SyncEvent, WriteStatus,
};

static CHECK: Emoji = Emoji("✓ ", "* ");
static CROSS: Emoji = Emoji("✗ ", "x ");
static CLOUD: Emoji = Emoji("☁ ", "~ ");
static INFO: Emoji = Emoji("ℹ ", "i ");

type Engine = SyncEngine<HttpRemote, FileStore>;

#[derive(Parser)]
#[command(name = "jobtrack")]
#[command(author, version, about = "Offline-first job application tracker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.config/jobtrack/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Backend base URL
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Value sent as x-user-id
    #[arg(long, global = true)]
    user: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List records (applications or contacts)
    List {
        #[arg(default_value = "applications")]
        record_type: RecordType,
    },

    /// Track a new job application
    AddApplication {
        #[arg(long)]
        job_title: String,

        #[arg(long)]
        company: String,

        /// Application status (e.g. applied, interview, offer)
        #[arg(long, default_value = "applied")]
        status: String,

        /// Extra fields as key=value
        #[arg(short, long = "field")]
        fields: Vec<String>,
    },

    /// Add a contact
    AddContact {
        #[arg(long)]
        name: String,

        #[arg(long)]
        email: Option<String>,

        #[arg(long)]
        company: Option<String>,

        /// Extra fields as key=value
        #[arg(short, long = "field")]
        fields: Vec<String>,
    },

    /// Change fields of a record
    Update {
        record_type: RecordType,
        /// Local record id
        id: String,
        /// Fields as key=value
        #[arg(short, long = "field", required = true)]
        fields: Vec<String>,
    },

    /// Delete a record
    Delete {
        record_type: RecordType,
        /// Local record id
        id: String,
    },

    /// Replay queued operations now
    Replay,

    /// Show connectivity and the pending queue
    Status,

    /// Replace all remote data with the local records
    Push,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "jobtrack_sync=debug,info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .with_target(false)
        .init();

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(url) = cli.api_url {
        config.api.base_url = url;
    }
    if let Some(user) = cli.user {
        config.api.user_id = user;
    }

    let engine = open_engine(&config)?;
    let connectivity = engine.initialize().await;

    match cli.command {
        Commands::List { record_type } => list(&engine, record_type, connectivity).await?,
        Commands::AddApplication {
            job_title,
            company,
            status,
            fields,
        } => {
            let mut record = parse_fields(&fields)?;
            record.insert("jobTitle".into(), Value::String(job_title));
            record.insert("company".into(), Value::String(company));
            record.insert("status".into(), Value::String(status));
            let mutation = engine.create(RecordType::Application, record).await?;
            report_write("Added", RecordType::Application, &mutation);
        }
        Commands::AddContact {
            name,
            email,
            company,
            fields,
        } => {
            let mut record = parse_fields(&fields)?;
            record.insert("name".into(), Value::String(name));
            if let Some(email) = email {
                record.insert("email".into(), Value::String(email));
            }
            if let Some(company) = company {
                record.insert("company".into(), Value::String(company));
            }
            let mutation = engine.create(RecordType::Contact, record).await?;
            report_write("Added", RecordType::Contact, &mutation);
        }
        Commands::Update {
            record_type,
            id,
            fields,
        } => {
            let mutation = engine.update(record_type, &id, parse_fields(&fields)?).await?;
            report_write("Updated", record_type, &mutation);
        }
        Commands::Delete { record_type, id } => {
            let mutation = engine.delete(record_type, &id).await?;
            report_write("Deleted", record_type, &mutation);
        }
        Commands::Replay => replay(&engine, connectivity).await,
        Commands::Status => status(&engine, connectivity),
        Commands::Push => {
            if !connectivity.is_online() {
                bail!("Backend unreachable at {}", config.api.base_url);
            }
            let report = engine.bulk_sync().await?;
            println!("{} Stored {} records on the server", CHECK, style(report.succeeded).cyan());
        }
    }

    Ok(())
}

fn open_engine(config: &Config) -> Result<Engine> {
    let store = FileStore::open(&config.storage.data_dir).with_context(|| {
        format!("Failed to open data directory {}", config.storage.data_dir.display())
    })?;
    let remote = HttpRemote::new(config).context("Failed to build HTTP client")?;
    let engine = SyncEngine::with_config(remote, store, config);

    engine.subscribe(|event| match event {
        SyncEvent::OperationRejected {
            record_type,
            local_id,
            kind,
            message,
        } => {
            eprintln!(
                "{} Server rejected queued {} of {} {}: {}",
                CROSS,
                kind,
                record_type,
                style(local_id).dim(),
                message
            );
        }
        SyncEvent::StorageDegraded { message } => {
            eprintln!("{} Local storage unavailable, changes will not persist: {}", CROSS, message);
        }
        _ => {}
    });

    Ok(engine)
}

/// Parse `key=value` pairs; values that parse as JSON keep their type
fn parse_fields(pairs: &[String]) -> Result<Fields> {
    let mut fields = Fields::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("Expected key=value, got '{}'", pair);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("Empty field name in '{}'", pair);
        }
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        fields.insert(key.to_string(), value);
    }
    Ok(fields)
}

fn report_write(verb: &str, record_type: RecordType, mutation: &Mutation) {
    let id = style(&mutation.record.id).cyan();
    match mutation.status {
        WriteStatus::Synced => println!("{} {} {} {}", CHECK, verb, record_type, id),
        WriteStatus::SavedLocally => println!(
            "{} {} {} {} {}",
            CLOUD,
            verb,
            record_type,
            id,
            style("(saved locally, will sync later)").yellow()
        ),
        WriteStatus::LocalOnly => println!(
            "{} {} {} {} {}",
            CHECK,
            verb,
            record_type,
            id,
            style("(never synced)").dim()
        ),
    }
}

fn title(record_type: RecordType, fields: &Fields) -> String {
    let get = |key: &str| fields.get(key).and_then(Value::as_str).unwrap_or("?");
    match record_type {
        RecordType::Application => format!("{} @ {}", get("jobTitle"), get("company")),
        RecordType::Contact => get("name").to_string(),
    }
}

async fn list(engine: &Engine, record_type: RecordType, connectivity: ConnectivityState) -> Result<()> {
    if connectivity.is_online() {
        if let Err(e) = engine.refresh(record_type).await {
            println!("{} Showing cached data: {}", INFO, e);
        }
    }

    let records = engine.list(record_type);
    println!("{}", style(format!("{} ({})", record_type.collection(), records.len())).bold());
    println!();

    if records.is_empty() {
        println!("  {} Nothing tracked yet", INFO);
        return Ok(());
    }

    for record in &records {
        let marker = if record.is_synced() {
            style("●").green()
        } else {
            style("○").yellow()
        };
        let status = record
            .field_str("status")
            .map(|s| style(format!("[{}]", s)).dim().to_string())
            .unwrap_or_default();
        println!(
            "  {} {} {} {}",
            marker,
            style(&record.id).dim(),
            title(record_type, &record.fields),
            status
        );
    }
    Ok(())
}

async fn replay(engine: &Engine, connectivity: ConnectivityState) {
    if engine.pending_count() == 0 {
        println!("{} Nothing to replay", CHECK);
        return;
    }
    if !connectivity.is_online() {
        println!(
            "{} Backend unreachable; {} operations stay queued",
            CLOUD,
            engine.pending_count()
        );
        return;
    }

    // initialize() already replayed once on reconnect; run again for
    // anything queued since
    let report = engine.replay_pending().await;
    println!(
        "{} {} synced, {} rejected, {} remaining",
        CHECK,
        style(report.succeeded).green(),
        style(report.failed).red(),
        report.remaining
    );
}

fn status(engine: &Engine, connectivity: ConnectivityState) {
    let state = match connectivity {
        ConnectivityState::Online => style("online").green(),
        ConnectivityState::Offline => style("offline").red(),
        ConnectivityState::Unknown => style("unknown").yellow(),
    };
    println!("{} {}", style("Backend:").bold(), state);
    println!(
        "{} {} applications, {} contacts cached",
        style("Cache:").bold(),
        engine.list(RecordType::Application).len(),
        engine.list(RecordType::Contact).len()
    );
    if engine.storage_degraded() {
        println!("{} {}", CROSS, style("Local storage unavailable this session").red());
    }

    let pending = engine.pending();
    println!("{} {} queued", style("Pending:").bold(), pending.len());
    for op in &pending {
        println!(
            "  {} {} {} {}",
            style(op.enqueued_at.format("%Y-%m-%d %H:%M:%S")).dim(),
            style(op.kind()).cyan(),
            op.record_type,
            style(&op.local_id).dim()
        );
    }
}
