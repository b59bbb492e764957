//! Jobmirror CLI
//!
//! Run with: jobmirror run

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jobmirror::config::{default_config_path, expand_path, SyncConfig, CONFIG_KEY};
use jobmirror::remote::{MemoryMirror, RemoteMirror};
use jobmirror::server::StatusServer;
use jobmirror::storage::{Storage, StorageMode, StoreConfig};
use jobmirror::sync::SyncService;

#[derive(Parser, Debug)]
#[command(name = "jobmirror")]
#[command(about = "Mirror training job records into a spreadsheet")]
#[command(version)]
struct Cli {
    /// Config document (JSON, settings under the "sync" key)
    #[arg(long, global = true, env = "JOBMIRROR_CONFIG")]
    config: Option<String>,

    /// Database path
    #[arg(
        long,
        global = true,
        env = "JOBMIRROR_DB_PATH",
        default_value = "~/.local/share/jobmirror/jobs.db"
    )]
    db_path: String,

    /// Storage mode (local or cloud-safe)
    #[arg(long, global = true, env = "JOBMIRROR_STORAGE_MODE", default_value = "local")]
    storage_mode: String,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run detection and workers until Ctrl-C
    Run {
        /// Serve /health, /status and /sync on this port
        #[arg(long, env = "JOBMIRROR_STATUS_PORT")]
        status_port: Option<u16>,
        /// Write to an in-memory mirror instead of the remote service
        #[arg(long)]
        dry_run: bool,
    },
    /// Sync every enabled table once and exit
    SyncNow {
        #[arg(long)]
        dry_run: bool,
    },
    /// Validate the configuration
    CheckConfig,
    /// Write a default "sync" block into the config document
    InitConfig {
        /// Replace an existing "sync" block
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .init();
    }
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(default_config_path)
}

fn open_storage(cli: &Cli) -> anyhow::Result<Storage> {
    let storage_mode: StorageMode = cli
        .storage_mode
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let db_path = shellexpand::tilde(&cli.db_path).to_string();
    let storage = Storage::open(StoreConfig {
        db_path: db_path.clone(),
        storage_mode,
    })
    .with_context(|| format!("opening job store at {}", db_path))?;
    Ok(storage)
}

fn build_mirror(config: &SyncConfig, dry_run: bool) -> anyhow::Result<Arc<dyn RemoteMirror>> {
    if dry_run {
        tracing::info!("dry_run_in_memory_mirror");
        return Ok(Arc::new(MemoryMirror::with_target(&config.target.target_id)));
    }

    #[cfg(feature = "sheets")]
    {
        let client = jobmirror::remote::SheetsClient::from_auth(&config.auth)
            .context("building Sheets client")?;
        Ok(Arc::new(client))
    }
    #[cfg(not(feature = "sheets"))]
    {
        bail!("built without the `sheets` feature; use --dry-run")
    }
}

fn build_service(cli: &Cli, dry_run: bool) -> anyhow::Result<SyncService> {
    let path = config_path(cli);
    let config = SyncConfig::load(&path)
        .with_context(|| format!("loading config from {}", path.display()))?;
    config.validate()?;
    let storage = open_storage(cli)?;
    let mirror = build_mirror(&config, dry_run)?;
    Ok(SyncService::new(config, Arc::new(storage), mirror)?)
}

async fn run(cli: &Cli, status_port: Option<u16>, dry_run: bool) -> anyhow::Result<()> {
    let service = Arc::new(build_service(cli, dry_run)?);
    service.start()?;

    let shutdown = CancellationToken::new();
    let server = status_port.map(|port| {
        let server = StatusServer::new(Arc::clone(&service), port);
        tokio::spawn(server.run(shutdown.clone()))
    });

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("shutdown_requested"),
            Err(e) => tracing::error!(error = %e, "ctrl_c_handler_failed"),
        }
        signal.cancel();
    });

    shutdown.cancelled().await;
    service.stop().await;
    if let Some(server) = server {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "status_server_failed"),
            Err(e) => tracing::error!(error = %e, "status_server_join_failed"),
        }
    }
    Ok(())
}

fn check_config(cli: &Cli) -> anyhow::Result<()> {
    let path = config_path(cli);
    let config = SyncConfig::load(&path)
        .with_context(|| format!("loading config from {}", path.display()))?;
    let issues = config.validation_issues();
    if issues.is_empty() {
        println!("{}: ok ({} enabled table(s))", path.display(), config.enabled_tables().len());
        return Ok(());
    }
    for issue in &issues {
        println!("  - {}", issue);
    }
    bail!("{} configuration problem(s) in {}", issues.len(), path.display())
}

fn init_config(cli: &Cli, force: bool) -> anyhow::Result<()> {
    let path = config_path(cli);
    if path.exists() && !force {
        let content = std::fs::read_to_string(&path)?;
        let document: serde_json::Value = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        if document.get(CONFIG_KEY).is_some() {
            bail!(
                "{} already has a \"{}\" block; pass --force to replace it",
                path.display(),
                CONFIG_KEY
            );
        }
    }
    SyncConfig::default().save(&path)?;
    println!("Wrote default sync config to {}", path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match &cli.command {
        Commands::Run {
            status_port,
            dry_run,
        } => run(&cli, *status_port, *dry_run).await,
        Commands::SyncNow { dry_run } => {
            let service = build_service(&cli, *dry_run)?;
            let result = service.force_full_sync().await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                bail!(result.message);
            }
            Ok(())
        }
        Commands::CheckConfig => check_config(&cli),
        Commands::InitConfig { force } => init_config(&cli, *force),
    }
}
