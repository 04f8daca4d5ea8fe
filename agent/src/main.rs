//! SitePulse Agent - telemetry agent command line.
//!
//! This binary drives the agent against an in-process page, which is useful
//! for exercising an ingestion endpoint and for checking credential setup.
//!
//! # Commands
//!
//! - `sitepulse-agent replay <script>`: Play a JSON Lines signal script through the agent
//! - `sitepulse-agent resolve`: Show where the API key and ingest URL come from
//!
//! # Environment Variables
//!
//! See the [`config`] module for available configuration options.
//!
//! [`config`]: sitepulse_agent::config

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use directories::BaseDirs;
use serde::Serialize;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sitepulse_agent::config::AgentConfig;
use sitepulse_agent::host::{ProcessEnvironment, VirtualPage};
use sitepulse_agent::identity::{
    resolve_api_key, resolve_ingest_url, FileSessionStore, GLOBAL_API_KEY, GLOBAL_INGEST_URL,
};
use sitepulse_agent::replay::{self, ReplaySignal};
use sitepulse_agent::{AgentBuilder, AgentStats};

/// Session directory name inside the platform cache directory.
const SESSION_DIR_NAME: &str = "sitepulse";

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// Page shown when `--url` is not given.
const DEFAULT_PAGE_URL: &str = "http://localhost/";

/// SitePulse Agent - client-side telemetry agent.
///
/// Plays scripted browser activity through the agent and delivers the
/// resulting events to the configured ingestion endpoint.
#[derive(Parser, Debug)]
#[command(name = "sitepulse-agent")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    SITEPULSE_API_KEY            API key sent as X-Api-Key (required)
    SITEPULSE_INGEST_URL         Ingestion endpoint (default: <page origin>/api/ingest)
    SITEPULSE_FLUSH_INTERVAL_MS  Periodic flush cadence (default: 5000)
    SITEPULSE_MAX_QUEUE_SIZE     Queue capacity (default: 500)
    RUST_LOG                     Log filter (default: info)

EXAMPLES:
    # Check credential setup
    sitepulse-agent resolve --url https://shop.example.com/

    # Replay a session against a local endpoint
    export SITEPULSE_API_KEY=pk_test
    export SITEPULSE_INGEST_URL=http://localhost:8080/api/ingest
    sitepulse-agent replay session.jsonl --url https://shop.example.com/
")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Play a JSON Lines signal script through the agent.
    ///
    /// Prints delivery statistics as JSON when the script ends.
    Replay {
        /// Script with one signal per line.
        script: PathBuf,

        /// Initial page URL.
        #[arg(short, long, default_value = DEFAULT_PAGE_URL)]
        url: String,

        /// JSON options file (camelCase keys); defaults to SITEPULSE_* variables.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory holding the session identifier between runs.
        #[arg(long)]
        session_dir: Option<PathBuf>,
    },

    /// Show which sources provide the API key and ingest URL.
    ///
    /// Exits non-zero when the agent would stay inert.
    Resolve {
        /// Page URL used for the fallback ingest URL.
        #[arg(short, long)]
        url: Option<String>,
    },
}

/// Summary printed after a replay.
#[derive(Serialize)]
struct ReplaySummary {
    session_id: String,
    signals: usize,
    remaining: usize,
    batch_supported: bool,
    #[serde(flatten)]
    stats: AgentStats,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Command::Resolve { url } => Ok(run_resolve(url)),
        Command::Replay {
            script,
            url,
            config,
            session_dir,
        } => {
            init_logging(cli.log_json);

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to create tokio runtime")?;

            runtime.block_on(run_replay(script, url, config, session_dir))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Prints credential sources without revealing the key.
fn run_resolve(url: Option<String>) -> ExitCode {
    let env = ProcessEnvironment::new(url);
    let api_key = resolve_api_key(None, &env);
    let ingest_url = resolve_ingest_url(None, &env);

    match &api_key {
        Some((_, source)) => println!("API key:    found ({source:?})"),
        None => println!("API key:    not found (set {GLOBAL_API_KEY})"),
    }
    match &ingest_url {
        Some((url, source)) => println!("Ingest URL: {url} ({source:?})"),
        None => println!("Ingest URL: not found (set {GLOBAL_INGEST_URL} or pass --url)"),
    }

    if api_key.is_some() && ingest_url.is_some() {
        println!("Agent would be active.");
        ExitCode::SUCCESS
    } else {
        println!("Agent would stay inert.");
        ExitCode::FAILURE
    }
}

/// Runs the replay command.
async fn run_replay(
    script: PathBuf,
    url: String,
    config_path: Option<PathBuf>,
    session_dir: Option<PathBuf>,
) -> Result<()> {
    let config = match &config_path {
        Some(path) => AgentConfig::from_json_file(path)
            .with_context(|| format!("Failed to load options from {}", path.display()))?,
        None => AgentConfig::from_env().context("Failed to load configuration")?,
    };

    let file = File::open(&script)
        .with_context(|| format!("Failed to open script {}", script.display()))?;
    let signals = replay::parse_script(BufReader::new(file))
        .with_context(|| format!("Failed to parse script {}", script.display()))?;

    let session_dir = match session_dir {
        Some(dir) => dir,
        None => default_session_dir()?,
    };

    let mut page = VirtualPage::new(url.clone())
        .with_session_store(Arc::new(FileSessionStore::new(&session_dir)));
    for name in [GLOBAL_API_KEY, GLOBAL_INGEST_URL] {
        if let Ok(value) = std::env::var(name) {
            page = page.with_global(name, value);
        }
    }
    let page = Arc::new(page);

    let agent = AgentBuilder::new(config).page(Arc::clone(&page)).build();
    if !agent.is_active() {
        anyhow::bail!("No API key resolved; set {GLOBAL_API_KEY} (see `sitepulse-agent resolve`)");
    }

    info!(
        script = %script.display(),
        signals = signals.len(),
        url = %url,
        session_dir = %session_dir.display(),
        "Starting replay"
    );
    agent.start();

    let total = signals.len();
    let playback = async {
        for signal in signals {
            replay::play(&page, signal).await;
            // Let spawned flushes make progress between signals
            tokio::task::yield_now().await;
        }
    };

    tokio::select! {
        _ = wait_for_shutdown() => {
            warn!("Shutdown signal received, stopping replay early");
        }
        () = playback => {
            info!("Replay finished");
        }
    }

    // Page teardown: hand the remaining events to a keepalive flush
    replay::play(&page, ReplaySignal::Hide).await;

    let remaining = agent
        .shutdown(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS))
        .await;
    if remaining > 0 {
        error!(unflushed_events = remaining, "Some events could not be sent");
    }

    let summary = ReplaySummary {
        session_id: agent.session_id(),
        signals: total,
        remaining,
        batch_supported: agent.batch_supported(),
        stats: agent.stats(),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("Failed to serialize summary")?
    );

    Ok(())
}

/// Initializes the tracing subscriber with environment-based filtering.
fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

/// Gets the default session directory inside the platform cache directory.
fn default_session_dir() -> Result<PathBuf> {
    let base_dirs = BaseDirs::new().context("Failed to determine home directory")?;
    Ok(base_dirs.cache_dir().join(SESSION_DIR_NAME))
}
