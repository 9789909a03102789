use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tracing_subscriber::{fmt, EnvFilter};

use digestscope::clock::SystemClock;
use digestscope::config::Config;
use digestscope::export::SnapshotWriter;
use digestscope::session::Session;

/// Relays recorded page instrumentation through a broker into a collector
/// and prints the derived series.
#[derive(Parser)]
#[command(name = "digestscope", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Newline-delimited producer messages. Reads stdin when omitted.
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Write the final snapshot here instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Page identity to replay under; overrides the config.
    #[arg(long)]
    page_id: Option<u64>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("digestscope {}", version::full());
        return Ok(());
    }

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(level) = &cli.log_level {
        cfg.log_level = level.clone();
    }
    if let Some(page_id) = cli.page_id {
        cfg.page_id = page_id;
    }

    // Logs go to stderr so stdout carries only the snapshot.
    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting digestscope",
    );

    // Single-threaded: every component is a cooperative event loop.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg, cli.input, cli.output))
}

async fn run(cfg: Config, input: Option<PathBuf>, output: Option<PathBuf>) -> Result<()> {
    let mut session = Session::new(cfg, Arc::new(SystemClock))?;
    session.start().await?;

    let replayed = tokio::select! {
        res = replay(&session, input) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
            Ok(())
        }
    };

    let snapshot = session.snapshot();
    session.stop().await?;
    replayed?;

    SnapshotWriter::new(output).write(&snapshot)?;

    tracing::info!("digestscope stopped");

    Ok(())
}

async fn replay(session: &Session, input: Option<PathBuf>) -> Result<()> {
    match input {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("opening input {}", path.display()))?;
            session.replay(BufReader::new(file)).await?;
        }
        None => {
            session.replay(BufReader::new(tokio::io::stdin())).await?;
        }
    }
    Ok(())
}
