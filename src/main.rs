//! Ransomwatch - runtime ransomware defense agent for Linux
//!
//! # Usage
//!
//! ```bash
//! # Monitor the configured directories
//! sudo ransomwatch run
//!
//! # Monitor specific directories
//! sudo ransomwatch run --path /srv/share --path /home
//!
//! # One scoring pass over running processes
//! ransomwatch score
//!
//! # Let a suspended process continue
//! sudo ransomwatch resume 4321
//! ```

use clap::{Parser, Subcommand};
use ransomwatch::config::Config;
use ransomwatch::detector::{CandidateScorer, ProcfsTable};
use ransomwatch::response::{ProcessController, SignalController};
use ransomwatch::Agent;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ransomwatch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/ransomwatch/config.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor directories and respond to mass encryption
    Run {
        /// Directory to monitor (repeatable; replaces the configured list)
        #[arg(short, long = "path")]
        paths: Vec<PathBuf>,
    },

    /// Run one scoring pass and print the candidates
    Score {
        /// CPU sampling interval in milliseconds
        #[arg(short, long)]
        interval_ms: Option<u64>,
    },

    /// Stop a process (SIGSTOP)
    Suspend {
        pid: u32,
    },

    /// Continue a stopped process (SIGCONT)
    Resume {
        pid: u32,
    },

    /// Terminate a process (SIGKILL) and wait for it to exit
    Kill {
        pid: u32,
    },

    /// Show configuration
    Config,
}

fn setup_logging(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        info!("Using default configuration");
        return Ok(Config::default());
    }
    Config::load(path).map_err(|e| {
        error!("Failed to load config {:?}: {}", path, e);
        e
    })
}

/// Cancel on SIGINT or SIGTERM
fn shutdown_token() -> anyhow::Result<CancellationToken> {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
        token.cancel();
    });

    Ok(cancel)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.json);

    let mut config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run { paths } => {
            if !paths.is_empty() {
                config.watch = paths;
            }
            info!("Starting ransomwatch...");
            let cancel = shutdown_token()?;
            Agent::new(config).run(cancel).await?;
        }

        Commands::Score { interval_ms } => {
            let interval = interval_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.scoring.sample_interval());
            let scorer = CandidateScorer::new(Arc::new(ProcfsTable::new()), Arc::new(config));
            let candidates = scorer.score(interval).await;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&candidates)?);
            } else if candidates.is_empty() {
                println!("No suspicious processes");
            } else {
                println!("{:>8}  {:>6}  {:>6}  {:>7}  NAME", "PID", "SCORE", "CPU%", "THREADS");
                for c in &candidates {
                    println!(
                        "{:>8}  {:>6.2}  {:>6.1}  {:>7}  {}",
                        c.pid, c.score, c.cpu_percent, c.threads, c.name
                    );
                }
            }
        }

        Commands::Suspend { pid } => {
            SignalController::new().suspend(pid)?;
            println!("Suspended process {}", pid);
        }

        Commands::Resume { pid } => {
            SignalController::new().resume(pid)?;
            println!("Resumed process {}", pid);
        }

        Commands::Kill { pid } => {
            let wait = config.engine.kill_wait();
            tokio::task::spawn_blocking(move || SignalController::new().kill(pid, wait)).await??;
            println!("Killed process {}", pid);
        }

        Commands::Config => {
            println!("{}", serde_yaml::to_string(&config)?);
        }
    }

    Ok(())
}
