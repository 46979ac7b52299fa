//! Ransomwatch - runtime ransomware defense for Linux hosts
//!
//! Watches directory trees for bursts of file modification and for renames
//! to known ransom extensions. When either fires, running processes are
//! scored by suspicion and the most likely culprit is suspended with
//! SIGSTOP, at most once per process.
//!
//! # Example
//!
//! ```rust,no_run
//! use ransomwatch::{Agent, Config};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let agent = Agent::new(Config::default());
//!     agent.run(CancellationToken::new()).await
//! }
//! ```

pub mod clock;
pub mod config;
pub mod detector;
pub mod engine;
pub mod response;
pub mod watcher;

pub use config::Config;
pub use engine::Engine;
pub use response::{AlertRecord, AlertSink};
pub use watcher::Watcher;

use detector::ProcfsTable;
use response::{SignalController, TracingSink};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use watcher::ScopeSet;

/// Watcher and engine wired together with the Linux backends
pub struct Agent {
    config: Arc<Config>,
    sink: Arc<dyn AlertSink>,
}

impl Agent {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            sink: Arc::new(TracingSink),
        }
    }

    /// Monitor until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        if !nix::unistd::geteuid().is_root() {
            warn!("Not running as root - suspending other users' processes will fail");
        }

        let scopes = ScopeSet::from_dirs(&self.config.watch);
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = Watcher::start(&self.config, scopes, tx, cancel.child_token())?;
        if !watcher.attributes_pids() {
            info!("Events carry no pid; only the global window is effective");
        }

        let engine = Engine::new(
            self.config.clone(),
            Arc::new(ProcfsTable::new()),
            Arc::new(SignalController::new()),
            self.sink.clone(),
        )
        .with_event_sources(&watcher.sources());
        engine.run(rx, cancel).await;

        watcher.stop().await;
        Ok(())
    }
}
