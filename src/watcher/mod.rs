//! File system watching module
//!
//! Uses fanotify for pid-attributed write events and inotify for path-only
//! create/write/delete/rename events. Both feeds push normalized
//! [`FileEvent`]s into one channel and never block on the consumer.

mod fanotify_watcher;
mod inotify_watcher;
pub mod scope;

pub use fanotify_watcher::FanotifyWatcher;
pub use inotify_watcher::InotifyWatcher;
pub use scope::ScopeSet;

use crate::config::Config;
use globset::GlobSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Sending half of the event channel
pub type EventSender = mpsc::UnboundedSender<FileEvent>;

/// Receiving half of the event channel
pub type EventReceiver = mpsc::UnboundedReceiver<FileEvent>;

/// File system event
#[derive(Debug, Clone)]
pub struct FileEvent {
    /// When the notification was received
    pub timestamp: Instant,
    /// Absolute path of the affected file (new path for renames)
    pub path: PathBuf,
    /// What happened
    pub operation: Operation,
    /// Process ID that caused the event (if available)
    pub pid: Option<u32>,
    /// Feed that produced the event
    pub source: SourceKind,
}

impl FileEvent {
    pub fn new(path: impl Into<PathBuf>, operation: Operation) -> Self {
        Self {
            timestamp: Instant::now(),
            path: path.into(),
            operation,
            pid: None,
            source: SourceKind::Inotify,
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn at(mut self, timestamp: Instant) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Old and new path for rename events
    pub fn rename_paths(&self) -> Option<(&Path, &Path)> {
        match &self.operation {
            Operation::Rename { from } => Some((from.as_path(), self.path.as_path())),
            _ => None,
        }
    }
}

/// Type of file system event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// File was created
    Create,
    /// File was written and closed
    Write,
    /// File was deleted
    Delete,
    /// File was renamed; the event path is the destination
    Rename { from: PathBuf },
}

/// Which feed produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Inotify,
    Fanotify,
}

/// Shared path admission rules for every feed
#[derive(Debug)]
pub struct EventFilter {
    scopes: ScopeSet,
    excluded: GlobSet,
}

impl EventFilter {
    pub fn new(scopes: ScopeSet, excluded: GlobSet) -> Self {
        Self { scopes, excluded }
    }

    pub fn scopes(&self) -> &ScopeSet {
        &self.scopes
    }

    /// Path is inside a monitored directory and not excluded
    pub fn admits(&self, path: &Path) -> bool {
        self.scopes.contains(path) && !self.excluded.is_match(path)
    }
}

/// A feed of file events
pub trait EventSource: Send {
    fn kind(&self) -> SourceKind;

    /// Start pushing events into `tx` until `cancel` fires
    fn spawn(self: Box<Self>, tx: EventSender, cancel: CancellationToken) -> JoinHandle<()>;
}

/// Unified file system watcher
pub struct Watcher {
    /// Running feeds
    tasks: Vec<(SourceKind, JoinHandle<()>)>,
    /// Stops every feed
    cancel: CancellationToken,
}

impl Watcher {
    /// Start the configured feeds over `scopes`
    pub fn start(
        config: &Config,
        scopes: ScopeSet,
        tx: EventSender,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        if scopes.is_empty() {
            anyhow::bail!("No valid directories to monitor");
        }

        let filter = Arc::new(EventFilter::new(scopes, config.exclude_set()?));
        let mut sources: Vec<Box<dyn EventSource>> = Vec::new();

        if config.sources.fanotify {
            if !nix::unistd::geteuid().is_root() {
                warn!("Not running as root - kernel-attributed events are likely unavailable");
            }
            match FanotifyWatcher::new(filter.clone()) {
                Ok(f) => sources.push(Box::new(f)),
                Err(e) => {
                    warn!(
                        "fanotify not available: {} - degraded mode, no pid attribution",
                        e
                    );
                }
            }
        }

        if config.sources.inotify {
            match InotifyWatcher::new(filter.clone()) {
                Ok(i) => sources.push(Box::new(i)),
                Err(e) => warn!("inotify not available: {}", e),
            }
        }

        if sources.is_empty() {
            anyhow::bail!("No event source could be started");
        }

        for path in filter.scopes().paths() {
            info!("Watching: {:?}", path);
        }

        Ok(Self::from_sources(sources, tx, cancel))
    }

    /// Start an explicit set of feeds
    pub fn from_sources(
        sources: Vec<Box<dyn EventSource>>,
        tx: EventSender,
        cancel: CancellationToken,
    ) -> Self {
        let tasks = sources
            .into_iter()
            .map(|source| {
                let kind = source.kind();
                info!("Starting {:?} event source", kind);
                (kind, source.spawn(tx.clone(), cancel.child_token()))
            })
            .collect();

        Self { tasks, cancel }
    }

    /// Feeds that are running
    pub fn sources(&self) -> Vec<SourceKind> {
        self.tasks.iter().map(|(kind, _)| *kind).collect()
    }

    /// Whether events carry a pid
    pub fn attributes_pids(&self) -> bool {
        self.tasks
            .iter()
            .any(|(kind, _)| *kind == SourceKind::Fanotify)
    }

    /// Stop receiving events and wait for every feed to exit
    pub async fn stop(self) {
        self.cancel.cancel();
        for (kind, task) in self.tasks {
            if let Err(e) = task.await {
                warn!("{:?} event source ended abnormally: {}", kind, e);
            }
        }
        info!("Watcher stopped");
    }
}
