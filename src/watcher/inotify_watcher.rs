//! inotify-based file system watcher
//!
//! Path-only feed: inotify never reports the writing process.

use super::{EventFilter, EventSender, EventSource, FileEvent, Operation, SourceKind};
use futures::StreamExt;
use inotify::{Event, EventMask, Inotify, WatchDescriptor, WatchMask, Watches};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A MOVED_FROM with no matching MOVED_TO after this long is a delete
const MOVE_PAIR_TIMEOUT: Duration = Duration::from_millis(500);

/// Directories that are never descended into
const SKIP_DIRS: &[&str] = &[".git", "node_modules", "__pycache__", ".cache", "target"];

fn watch_mask() -> WatchMask {
    WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::CLOSE_WRITE
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
}

/// Watch descriptors and the directories they stand for
struct WatchTree {
    watches: Watches,
    dirs: HashMap<WatchDescriptor, PathBuf>,
}

impl WatchTree {
    fn add(&mut self, dir: &Path) -> std::io::Result<()> {
        let wd = self.watches.add(dir, watch_mask())?;
        self.dirs.insert(wd, dir.to_path_buf());
        Ok(())
    }

    /// Watch `dir` and every subdirectory below it
    fn add_recursive(&mut self, dir: &Path) -> std::io::Result<()> {
        self.add(dir)?;

        for entry in std::fs::read_dir(dir)?.flatten() {
            let path = entry.path();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }

            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if SKIP_DIRS.contains(&name) {
                continue;
            }

            if let Err(e) = self.add_recursive(&path) {
                debug!("Could not watch {:?}: {}", path, e);
            }
        }

        Ok(())
    }
}

/// inotify-based file system watcher
pub struct InotifyWatcher {
    /// inotify instance
    inotify: Inotify,
    /// Registered directories
    tree: WatchTree,
    /// Scope and exclude rules
    filter: Arc<EventFilter>,
    /// MOVED_FROM halves waiting for their MOVED_TO, by cookie
    pending_moves: HashMap<u32, (PathBuf, Instant)>,
}

impl InotifyWatcher {
    /// Create a new inotify watcher over every scope in `filter`
    pub fn new(filter: Arc<EventFilter>) -> anyhow::Result<Self> {
        let inotify = Inotify::init()?;
        let mut tree = WatchTree {
            watches: inotify.watches(),
            dirs: HashMap::new(),
        };

        for scope in filter.scopes().iter() {
            if let Err(e) = tree.add_recursive(&scope.path) {
                warn!("Failed to watch {:?}: {}", scope.path, e);
            }
        }

        if tree.dirs.is_empty() {
            anyhow::bail!("no directory could be watched");
        }
        info!("inotify watching {} directories", tree.dirs.len());

        Ok(Self {
            inotify,
            tree,
            filter,
            pending_moves: HashMap::new(),
        })
    }

    async fn run(self, tx: EventSender, cancel: CancellationToken) {
        let Self {
            inotify,
            mut tree,
            filter,
            mut pending_moves,
        } = self;

        let mut stream = match inotify.into_event_stream([0u8; 4096]) {
            Ok(s) => s,
            Err(e) => {
                warn!("inotify stream failed to start: {}", e);
                return;
            }
        };

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => next,
            };

            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    warn!("inotify read error: {}", e);
                    continue;
                }
                None => break,
            };

            let now = Instant::now();
            let mut out = flush_stale_moves(&mut pending_moves, now);
            out.extend(translate(&mut tree, &mut pending_moves, event, now));

            for file_event in out {
                if !filter.admits(&file_event.path) {
                    continue;
                }
                if tx.send(file_event).is_err() {
                    debug!("Event channel closed, inotify feed exiting");
                    return;
                }
            }
        }

        debug!("inotify feed stopped");
    }
}

impl EventSource for InotifyWatcher {
    fn kind(&self) -> SourceKind {
        SourceKind::Inotify
    }

    fn spawn(self: Box<Self>, tx: EventSender, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn((*self).run(tx, cancel))
    }
}

/// Turn one raw inotify event into zero or more file events
fn translate(
    tree: &mut WatchTree,
    pending_moves: &mut HashMap<u32, (PathBuf, Instant)>,
    event: Event<OsString>,
    now: Instant,
) -> Vec<FileEvent> {
    if event.mask.contains(EventMask::Q_OVERFLOW) {
        warn!("inotify queue overflow - events were dropped");
        return Vec::new();
    }

    // Get the directory this event came from
    let dir_path = match tree.dirs.get(&event.wd) {
        Some(p) => p.clone(),
        None => return Vec::new(),
    };

    if event.mask.contains(EventMask::IGNORED) {
        tree.dirs.remove(&event.wd);
        return Vec::new();
    }

    let path = match event.name {
        Some(name) => dir_path.join(name),
        None => return Vec::new(),
    };

    // Directories are tracked, never counted
    if event.mask.contains(EventMask::ISDIR) {
        if event.mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
            if let Err(e) = tree.add_recursive(&path) {
                debug!("Could not watch new directory {:?}: {}", path, e);
            }
        }
        return Vec::new();
    }

    let operation = if event.mask.contains(EventMask::CREATE) {
        Operation::Create
    } else if event.mask.contains(EventMask::CLOSE_WRITE) {
        Operation::Write
    } else if event.mask.contains(EventMask::DELETE) {
        Operation::Delete
    } else if event.mask.contains(EventMask::MOVED_FROM) {
        pending_moves.insert(event.cookie, (path, now));
        return Vec::new();
    } else if event.mask.contains(EventMask::MOVED_TO) {
        match pending_moves.remove(&event.cookie) {
            Some((from, _)) => Operation::Rename { from },
            // Moved in from outside the watched tree
            None => Operation::Create,
        }
    } else {
        return Vec::new();
    };

    vec![FileEvent::new(path, operation).at(now)]
}

/// Unpaired MOVED_FROM halves past the timeout become deletes
fn flush_stale_moves(
    pending_moves: &mut HashMap<u32, (PathBuf, Instant)>,
    now: Instant,
) -> Vec<FileEvent> {
    let stale: Vec<u32> = pending_moves
        .iter()
        .filter(|(_, (_, seen))| now.duration_since(*seen) > MOVE_PAIR_TIMEOUT)
        .map(|(cookie, _)| *cookie)
        .collect();

    stale
        .into_iter()
        .filter_map(|cookie| pending_moves.remove(&cookie))
        .map(|(path, _)| FileEvent::new(path, Operation::Delete).at(now))
        .collect()
}
