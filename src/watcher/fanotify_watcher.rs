//! fanotify-based file system watcher with pid attribution
//!
//! fanotify reports the pid of the process that wrote a file, which lets
//! the aggregator keep one window per process. It needs CAP_SYS_ADMIN; when
//! it cannot be set up the agent runs on inotify alone.

use super::{EventFilter, EventSender, EventSource, FileEvent, Operation, SourceKind};
use nix::sys::fanotify::{EventFFlags, Fanotify, FanotifyEvent, InitFlags, MarkFlags, MaskFlags};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lets tokio poll the fanotify descriptor
struct FanotifyFd(Fanotify);

impl AsRawFd for FanotifyFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_fd().as_raw_fd()
    }
}

/// fanotify-based file system watcher
pub struct FanotifyWatcher {
    /// fanotify file descriptor
    fanotify: Fanotify,
    /// Scope and exclude rules
    filter: Arc<EventFilter>,
}

impl FanotifyWatcher {
    /// Create a new fanotify watcher marking the mount of every scope
    ///
    /// Requires CAP_SYS_ADMIN capability
    pub fn new(filter: Arc<EventFilter>) -> anyhow::Result<Self> {
        let fanotify = Fanotify::init(
            InitFlags::FAN_CLASS_NOTIF | InitFlags::FAN_CLOEXEC | InitFlags::FAN_NONBLOCK,
            EventFFlags::O_RDONLY | EventFFlags::O_LARGEFILE | EventFFlags::O_CLOEXEC,
        )?;

        let watcher = Self { fanotify, filter };
        for path in watcher.filter.scopes().paths() {
            watcher.add(&path)?;
        }

        Ok(watcher)
    }

    /// Mark the mount containing `path`
    fn add(&self, path: &Path) -> anyhow::Result<()> {
        self.fanotify.mark(
            MarkFlags::FAN_MARK_ADD | MarkFlags::FAN_MARK_MOUNT,
            MaskFlags::FAN_CLOSE_WRITE,
            None, // AT_FDCWD
            Some(path),
        )?;

        info!("fanotify watching mount of: {:?}", path);

        Ok(())
    }

    async fn run(self, tx: EventSender, cancel: CancellationToken) {
        let filter = self.filter;
        let own_pid = std::process::id();

        let async_fd = match AsyncFd::new(FanotifyFd(self.fanotify)) {
            Ok(fd) => fd,
            Err(e) => {
                warn!("fanotify descriptor cannot be polled: {}", e);
                return;
            }
        };

        loop {
            let mut guard = tokio::select! {
                _ = cancel.cancelled() => break,
                ready = async_fd.readable() => match ready {
                    Ok(guard) => guard,
                    Err(e) => {
                        warn!("fanotify poll failed: {}", e);
                        break;
                    }
                },
            };

            let events = match guard.try_io(|inner| {
                inner.get_ref().0.read_events().map_err(std::io::Error::from)
            }) {
                Ok(Ok(events)) => events,
                Ok(Err(e)) => {
                    warn!("fanotify read error: {}", e);
                    continue;
                }
                // Spurious wakeup, readiness already cleared
                Err(_) => continue,
            };

            for event in events {
                let Some(file_event) = translate(&event, own_pid) else {
                    continue;
                };
                if !filter.admits(&file_event.path) {
                    continue;
                }
                if tx.send(file_event).is_err() {
                    debug!("Event channel closed, fanotify feed exiting");
                    return;
                }
            }
        }

        debug!("fanotify feed stopped");
    }
}

impl EventSource for FanotifyWatcher {
    fn kind(&self) -> SourceKind {
        SourceKind::Fanotify
    }

    fn spawn(self: Box<Self>, tx: EventSender, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn((*self).run(tx, cancel))
    }
}

/// Resolve one fanotify record into a file event
fn translate(event: &FanotifyEvent, own_pid: u32) -> Option<FileEvent> {
    if !event.check_version() {
        warn!("fanotify metadata version mismatch");
        return None;
    }

    let fd = event.fd()?;
    // Get the file path from /proc/self/fd
    let path = std::fs::read_link(format!("/proc/self/fd/{}", fd.as_raw_fd())).ok()?;
    to_file_event(path, event.pid(), event.mask(), own_pid)
}

/// Keep close-writes of regular files by other processes
fn to_file_event(path: PathBuf, pid: i32, mask: MaskFlags, own_pid: u32) -> Option<FileEvent> {
    let pid = u32::try_from(pid).ok()?;

    // Our own reads of /proc and config files are not interesting
    if pid == own_pid {
        return None;
    }

    if !mask.contains(MaskFlags::FAN_CLOSE_WRITE) {
        return None;
    }

    if path.is_dir() {
        return None;
    }

    Some(FileEvent {
        timestamp: Instant::now(),
        path,
        operation: Operation::Write,
        pid: Some(pid),
        source: SourceKind::Fanotify,
    })
}
