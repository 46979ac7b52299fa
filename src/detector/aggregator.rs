//! Window aggregation over the event stream
//!
//! Keeps a global counter, per-pid counters, or both, depending on the
//! configured topology. Recording never blocks for longer than a short
//! append; [`Aggregator::poll`] is called from the orchestration tick.

use super::window::WindowedCounter;
use crate::clock::Clock;
use crate::config::{DetectionConfig, Topology};
use crate::response::ResponseState;
use crate::watcher::{FileEvent, SourceKind};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Which counter fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerScope {
    Global,
    Process(u32),
}

/// A window that reached its threshold
#[derive(Debug, Clone)]
pub struct Trigger {
    pub scope: TriggerScope,
    /// Events inside the window when it fired
    pub event_count: usize,
    /// Distinct affected paths
    pub paths: Vec<PathBuf>,
}

impl Trigger {
    pub fn pid(&self) -> Option<u32> {
        match self.scope {
            TriggerScope::Process(pid) => Some(pid),
            TriggerScope::Global => None,
        }
    }
}

/// Windowed counters for every active scope
pub struct Aggregator {
    topology: Topology,
    window: Duration,
    threshold: usize,
    max_events: usize,
    clock: Arc<dyn Clock>,
    state: Arc<ResponseState>,
    global: Option<WindowedCounter>,
    /// Only this feed counts globally; `None` counts every feed
    global_source: Option<SourceKind>,
    per_pid: RwLock<HashMap<u32, Arc<WindowedCounter>>>,
}

impl Aggregator {
    pub fn new(config: &DetectionConfig, clock: Arc<dyn Clock>, state: Arc<ResponseState>) -> Self {
        let window = config.window();
        let global = config.topology.global().then(|| {
            WindowedCounter::new(window, config.event_threshold, config.max_events_per_scope)
        });

        Self {
            topology: config.topology,
            window,
            threshold: config.event_threshold,
            max_events: config.max_events_per_scope,
            clock,
            state,
            global,
            global_source: None,
            per_pid: RwLock::new(HashMap::new()),
        }
    }

    /// Restrict the global window to one feed
    ///
    /// With inotify and fanotify both running every close-write arrives
    /// twice; the global window must see it once.
    pub fn set_global_source(&mut self, source: Option<SourceKind>) {
        self.global_source = source;
    }

    /// Count one event against every scope it belongs to
    pub fn record(&self, event: &FileEvent) {
        if let Some(global) = &self.global {
            if self.global_source.map_or(true, |s| s == event.source) {
                global.record(event.timestamp, event.path.clone());
            }
        }

        if !self.topology.per_process() {
            return;
        }
        let Some(pid) = event.pid else {
            return;
        };
        if self.state.is_flagged(pid) {
            return;
        }

        let existing = self.per_pid.read().get(&pid).cloned();
        let counter = match existing {
            Some(counter) => counter,
            None => self
                .per_pid
                .write()
                .entry(pid)
                .or_insert_with(|| {
                    Arc::new(WindowedCounter::new(
                        self.window,
                        self.threshold,
                        self.max_events,
                    ))
                })
                .clone(),
        };
        counter.record(event.timestamp, event.path.clone());
    }

    /// Trim every counter and collect the ones at threshold
    ///
    /// The global counter is drained when it fires so the same burst is not
    /// reported twice. A per-pid counter flags its pid instead; later events
    /// from that pid are ignored.
    pub fn poll(&self) -> Vec<Trigger> {
        let now = self.clock.now();
        let mut triggers = Vec::new();

        if let Some(global) = &self.global {
            if let Some((event_count, paths)) = global.drain_if_exceeded(now) {
                triggers.push(Trigger {
                    scope: TriggerScope::Global,
                    event_count,
                    paths,
                });
            }
        }

        if self.topology.per_process() {
            let counters: Vec<(u32, Arc<WindowedCounter>)> = self
                .per_pid
                .read()
                .iter()
                .map(|(pid, c)| (*pid, c.clone()))
                .collect();

            for (pid, counter) in counters {
                if self.state.is_flagged(pid) {
                    continue;
                }
                if let Some((event_count, paths)) = counter.peek_if_exceeded(now) {
                    if self.state.flag(pid) {
                        triggers.push(Trigger {
                            scope: TriggerScope::Process(pid),
                            event_count,
                            paths,
                        });
                    }
                }
            }

            self.prune(now);
        }

        triggers
    }

    /// Drop counters of flagged or long-idle pids
    fn prune(&self, now: tokio::time::Instant) {
        let idle = self.window * 5;
        let mut per_pid = self.per_pid.write();
        let before = per_pid.len();
        per_pid.retain(|pid, counter| !self.state.is_flagged(*pid) && !counter.is_idle(now, idle));
        let removed = before - per_pid.len();
        if removed > 0 {
            debug!("Pruned {} per-process counters", removed);
        }
    }

    /// Events currently inside the global window
    pub fn global_count(&self) -> usize {
        self.global
            .as_ref()
            .map(|g| g.trim(self.clock.now()))
            .unwrap_or(0)
    }

    /// Pids with a live counter
    pub fn tracked_processes(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.per_pid.read().keys().copied().collect();
        pids.sort_unstable();
        pids
    }
}
