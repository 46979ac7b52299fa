//! Orchestration loop
//!
//! Consumes the event stream, feeds the aggregator and the rename sentinel,
//! polls windows on a fixed tick, and runs one response episode per
//! trigger. Episodes (score, decide, act) run as tracked tasks so the loop
//! never waits on them.

use crate::clock::SystemClock;
use crate::config::Config;
use crate::detector::{Aggregator, CandidateScorer, ExtensionSentinel, ProcessTable, Trigger};
use crate::response::actuator::get_process_info;
use crate::response::{
    determine_action, ActionKind, Alert, AlertRecord, AlertSink, Decision, ProcessController,
    ResponseState, NO_STRONG_CANDIDATE,
};
use crate::watcher::{EventReceiver, FileEvent, SourceKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Score-decide-act pipeline shared by every episode
struct Responder {
    config: Arc<Config>,
    scorer: CandidateScorer,
    controller: Arc<dyn ProcessController>,
    state: Arc<ResponseState>,
    sink: Arc<dyn AlertSink>,
}

impl Responder {
    async fn respond(&self, attributed_pid: Option<u32>) {
        let scoring = &self.config.scoring;
        let candidates = self.scorer.score(scoring.sample_interval()).await;
        debug!("Scoring pass produced {} candidates", candidates.len());

        for candidate in &candidates {
            self.sink
                .emit(AlertRecord::new(Alert::Candidate(candidate.clone())));
        }

        match determine_action(
            &candidates,
            attributed_pid,
            scoring.action_threshold,
            &self.state,
        ) {
            Decision::Skip { top_score } => {
                info!("No action: {} (top score {:?})", NO_STRONG_CANDIDATE, top_score);
                self.sink.emit(AlertRecord::new(Alert::NoAction {
                    reason: NO_STRONG_CANDIDATE.to_string(),
                    top_score,
                }));
            }
            Decision::Suspend(candidate) => {
                // A concurrent episode may have claimed it since the decision
                if !self.state.try_claim(candidate.pid) {
                    debug!("Process {} claimed by another episode", candidate.pid);
                    return;
                }

                let info = get_process_info(candidate.pid);
                let result = self.controller.suspend(candidate.pid);
                match &result {
                    Ok(()) => warn!(
                        "Suspended {} (PID {}), score {:.1}, exe {:?}, cmdline {:?}",
                        candidate.name,
                        candidate.pid,
                        candidate.score,
                        info.as_ref().and_then(|i| i.exe.as_ref()),
                        info.as_ref().and_then(|i| i.cmdline.as_deref()),
                    ),
                    Err(e) => error!("Failed to suspend process {}: {}", candidate.pid, e),
                }

                self.sink.emit(AlertRecord::new(Alert::ActionResult {
                    pid: candidate.pid,
                    name: candidate.name,
                    action: ActionKind::Suspend,
                    success: result.is_ok(),
                    error: result.err().map(|e| e.to_string()),
                }));
            }
        }
    }
}

/// Detection and response engine
pub struct Engine {
    config: Arc<Config>,
    aggregator: Aggregator,
    sentinel: ExtensionSentinel,
    responder: Arc<Responder>,
    tracker: TaskTracker,
    /// Set while a rename-triggered episode is running
    fast_in_flight: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(
        config: Arc<Config>,
        table: Arc<dyn ProcessTable>,
        controller: Arc<dyn ProcessController>,
        sink: Arc<dyn AlertSink>,
    ) -> Self {
        let scorer = CandidateScorer::new(table, config.clone());
        Self::with_scorer(config, scorer, controller, sink)
    }

    /// Build around a preconfigured scorer
    pub fn with_scorer(
        config: Arc<Config>,
        scorer: CandidateScorer,
        controller: Arc<dyn ProcessController>,
        sink: Arc<dyn AlertSink>,
    ) -> Self {
        let state = Arc::new(ResponseState::new());
        let aggregator = Aggregator::new(&config.detection, Arc::new(SystemClock), state.clone());

        Self {
            aggregator,
            sentinel: ExtensionSentinel::new(&config.sentinel),
            responder: Arc::new(Responder {
                config: config.clone(),
                scorer,
                controller,
                state,
                sink,
            }),
            config,
            tracker: TaskTracker::new(),
            fast_in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Tell the engine which feeds are running
    ///
    /// When inotify and fanotify both run, the global window counts only
    /// inotify events; fanotify still feeds the per-process windows.
    pub fn with_event_sources(mut self, sources: &[SourceKind]) -> Self {
        let both = sources.contains(&SourceKind::Inotify) && sources.contains(&SourceKind::Fanotify);
        self.aggregator
            .set_global_source(both.then_some(SourceKind::Inotify));
        self
    }

    /// Handled-pid record for this run
    pub fn state(&self) -> Arc<ResponseState> {
        self.responder.state.clone()
    }

    /// Run until `cancel` fires, then wait for in-flight episodes
    pub async fn run(self, mut events: EventReceiver, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.config.engine.tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        info!(
            "Engine started: window {:?}, threshold {}, topology {:?}",
            self.config.detection.window(),
            self.config.detection.event_threshold,
            self.config.detection.topology
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Engine cancelled");
                    break;
                }

                _ = tick.tick() => {
                    for trigger in self.aggregator.poll() {
                        self.on_trigger(trigger);
                    }
                }

                event = events.recv(), if events_open => {
                    match event {
                        Some(event) => self.on_event(&event),
                        None => {
                            warn!("Event channel closed, no more file events");
                            events_open = false;
                        }
                    }
                }
            }
        }

        self.tracker.close();
        let pending = self.tracker.len();
        if pending > 0 {
            info!("Waiting for {} response episodes", pending);
        }
        self.tracker.wait().await;
        info!("Engine stopped");
    }

    fn on_event(&self, event: &FileEvent) {
        self.aggregator.record(event);

        let Some((old_path, new_path)) = event.rename_paths() else {
            return;
        };
        let Some(alert) = self.sentinel.inspect_rename(old_path, new_path) else {
            return;
        };

        warn!(
            "Suspicious rename {:?} -> {:?} ({})",
            alert.old_path, alert.new_path, alert.extension
        );
        self.responder
            .sink
            .emit(AlertRecord::new(Alert::fast(&alert, event.pid)));

        // One rename episode at a time; a burst of renames is one incident
        if self
            .fast_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Rename episode already running");
            return;
        }
        let in_flight = self.fast_in_flight.clone();
        self.spawn_episode(event.pid, Some(in_flight));
    }

    fn on_trigger(&self, trigger: Trigger) {
        warn!(
            "Window threshold reached ({:?}): {} events, {} paths",
            trigger.scope,
            trigger.event_count,
            trigger.paths.len()
        );
        self.responder
            .sink
            .emit(AlertRecord::new(Alert::window(&trigger)));
        self.spawn_episode(trigger.pid(), None);
    }

    fn spawn_episode(&self, attributed_pid: Option<u32>, in_flight: Option<Arc<AtomicBool>>) {
        let responder = self.responder.clone();
        self.tracker.spawn(async move {
            let episode = tokio::spawn(async move { responder.respond(attributed_pid).await });
            if let Err(e) = episode.await {
                error!("Response episode failed: {}", e);
            }
            if let Some(flag) = in_flight {
                flag.store(false, Ordering::Release);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Topology;
    use crate::detector::ProcessSample;
    use crate::response::{ActuatorError, AlertKind, ChannelSink};
    use crate::watcher::Operation;
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// One process whose CPU time grows `step_ms` per snapshot
    struct BurningTable {
        name: &'static str,
        step_ms: u64,
        cpu_ms: AtomicU64,
    }

    impl ProcessTable for BurningTable {
        fn snapshot(&self) -> Vec<ProcessSample> {
            let cpu = self.cpu_ms.fetch_add(self.step_ms, Ordering::SeqCst);
            vec![ProcessSample {
                pid: 4321,
                name: self.name.to_string(),
                cpu_time: Duration::from_millis(cpu),
                threads: 5,
                age: None,
            }]
        }
    }

    #[derive(Default)]
    struct RecordingController(Mutex<Vec<u32>>);

    impl ProcessController for RecordingController {
        fn suspend(&self, pid: u32) -> Result<(), ActuatorError> {
            self.0.lock().push(pid);
            Ok(())
        }

        fn resume(&self, _pid: u32) -> Result<(), ActuatorError> {
            Ok(())
        }

        fn kill(&self, _pid: u32, _wait: Duration) -> Result<(), ActuatorError> {
            Ok(())
        }
    }

    struct Harness {
        events: mpsc::UnboundedSender<FileEvent>,
        alerts: mpsc::UnboundedReceiver<AlertRecord>,
        controller: Arc<RecordingController>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    /// Engine over a single process burning `step_ms` per 200ms sample
    fn start(process_name: &'static str, step_ms: u64, threshold: usize) -> Harness {
        let mut config = Config::default();
        config.detection.event_threshold = threshold;
        config.detection.topology = Topology::Global;
        config.scoring.allowlist.clear();
        let config = Arc::new(config);

        let table = Arc::new(BurningTable {
            name: process_name,
            step_ms,
            cpu_ms: AtomicU64::new(0),
        });
        let controller = Arc::new(RecordingController::default());
        let (sink, alerts) = ChannelSink::new();
        let scorer = CandidateScorer::new(table, config.clone()).with_cores(1);
        let engine = Engine::with_scorer(config, scorer, controller.clone(), Arc::new(sink));

        let (events, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(engine.run(rx, cancel.clone()));

        Harness {
            events,
            alerts,
            controller,
            cancel,
            task,
        }
    }

    async fn next_of(alerts: &mut mpsc::UnboundedReceiver<AlertRecord>, kind: AlertKind) -> AlertRecord {
        loop {
            let record = alerts.recv().await.unwrap();
            if record.kind() == kind {
                return record;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_burst_suspends_culprit() {
        let mut h = start("cryptolocker", 80, 3);
        for name in ["a.docx", "b.docx", "c.docx"] {
            h.events
                .send(FileEvent::new(PathBuf::from("/data").join(name), Operation::Write))
                .unwrap();
        }

        let window = next_of(&mut h.alerts, AlertKind::WindowAlert).await;
        match window.alert {
            Alert::WindowAlert { event_count, path_count, .. } => {
                assert_eq!(event_count, 3);
                assert_eq!(path_count, 3);
            }
            other => panic!("unexpected alert {:?}", other),
        }

        let candidate = next_of(&mut h.alerts, AlertKind::Candidate).await;
        match candidate.alert {
            Alert::Candidate(c) => {
                assert_eq!(c.pid, 4321);
                assert!(c.score >= 8.0);
            }
            other => panic!("unexpected alert {:?}", other),
        }

        let action = next_of(&mut h.alerts, AlertKind::ActionResult).await;
        match action.alert {
            Alert::ActionResult { pid, success, .. } => {
                assert_eq!(pid, 4321);
                assert!(success);
            }
            other => panic!("unexpected alert {:?}", other),
        }
        assert_eq!(*h.controller.0.lock(), vec![4321]);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspicious_rename_acts_without_window() {
        let mut h = start("cryptolocker", 80, 1000);
        h.events
            .send(FileEvent::new(
                "/data/report.docx.locked",
                Operation::Rename {
                    from: PathBuf::from("/data/report.docx"),
                },
            ))
            .unwrap();

        let fast = next_of(&mut h.alerts, AlertKind::FastAlert).await;
        match fast.alert {
            Alert::FastAlert { extension, .. } => assert_eq!(extension, ".locked"),
            other => panic!("unexpected alert {:?}", other),
        }
        next_of(&mut h.alerts, AlertKind::ActionResult).await;
        assert_eq!(*h.controller.0.lock(), vec![4321]);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_weak_candidate_gets_no_action() {
        // 15% CPU, no name match: score 2.0
        let mut h = start("indexer", 30, 2);
        h.events.send(FileEvent::new("/data/a", Operation::Write)).unwrap();
        h.events.send(FileEvent::new("/data/b", Operation::Write)).unwrap();

        let record = next_of(&mut h.alerts, AlertKind::NoAction).await;
        match record.alert {
            Alert::NoAction { reason, top_score } => {
                assert_eq!(reason, NO_STRONG_CANDIDATE);
                assert!(top_score.unwrap() < 3.5);
            }
            other => panic!("unexpected alert {:?}", other),
        }
        assert!(h.controller.0.lock().is_empty());

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_pid_suspended_once() {
        let mut h = start("cryptolocker", 80, 2);
        for round in 0..3 {
            h.events.send(FileEvent::new(format!("/data/{}a", round), Operation::Write)).unwrap();
            h.events.send(FileEvent::new(format!("/data/{}b", round), Operation::Write)).unwrap();
            next_of(&mut h.alerts, AlertKind::WindowAlert).await;
            tokio::time::sleep(Duration::from_secs(2)).await;
        }

        h.cancel.cancel();
        h.task.await.unwrap();
        assert_eq!(*h.controller.0.lock(), vec![4321]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_waits_for_episodes() {
        let mut h = start("cryptolocker", 80, 1);
        h.events.send(FileEvent::new("/data/a", Operation::Write)).unwrap();
        next_of(&mut h.alerts, AlertKind::WindowAlert).await;

        // Cancel mid-episode; the suspend still lands
        h.cancel.cancel();
        h.task.await.unwrap();
        assert_eq!(*h.controller.0.lock(), vec![4321]);
    }
}
