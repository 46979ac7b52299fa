//! Process suspicion scoring
//!
//! After a trigger the scorer samples the process table twice, a short
//! interval apart, and ranks processes by a composite of name, CPU burn,
//! thread count and age. Points:
//!
//! | signal | points |
//! |---|---|
//! | name contains a suspicious fragment | 4.0 |
//! | CPU above baseline | (cpu - baseline) / divisor, capped |
//! | more than 20 threads | 1.0 |
//! | more than 50 threads | 1.0 more |
//! | started within the new-process window | 0.8 |

use super::process::{ProcessSample, ProcessTable};
use crate::config::{Config, ScoringConfig};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const NAME_POINTS: f64 = 4.0;
const THREADS_HIGH: u32 = 20;
const THREADS_VERY_HIGH: u32 = 50;
const THREAD_POINTS: f64 = 1.0;
const NEW_PROCESS_POINTS: f64 = 0.8;
/// Candidates at or below this are noise
const MIN_SCORE: f64 = 0.5;

/// One process evaluated during a scoring pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessCandidate {
    pub pid: u32,
    /// Lowercased process name
    pub name: String,
    pub score: f64,
    pub cpu_percent: f64,
    pub threads: u32,
    pub name_match: bool,
    pub new_process: bool,
}

/// Ranks running processes by suspicion
pub struct CandidateScorer {
    table: Arc<dyn ProcessTable>,
    config: Arc<Config>,
    cores: usize,
    own_pid: u32,
}

impl CandidateScorer {
    pub fn new(table: Arc<dyn ProcessTable>, config: Arc<Config>) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            table,
            config,
            cores,
            own_pid: std::process::id(),
        }
    }

    /// Override the logical core count used to normalize CPU percent
    pub fn with_cores(mut self, cores: usize) -> Self {
        self.cores = cores.max(1);
        self
    }

    /// Sample, score and rank; highest score first, at most `top_k`
    pub async fn score(&self, sample_interval: Duration) -> Vec<ProcessCandidate> {
        let before: HashMap<u32, ProcessSample> = self
            .snapshot()
            .await
            .into_iter()
            .map(|s| (s.pid, s))
            .collect();

        tokio::time::sleep(sample_interval).await;

        let after = self.snapshot().await;
        self.rank(&before, after, sample_interval)
    }

    /// Read the process table on the blocking pool
    async fn snapshot(&self) -> Vec<ProcessSample> {
        let table = self.table.clone();
        match tokio::task::spawn_blocking(move || table.snapshot()).await {
            Ok(samples) => samples,
            Err(e) => {
                warn!("Process snapshot failed: {}", e);
                Vec::new()
            }
        }
    }

    fn rank(
        &self,
        before: &HashMap<u32, ProcessSample>,
        after: Vec<ProcessSample>,
        sample_interval: Duration,
    ) -> Vec<ProcessCandidate> {
        let interval_ms = sample_interval.as_millis().max(1) as f64;
        let scoring = &self.config.scoring;

        let mut candidates: Vec<ProcessCandidate> = after
            .into_iter()
            .filter(|s| s.pid != self.own_pid)
            .filter_map(|now| {
                // Gone before the second snapshot, or the pid was reused
                let then = before.get(&now.pid)?;
                if then.name != now.name {
                    return None;
                }

                let name = now.name.to_lowercase();
                if self.config.is_allowlisted(&name) {
                    return None;
                }

                let delta_ms = now.cpu_time.saturating_sub(then.cpu_time).as_millis() as f64;
                let cpu_percent = (delta_ms / interval_ms) * 100.0 / self.cores as f64;
                Some(evaluate(scoring, now.pid, name, cpu_percent, now.threads, now.age))
            })
            .filter(|c| c.score > MIN_SCORE)
            .collect();

        candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.pid.cmp(&b.pid)));
        candidates.truncate(scoring.top_k);
        candidates
    }
}

/// Composite score for one process
pub fn evaluate(
    scoring: &ScoringConfig,
    pid: u32,
    name: String,
    cpu_percent: f64,
    threads: u32,
    age: Option<Duration>,
) -> ProcessCandidate {
    let name_match = scoring
        .suspicious_names
        .iter()
        .any(|fragment| name.contains(fragment.as_str()));
    let new_process = age
        .map(|a| a < Duration::from_secs(scoring.new_process_secs))
        .unwrap_or(false);

    let mut score = 0.0;
    if name_match {
        score += NAME_POINTS;
    }
    score += cpu_points(scoring, cpu_percent);
    if threads > THREADS_HIGH {
        score += THREAD_POINTS;
    }
    if threads > THREADS_VERY_HIGH {
        score += THREAD_POINTS;
    }
    if new_process {
        score += NEW_PROCESS_POINTS;
    }

    ProcessCandidate {
        pid,
        name,
        score,
        cpu_percent,
        threads,
        name_match,
        new_process,
    }
}

/// Linear above the baseline, saturating at the cap
pub fn cpu_points(scoring: &ScoringConfig, cpu_percent: f64) -> f64 {
    if cpu_percent <= scoring.cpu_baseline_percent {
        return 0.0;
    }
    let divisor = if scoring.cpu_points_divisor > 0.0 {
        scoring.cpu_points_divisor
    } else {
        1.0
    };
    ((cpu_percent - scoring.cpu_baseline_percent) / divisor).min(scoring.cpu_score_cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Hands out prepared snapshots in order
    struct ScriptedTable(Mutex<VecDeque<Vec<ProcessSample>>>);

    impl ScriptedTable {
        fn new(snapshots: Vec<Vec<ProcessSample>>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(snapshots.into())))
        }
    }

    impl ProcessTable for ScriptedTable {
        fn snapshot(&self) -> Vec<ProcessSample> {
            self.0.lock().pop_front().unwrap_or_default()
        }
    }

    /// Each snapshot waits for the test to open the gate
    struct GatedTable {
        gate: Mutex<std::sync::mpsc::Receiver<()>>,
        opened: AtomicUsize,
    }

    impl ProcessTable for GatedTable {
        fn snapshot(&self) -> Vec<ProcessSample> {
            if self.gate.lock().recv_timeout(Duration::from_secs(2)).is_ok() {
                self.opened.fetch_add(1, Ordering::SeqCst);
            }
            Vec::new()
        }
    }

    fn sample(pid: u32, name: &str, cpu_ms: u64, threads: u32) -> ProcessSample {
        ProcessSample {
            pid,
            name: name.to_string(),
            cpu_time: Duration::from_millis(cpu_ms),
            threads,
            age: Some(Duration::from_secs(3600)),
        }
    }

    fn config_with_allowlist(allowlist: &[&str]) -> Arc<Config> {
        let mut config = Config::default();
        config.scoring.allowlist = allowlist.iter().map(|s| s.to_string()).collect();
        Arc::new(config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cryptolocker_scenario() {
        // 40% of one core over 200ms = 80ms of CPU
        let table = ScriptedTable::new(vec![
            vec![sample(4321, "cryptolocker", 1000, 5)],
            vec![sample(4321, "cryptolocker", 1080, 5)],
        ]);
        let scorer = CandidateScorer::new(table, config_with_allowlist(&[])).with_cores(1);

        let candidates = scorer.score(Duration::from_millis(200)).await;
        assert_eq!(candidates.len(), 1);

        let top = &candidates[0];
        assert_eq!(top.pid, 4321);
        assert!(top.name_match);
        assert!((top.cpu_percent - 40.0).abs() < 1e-9);
        assert!((top.score - 8.0).abs() < 1e-9);
        assert!(top.score >= 3.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_allowlisted_never_scored() {
        let table = ScriptedTable::new(vec![
            vec![sample(10, "rsync", 0, 80), sample(11, "Encryptor", 0, 1)],
            vec![sample(10, "rsync", 200, 80), sample(11, "Encryptor", 0, 1)],
        ]);
        let scorer = CandidateScorer::new(table, config_with_allowlist(&["rsync"])).with_cores(1);

        let candidates = scorer.score(Duration::from_millis(200)).await;
        assert!(candidates.iter().all(|c| c.pid != 10));
        assert_eq!(candidates[0].name, "encryptor");
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_and_reused_pids_are_excluded() {
        let table = ScriptedTable::new(vec![
            vec![sample(1, "locker", 0, 1), sample(2, "payload", 0, 1)],
            vec![sample(2, "bash-reused", 500, 1), sample(3, "ransom", 0, 1)],
        ]);
        let scorer = CandidateScorer::new(table, config_with_allowlist(&[])).with_cores(1);

        assert!(scorer.score(Duration::from_millis(200)).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ranking_filter_and_cap() {
        let mut before = Vec::new();
        let mut after = Vec::new();
        for pid in 100..130u32 {
            before.push(sample(pid, "worker", 0, 1));
            // pid 100 burns nothing, the rest more and more
            after.push(sample(pid, "worker", u64::from(pid - 100) * 4, 1));
        }
        let table = ScriptedTable::new(vec![before, after]);
        let scorer = CandidateScorer::new(table, config_with_allowlist(&[])).with_cores(1);

        let candidates = scorer.score(Duration::from_millis(200)).await;
        assert_eq!(candidates.len(), 10);
        assert!(candidates.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(candidates.iter().all(|c| c.score > 0.5));
        // Saturated CPU scores tie; ties are broken by pid
        assert!((candidates[0].score - 4.0).abs() < 1e-9);
        assert_eq!(candidates[0].pid, 113);
    }

    #[tokio::test]
    async fn test_snapshots_leave_the_runtime_free() {
        let (open, gate) = std::sync::mpsc::channel();
        let table = Arc::new(GatedTable {
            gate: Mutex::new(gate),
            opened: AtomicUsize::new(0),
        });
        let scorer = CandidateScorer::new(table.clone(), config_with_allowlist(&[]));
        let scoring = tokio::spawn(async move { scorer.score(Duration::from_millis(10)).await });

        // On a single-threaded runtime this only runs if the snapshot is off-thread
        tokio::task::yield_now().await;
        open.send(()).unwrap();
        open.send(()).unwrap();

        assert!(scoring.await.unwrap().is_empty());
        assert_eq!(table.opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_thread_and_age_points() {
        let scoring = ScoringConfig::default();
        let busy = evaluate(&scoring, 1, "svc".into(), 0.0, 60, Some(Duration::from_secs(10)));
        assert!((busy.score - 2.8).abs() < 1e-9);
        assert!(busy.new_process);

        let quiet = evaluate(&scoring, 2, "svc".into(), 0.0, 21, None);
        assert!((quiet.score - 1.0).abs() < 1e-9);
        assert!(!quiet.new_process);
    }

    #[test]
    fn test_cpu_points_monotonic_and_saturating() {
        let scoring = ScoringConfig::default();
        let mut previous = 0.0;
        for tenth in 0..1000 {
            let cpu = tenth as f64 / 10.0;
            let points = cpu_points(&scoring, cpu);
            assert!(points >= previous);
            assert!(points <= scoring.cpu_score_cap);
            previous = points;
        }
        assert_eq!(cpu_points(&scoring, 5.0), 0.0);
        assert_eq!(cpu_points(&scoring, 100.0), 4.0);
    }

    #[test]
    fn test_low_score_is_below_action_threshold() {
        let scoring = ScoringConfig::default();
        let candidate = evaluate(&scoring, 9, "indexer".into(), 15.0, 1, None);
        assert!((candidate.score - 2.0).abs() < 1e-9);
        assert!(candidate.score < scoring.action_threshold);
    }
}
