//! Sliding-window event counting
//!
//! Normal users touch a handful of files per second. A mass-encryption sweep
//! touches hundreds. A [`WindowedCounter`] keeps the timestamps of recent
//! events for one scope and reports when the count inside the window
//! reaches the threshold.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

/// Recent events for a single scope
pub struct WindowedCounter {
    /// Window length
    window: Duration,
    /// Count that fires a trigger
    threshold: usize,
    /// Retention cap
    max_events: usize,
    /// Timestamps in ascending order with the path they touched
    entries: Mutex<VecDeque<(Instant, PathBuf)>>,
    /// Last time anything was recorded
    last_seen: Mutex<Option<Instant>>,
}

impl WindowedCounter {
    /// Create a new windowed counter
    pub fn new(window: Duration, threshold: usize, max_events: usize) -> Self {
        Self {
            window,
            threshold: threshold.max(1),
            max_events: max_events.max(1),
            entries: Mutex::new(VecDeque::new()),
            last_seen: Mutex::new(None),
        }
    }

    /// Append an event
    ///
    /// A timestamp older than the current tail is clamped to the tail so the
    /// sequence stays sorted.
    pub fn record(&self, at: Instant, path: PathBuf) {
        let mut entries = self.entries.lock();
        let at = match entries.back() {
            Some((tail, _)) if *tail > at => *tail,
            _ => at,
        };

        // Enforce retention cap
        while entries.len() >= self.max_events {
            entries.pop_front();
        }
        entries.push_back((at, path));
        drop(entries);

        *self.last_seen.lock() = Some(at);
    }

    /// Drop entries older than `now - window`, return what is left
    pub fn trim(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        Self::trim_locked(&mut entries, now, self.window);
        entries.len()
    }

    fn trim_locked(entries: &mut VecDeque<(Instant, PathBuf)>, now: Instant, window: Duration) {
        let Some(cutoff) = now.checked_sub(window) else {
            return;
        };
        while let Some((ts, _)) = entries.front() {
            if *ts < cutoff {
                entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Whether the trimmed count has reached the threshold
    pub fn exceeded(&self, now: Instant) -> bool {
        self.trim(now) >= self.threshold
    }

    /// Trim, and if the threshold is reached empty the counter
    ///
    /// Returns the event count and the affected paths, deduplicated without
    /// regard to case.
    pub fn drain_if_exceeded(&self, now: Instant) -> Option<(usize, Vec<PathBuf>)> {
        let mut entries = self.entries.lock();
        Self::trim_locked(&mut entries, now, self.window);
        if entries.len() < self.threshold {
            return None;
        }

        let count = entries.len();
        let mut seen = HashSet::new();
        let paths = entries
            .drain(..)
            .map(|(_, path)| path)
            .filter(|path| seen.insert(path.to_string_lossy().to_lowercase()))
            .collect();
        Some((count, paths))
    }

    /// Trim, and report the count and distinct paths without clearing
    pub fn peek_if_exceeded(&self, now: Instant) -> Option<(usize, Vec<PathBuf>)> {
        let mut entries = self.entries.lock();
        Self::trim_locked(&mut entries, now, self.window);
        if entries.len() < self.threshold {
            return None;
        }

        let mut seen = HashSet::new();
        let paths = entries
            .iter()
            .map(|(_, path)| path.clone())
            .filter(|path| seen.insert(path.to_string_lossy().to_lowercase()))
            .collect();
        Some((entries.len(), paths))
    }

    /// Current timestamps (for inspection)
    pub fn timestamps(&self) -> Vec<Instant> {
        self.entries.lock().iter().map(|(ts, _)| *ts).collect()
    }

    /// True when nothing has been recorded for `idle`
    pub fn is_idle(&self, now: Instant, idle: Duration) -> bool {
        match *self.last_seen.lock() {
            Some(last) => now.saturating_duration_since(last) > idle,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(n: usize) -> PathBuf {
        PathBuf::from(format!("/data/file{}.txt", n))
    }

    #[test]
    fn test_under_threshold() {
        let counter = WindowedCounter::new(Duration::from_secs(1), 3, 100);
        let now = Instant::now();

        counter.record(now, path(1));
        counter.record(now, path(2));

        assert!(!counter.exceeded(now));
        assert!(counter.drain_if_exceeded(now).is_none());
    }

    #[test]
    fn test_triggers_exactly_at_threshold() {
        let counter = WindowedCounter::new(Duration::from_secs(1), 3, 100);
        let start = Instant::now();

        counter.record(start, path(1));
        assert!(!counter.exceeded(start));
        counter.record(start + Duration::from_millis(100), path(2));
        assert!(!counter.exceeded(start + Duration::from_millis(100)));
        counter.record(start + Duration::from_millis(200), path(3));
        assert!(counter.exceeded(start + Duration::from_millis(200)));
    }

    #[test]
    fn test_trim_respects_window_bound() {
        let counter = WindowedCounter::new(Duration::from_secs(1), 100, 100);
        let start = Instant::now();
        let offsets = [0u64, 100, 400, 999, 1000, 1200, 1500, 1999, 2000];
        for ms in offsets {
            counter.record(start + Duration::from_millis(ms), path(ms as usize));
        }

        let now = start + Duration::from_millis(2000);
        counter.trim(now);

        let retained = counter.timestamps();
        for ts in &retained {
            assert!(now - *ts <= Duration::from_secs(1));
        }
        // Everything within the bound survived
        let expected = offsets
            .iter()
            .filter(|ms| 2000 - **ms <= 1000)
            .count();
        assert_eq!(retained.len(), expected);
    }

    #[test]
    fn test_drain_dedups_case_insensitively_and_resets() {
        let counter = WindowedCounter::new(Duration::from_secs(1), 3, 100);
        let now = Instant::now();

        counter.record(now, PathBuf::from("/data/Report.docx"));
        counter.record(now, PathBuf::from("/data/report.DOCX"));
        counter.record(now, PathBuf::from("/data/other.xlsx"));

        let (count, paths) = counter.drain_if_exceeded(now).unwrap();
        assert_eq!(count, 3);
        assert_eq!(paths.len(), 2);
        assert_eq!(counter.trim(now), 0);
    }

    #[test]
    fn test_out_of_order_is_clamped() {
        let counter = WindowedCounter::new(Duration::from_secs(1), 10, 100);
        let start = Instant::now();

        counter.record(start + Duration::from_millis(500), path(1));
        counter.record(start, path(2));

        let ts = counter.timestamps();
        assert!(ts.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_retention_cap() {
        let counter = WindowedCounter::new(Duration::from_secs(60), 1000, 5);
        let now = Instant::now();
        for i in 0..20 {
            counter.record(now, path(i));
        }
        assert_eq!(counter.trim(now), 5);
    }

    #[test]
    fn test_window_expiry() {
        let counter = WindowedCounter::new(Duration::from_millis(100), 3, 100);
        let start = Instant::now();
        for i in 0..3 {
            counter.record(start, path(i));
        }
        assert!(counter.exceeded(start));
        assert!(!counter.exceeded(start + Duration::from_millis(150)));
        assert!(counter.is_idle(start + Duration::from_millis(150), Duration::from_millis(100)));
    }
}
