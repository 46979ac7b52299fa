//! Per-run record of processes already dealt with
//!
//! Two sets are kept. `flagged` holds pids whose own window fired; their
//! events stop being counted. `responded` holds pids a response was
//! dispatched for; no pid is ever acted on twice. Both live until
//! [`ResponseState::reset`] (agent restart), never on a timer.

use parking_lot::Mutex;
use std::collections::HashSet;

#[derive(Debug, Default)]
pub struct ResponseState {
    flagged: Mutex<HashSet<u32>>,
    responded: Mutex<HashSet<u32>>,
}

impl ResponseState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a pid's window as fired; false if it already was
    pub fn flag(&self, pid: u32) -> bool {
        self.flagged.lock().insert(pid)
    }

    pub fn is_flagged(&self, pid: u32) -> bool {
        self.flagged.lock().contains(&pid)
    }

    /// Atomically claim the right to respond to `pid`
    ///
    /// Exactly one caller gets `true` per pid per run.
    pub fn try_claim(&self, pid: u32) -> bool {
        self.responded.lock().insert(pid)
    }

    /// Whether a response was already dispatched for `pid`
    pub fn is_handled(&self, pid: u32) -> bool {
        self.responded.lock().contains(&pid)
    }

    /// Pids a response was dispatched for
    pub fn handled(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.responded.lock().iter().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Forget everything (new run)
    pub fn reset(&self) {
        self.flagged.lock().clear();
        self.responded.lock().clear();
    }
}
