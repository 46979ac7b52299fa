//! Threat response module

pub mod actuator;
pub mod alert;
mod state;

pub use actuator::{ActuatorError, ProcessController, SignalController};
pub use alert::{ActionKind, Alert, AlertKind, AlertRecord, AlertSink, ChannelSink, TracingSink};
pub use state::ResponseState;

use crate::detector::ProcessCandidate;

/// Reason recorded when nothing crosses the action threshold
pub const NO_STRONG_CANDIDATE: &str = "no candidate strong enough";

/// Outcome of the decision step of an episode
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Suspend this candidate
    Suspend(ProcessCandidate),
    /// No unhandled candidate crossed the threshold
    Skip { top_score: Option<f64> },
}

/// Determine the response for a ranked candidate list
///
/// Processes already responded to are not considered again this run. Of
/// the rest, a pid named by the trigger wins if it scored at or above the
/// threshold; otherwise the top candidate is used.
pub fn determine_action(
    candidates: &[ProcessCandidate],
    attributed_pid: Option<u32>,
    threshold: f64,
    state: &ResponseState,
) -> Decision {
    let open: Vec<&ProcessCandidate> = candidates
        .iter()
        .filter(|c| !state.is_handled(c.pid))
        .collect();

    let attributed = attributed_pid
        .and_then(|pid| open.iter().find(|c| c.pid == pid && c.score >= threshold));

    match attributed.or_else(|| open.first()) {
        Some(c) if c.score >= threshold => Decision::Suspend((*c).clone()),
        top => Decision::Skip {
            top_score: top.map(|c| c.score),
        },
    }
}
