//! Threat detection module
//!
//! Rate detection over sliding windows, the rename fast path, and the
//! process scorer that names a culprit once something fires.

pub mod aggregator;
pub mod extension;
pub mod process;
pub mod scorer;
pub mod window;

pub use aggregator::{Aggregator, Trigger, TriggerScope};
pub use extension::{ExtensionSentinel, FastAlert};
pub use process::{ProcessSample, ProcessTable, ProcfsTable};
pub use scorer::{CandidateScorer, ProcessCandidate};
pub use window::WindowedCounter;
