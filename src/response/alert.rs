//! Structured alert records and the sinks that receive them

use crate::detector::{FastAlert, ProcessCandidate, Trigger, TriggerScope};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Record type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    WindowAlert,
    FastAlert,
    Candidate,
    ActionResult,
    NoAction,
}

/// One alert, as delivered to a sink
#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub alert: Alert,
}

impl AlertRecord {
    pub fn new(alert: Alert) -> Self {
        Self {
            timestamp: Utc::now(),
            alert,
        }
    }

    pub fn kind(&self) -> AlertKind {
        match self.alert {
            Alert::WindowAlert { .. } => AlertKind::WindowAlert,
            Alert::FastAlert { .. } => AlertKind::FastAlert,
            Alert::Candidate(_) => AlertKind::Candidate,
            Alert::ActionResult { .. } => AlertKind::ActionResult,
            Alert::NoAction { .. } => AlertKind::NoAction,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
    }
}

/// Alert payloads
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Alert {
    WindowAlert {
        #[serde(serialize_with = "serialize_scope")]
        scope: TriggerScope,
        event_count: usize,
        path_count: usize,
        paths: Vec<PathBuf>,
    },
    FastAlert {
        extension: String,
        old_path: PathBuf,
        new_path: PathBuf,
        pid: Option<u32>,
    },
    Candidate(ProcessCandidate),
    ActionResult {
        pid: u32,
        name: String,
        action: ActionKind,
        success: bool,
        error: Option<String>,
    },
    NoAction {
        reason: String,
        top_score: Option<f64>,
    },
}

impl Alert {
    pub fn window(trigger: &Trigger) -> Self {
        Alert::WindowAlert {
            scope: trigger.scope,
            event_count: trigger.event_count,
            path_count: trigger.paths.len(),
            paths: trigger.paths.clone(),
        }
    }

    pub fn fast(alert: &FastAlert, pid: Option<u32>) -> Self {
        Alert::FastAlert {
            extension: alert.extension.clone(),
            old_path: alert.old_path.clone(),
            new_path: alert.new_path.clone(),
            pid,
        }
    }
}

/// Process control actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Suspend,
}

/// `"global"` or the pid number
fn serialize_scope<S: Serializer>(scope: &TriggerScope, s: S) -> Result<S::Ok, S::Error> {
    match scope {
        TriggerScope::Global => s.serialize_str("global"),
        TriggerScope::Process(pid) => s.serialize_u32(*pid),
    }
}

/// Consumer of alert records
pub trait AlertSink: Send + Sync {
    fn emit(&self, record: AlertRecord);
}

/// Writes every record to the log as JSON
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl AlertSink for TracingSink {
    fn emit(&self, record: AlertRecord) {
        let kind = record.kind();
        let json = record.to_json();
        match kind {
            AlertKind::WindowAlert | AlertKind::FastAlert => {
                warn!(target: "ransomwatch::alert", kind = ?kind, record = %json, "alert");
            }
            _ => info!(target: "ransomwatch::alert", kind = ?kind, record = %json, "alert"),
        }
    }
}

/// Forwards records into a channel
#[derive(Debug, Clone)]
pub struct ChannelSink(mpsc::UnboundedSender<AlertRecord>);

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AlertRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }
}

impl AlertSink for ChannelSink {
    fn emit(&self, record: AlertRecord) {
        // Receiver gone means nobody is listening any more
        let _ = self.0.send(record);
    }
}
