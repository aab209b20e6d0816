//! The orchestrator's versioned, consumer-facing event stream:
//! newline-delimited JSON objects describing run/stage/write progress,
//! distinct from the operator-facing `tracing` spans emitted alongside.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hierarchy::Level;

/// A single event in the run's progress stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    RunStarted(RunStarted),
    StageStarted(StageStarted),
    ParentExpanded(ParentExpanded),
    StageRework(StageRework),
    StageComplete(StageComplete),
    WriteBatchComplete(WriteBatchComplete),
    RunComplete(RunComplete),
    RunFailed(RunFailed),
    Diagnostic(DiagnosticEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStarted {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStarted {
    pub run_id: String,
    pub level: Level,
    pub parents_pending: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentExpanded {
    pub run_id: String,
    pub parent_local_id: String,
    pub level: Level,
    pub children_produced: usize,
    pub aggregate_confidence: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRework {
    pub run_id: String,
    pub parent_local_id: String,
    pub level: Level,
    pub attempt: u32,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageComplete {
    pub run_id: String,
    pub level: Level,
    pub passed: usize,
    pub abandoned: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteBatchComplete {
    pub run_id: String,
    pub batch: u64,
    pub created: usize,
    pub failed: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunComplete {
    pub run_id: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailed {
    pub run_id: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    pub scope: String,
    pub message: String,
    #[serde(default)]
    pub metadata: FxHashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn diagnostic(scope: impl Into<String>, message: impl Into<String>) -> Self {
        Event::Diagnostic(DiagnosticEvent {
            scope: scope.into(),
            message: message.into(),
            metadata: FxHashMap::default(),
            timestamp: Utc::now(),
        })
    }

    /// A short label identifying the emitting scope, used by telemetry
    /// renderers and log correlation.
    pub fn scope_label(&self) -> Option<&str> {
        match self {
            Event::Diagnostic(d) => Some(d.scope.as_str()),
            _ => None,
        }
    }

    pub fn run_id(&self) -> Option<&str> {
        match self {
            Event::RunStarted(e) => Some(&e.run_id),
            Event::StageStarted(e) => Some(&e.run_id),
            Event::ParentExpanded(e) => Some(&e.run_id),
            Event::StageRework(e) => Some(&e.run_id),
            Event::StageComplete(e) => Some(&e.run_id),
            Event::WriteBatchComplete(e) => Some(&e.run_id),
            Event::RunComplete(e) => Some(&e.run_id),
            Event::RunFailed(e) => Some(&e.run_id),
            Event::Diagnostic(_) => None,
        }
    }

    pub fn to_json_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_json_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_started_serializes_with_type_tag() {
        let event = Event::RunStarted(RunStarted {
            run_id: "run-1".into(),
            timestamp: Utc::now(),
        });
        let value = event.to_json_value();
        assert_eq!(value["type"], "run_started");
        assert_eq!(value["run_id"], "run-1");
    }

    #[test]
    fn diagnostic_events_carry_scope_label() {
        let event = Event::diagnostic("caller", "retrying after 429");
        assert_eq!(event.scope_label(), Some("caller"));
    }
}
