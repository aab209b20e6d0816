//! Scoped error recording shared by every component.
//!
//! This is the orchestrator's equivalent of an error-ladder channel: a
//! small, serializable record of "what failed, where, and why" that the
//! [`crate::coordinator`]'s `RunReport` accumulates across a run and that
//! [`crate::telemetry`] renders for humans. It is deliberately distinct
//! from `tracing` spans/events (operator-facing, ephemeral) and from the
//! consumer-facing [`crate::event_bus::Event`] stream (the documented
//! wire protocol); this type is the thing that gets *stored*.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A recorded error or warning, scoped to the component that raised it.
///
/// # JSON Serialization Format
///
/// ```json
/// {
///   "when": "2026-07-28T10:30:00Z",
///   "scope": { "scope": "analyzer", "id": "feature-decomposer", "level": "feature" },
///   "error": {
///     "message": "provider returned malformed JSON",
///     "cause": { "message": "unexpected token at offset 12", "cause": null, "details": {} },
///     "details": {}
///   },
///   "tags": ["retryable"],
///   "context": {}
/// }
/// ```
///
/// The `scope` field is a tagged union discriminated by `"scope"`:
/// - `"analyzer"`: `id` (string), `level` (string)
/// - `"gate"`: `level` (string)
/// - `"caller"`: `provider` (string)
/// - `"writer"`: `batch` (u64)
/// - `"coordinator"`: no additional fields
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ErrorEvent {
    #[serde(default = "chrono::Utc::now")]
    pub when: DateTime<Utc>,
    #[serde(default)]
    pub scope: ErrorScope,
    #[serde(default)]
    pub error: LadderError,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub context: serde_json::Value,
}

impl ErrorEvent {
    pub fn analyzer<S: Into<String>>(id: S, level: crate::hierarchy::Level, error: LadderError) -> Self {
        Self {
            when: Utc::now(),
            scope: ErrorScope::Analyzer {
                id: id.into(),
                level: level.encode().to_string(),
            },
            error,
            tags: Vec::new(),
            context: serde_json::Value::Null,
        }
    }

    pub fn gate(level: crate::hierarchy::Level, error: LadderError) -> Self {
        Self {
            when: Utc::now(),
            scope: ErrorScope::Gate {
                level: level.encode().to_string(),
            },
            error,
            tags: Vec::new(),
            context: serde_json::Value::Null,
        }
    }

    pub fn caller<S: Into<String>>(provider: S, error: LadderError) -> Self {
        Self {
            when: Utc::now(),
            scope: ErrorScope::Caller {
                provider: provider.into(),
            },
            error,
            tags: Vec::new(),
            context: serde_json::Value::Null,
        }
    }

    pub fn writer(batch: u64, error: LadderError) -> Self {
        Self {
            when: Utc::now(),
            scope: ErrorScope::Writer { batch },
            error,
            tags: Vec::new(),
            context: serde_json::Value::Null,
        }
    }

    pub fn coordinator(error: LadderError) -> Self {
        Self {
            when: Utc::now(),
            scope: ErrorScope::Coordinator,
            error,
            tags: Vec::new(),
            context: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    #[must_use]
    pub fn with_tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.tags.push(tag.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ErrorScope {
    Analyzer { id: String, level: String },
    Gate { level: String },
    Caller { provider: String },
    Writer { batch: u64 },
    #[default]
    Coordinator,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LadderError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<LadderError>>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl Default for LadderError {
    fn default() -> Self {
        LadderError {
            message: String::new(),
            cause: None,
            details: serde_json::Value::Null,
        }
    }
}

impl std::fmt::Display for LadderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for LadderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|c| c as &dyn std::error::Error)
    }
}

impl LadderError {
    pub fn msg<M: Into<String>>(m: M) -> Self {
        LadderError {
            message: m.into(),
            cause: None,
            details: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    #[must_use]
    pub fn with_cause(mut self, cause: LadderError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

/// Format error events with explicit color mode control.
pub fn pretty_print_with_mode(events: &[ErrorEvent], mode: crate::telemetry::FormatterMode) -> String {
    use crate::telemetry::{PlainFormatter, TelemetryFormatter};
    let formatter = PlainFormatter::with_mode(mode);
    let renders = formatter.render_errors(events);
    let mut out = String::new();
    for (idx, render) in renders.into_iter().enumerate() {
        if idx > 0 {
            out.push('\n');
        }
        for line in render.lines {
            out.push_str(&line);
        }
    }
    out
}

/// Format error events as human-readable text with auto-detected color support.
pub fn pretty_print(events: &[ErrorEvent]) -> String {
    pretty_print_with_mode(events, crate::telemetry::FormatterMode::Auto)
}
