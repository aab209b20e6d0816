//! Run configuration: the recognized options of the external interface,
//! loaded from an already-parsed value and validated before any
//! provider is instantiated. This crate does not parse a config *file*;
//! that responsibility sits with the embedding binary. It only accepts,
//! defaults, and validates the resulting [`Config`].

use std::time::Duration;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hierarchy::EstimateUnit;

/// Top-level run configuration. All fields have sensible defaults so a
/// caller can start from `Config::default()` and override only what
/// matters for a given run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gate: GateConfig,
    pub caller: CallerConfig,
    pub writer: WriterConfig,
    pub merge: MergeConfig,
    pub coordinator: CoordinatorConfig,
    /// Environment variable holding each provider's API key, keyed by
    /// provider name. Resolved through `dotenvy` at startup rather than
    /// carried in the config value itself.
    pub provider_api_key_env: rustc_hash::FxHashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gate: GateConfig::default(),
            caller: CallerConfig::default(),
            writer: WriterConfig::default(),
            merge: MergeConfig::default(),
            coordinator: CoordinatorConfig::default(),
            provider_api_key_env: rustc_hash::FxHashMap::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// How long in-flight work is given to unwind after cancellation (or
    /// a run timeout) before outstanding operations are reported as
    /// `Cancelled` rather than awaited further.
    #[serde(with = "humantime_like")]
    pub grace_on_cancel: Duration,
    /// Wall-clock budget for the whole run; exceeding it triggers the
    /// same cancellation path as an explicit cancel.
    #[serde(with = "humantime_like")]
    pub run_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            grace_on_cancel: Duration::from_secs(10),
            run_timeout: Duration::from_secs(1_800),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Default minimum aggregate confidence required to Pass a level (τ),
    /// used for any level absent from `per_level_confidence_threshold`.
    pub confidence_threshold: f64,
    /// Per-level overrides of `confidence_threshold`, keyed by level tag
    /// (e.g. `"story"`). A level present here wins over the flat default,
    /// matching the "number or per-level map" shape of the external
    /// configuration interface.
    pub per_level_confidence_threshold: rustc_hash::FxHashMap<crate::hierarchy::Level, f64>,
    /// Rework cycles permitted per stage before the gate abandons the
    /// parent's subtree.
    pub max_rework_per_stage: u32,
    /// Multiplier on the effective threshold that still earns a soft
    /// accept (Pass with warnings) once the rework budget is exhausted:
    /// a level whose aggregate confidence falls below its threshold
    /// but at or above `threshold * soft_accept_ratio` passes rather than
    /// abandons.
    pub soft_accept_ratio: f64,
}

impl GateConfig {
    /// The effective τ for `level`: the per-level override if one is
    /// configured, else the flat `confidence_threshold`.
    pub fn threshold_for(&self, level: crate::hierarchy::Level) -> f64 {
        self.per_level_confidence_threshold
            .get(&level)
            .copied()
            .unwrap_or(self.confidence_threshold)
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.85,
            per_level_confidence_threshold: rustc_hash::FxHashMap::default(),
            max_rework_per_stage: 2,
            soft_accept_ratio: 0.85,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallerConfig {
    pub max_concurrency: usize,
    pub rate_limit_per_second: u32,
    pub max_attempts: u32,
    #[serde(with = "humantime_like")]
    pub base_delay: Duration,
    #[serde(with = "humantime_like")]
    pub max_delay: Duration,
    #[serde(with = "humantime_like")]
    pub request_timeout: Duration,
}

impl Default for CallerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            rate_limit_per_second: 10,
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(20),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub batch_size: usize,
    pub default_estimate_unit: EstimateUnit,
    /// Tracker-specific link type used when creating a sibling dependency
    /// link (e.g. the tracker's "blocks"/"is blocked by" field name),
    /// keyed by `"{parent_level}->{child_level}"` so different trackers'
    /// naming conventions stay out of the orchestrator's own vocabulary.
    /// Falls back to `default_link_type` for any pair without an entry.
    pub link_type_map: rustc_hash::FxHashMap<String, String>,
    pub default_link_type: String,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            default_estimate_unit: EstimateUnit::Points,
            link_type_map: rustc_hash::FxHashMap::default(),
            default_link_type: "parent-of".to_string(),
        }
    }
}

impl WriterConfig {
    /// The link type to use when creating the parent-child edge between a
    /// node at `parent` and its committed child at `child`.
    pub fn link_type_for(&self, parent: crate::hierarchy::Level, child: crate::hierarchy::Level) -> &str {
        let key = format!("{}->{}", parent.encode(), child.encode());
        self.link_type_map
            .get(&key)
            .map(String::as_str)
            .unwrap_or(&self.default_link_type)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Minimum Jaccard similarity on normalized title tokens for two
    /// candidates to be considered duplicates.
    pub dedup_similarity_threshold: f64,
    /// Per-field weights used when computing a node's aggregate
    /// confidence from its merged fields.
    pub field_weights: rustc_hash::FxHashMap<String, f64>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        let field_weights = [
            ("title", 0.15),
            ("description", 0.20),
            ("acceptance_criteria", 0.25),
            ("estimate", 0.20),
            ("priority", 0.10),
            ("labels", 0.10),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self {
            dedup_similarity_threshold: 0.82,
            field_weights,
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("`gate.confidence_threshold` must be within [0, 1], got {0}")]
    #[diagnostic(code(hdorch::config::confidence_threshold))]
    ConfidenceThresholdOutOfRange(f64),

    #[error("`gate.soft_accept_ratio` must be within [0, 1], got {0}")]
    #[diagnostic(code(hdorch::config::soft_accept_ratio))]
    SoftAcceptRatioOutOfRange(f64),

    #[error("`caller.max_concurrency` must be at least 1")]
    #[diagnostic(code(hdorch::config::max_concurrency))]
    ZeroConcurrency,

    #[error("`caller.max_attempts` must be at least 1")]
    #[diagnostic(code(hdorch::config::max_attempts))]
    ZeroAttempts,

    #[error("`caller.base_delay` must not exceed `caller.max_delay`")]
    #[diagnostic(code(hdorch::config::delay_bounds))]
    DelayBoundsInverted,

    #[error("`writer.batch_size` must be at least 1")]
    #[diagnostic(code(hdorch::config::batch_size))]
    ZeroBatchSize,

    #[error("`merge.dedup_similarity_threshold` must be within [0, 1], got {0}")]
    #[diagnostic(code(hdorch::config::dedup_similarity_threshold))]
    DedupThresholdOutOfRange(f64),
}

impl Config {
    /// Validate the configuration before any provider is instantiated,
    /// matching the "pre-flight, before any provider is instantiated"
    /// rule of the error handling design.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.gate.confidence_threshold) {
            return Err(ConfigError::ConfidenceThresholdOutOfRange(
                self.gate.confidence_threshold,
            ));
        }
        for threshold in self.gate.per_level_confidence_threshold.values() {
            if !(0.0..=1.0).contains(threshold) {
                return Err(ConfigError::ConfidenceThresholdOutOfRange(*threshold));
            }
        }
        if !(0.0..=1.0).contains(&self.gate.soft_accept_ratio) {
            return Err(ConfigError::SoftAcceptRatioOutOfRange(
                self.gate.soft_accept_ratio,
            ));
        }
        if self.caller.max_concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.caller.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.caller.base_delay > self.caller.max_delay {
            return Err(ConfigError::DelayBoundsInverted);
        }
        if self.writer.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if !(0.0..=1.0).contains(&self.merge.dedup_similarity_threshold) {
            return Err(ConfigError::DedupThresholdOutOfRange(
                self.merge.dedup_similarity_threshold,
            ));
        }
        Ok(())
    }
}

/// `serde_json`-friendly millisecond encoding for `Duration` fields, since
/// the crate does not depend on `humantime`/`serde_with`.
mod humantime_like {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
