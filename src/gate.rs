//! Quality Gate: a pure function of a level's produced nodes and
//! the configured thresholds, deciding Pass / Rework / Abandon.
//!
//! Grounded on the Pass/Fail/Defer stage-decision shape used elsewhere in
//! this lineage for admission control, adapted to the three-way
//! Pass/Rework/Abandon vocabulary this design calls for.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::config::GateConfig;
use crate::hierarchy::{Level, Node};

/// The gate's verdict for a single parent's batch of produced children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateDecision {
    /// Confidence and validation both clear the bar; proceed.
    Pass,
    /// Below the bar but within the rework budget; the pipeline should
    /// re-invoke the analyzers for the violating nodes.
    Rework,
    /// Rework budget exhausted or an unrecoverable violation; the
    /// parent's subtree is abandoned.
    Abandon,
}

/// A single violation found while grading a batch of nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Violation {
    DuplicateTitle { local_id: String },
    MissingRequiredField { local_id: String, field: String },
    InvalidEstimateUnit { local_id: String },
    MissingPriority { local_id: String },
}

/// The gate's full report for one parent's batch, retained in the final
/// `RunReport`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub level: Level,
    pub parent_local_id: String,
    pub aggregate_confidence: f64,
    pub violations: Vec<Violation>,
    pub decision: GateDecision,
    pub attempt: u32,
}

/// Pure quality gate. Holds no state; every call is a deterministic
/// function of its inputs and the configured thresholds.
pub struct QualityGate<'a> {
    config: &'a GateConfig,
}

impl<'a> QualityGate<'a> {
    pub fn new(config: &'a GateConfig) -> Self {
        Self { config }
    }

    /// Grade `children` produced for `parent_local_id` at `level`, on
    /// `attempt`-th try (1-indexed). Required fields are level-specific:
    /// every level requires a title and description; `Story` and below
    /// additionally require acceptance criteria and a priority.
    pub fn evaluate(
        &self,
        level: Level,
        parent_local_id: &str,
        children: &[Node],
        attempt: u32,
    ) -> QualityReport {
        let violations = self.collect_violations(level, children);

        // Zero children at a level expected to expand counts as zero
        // confidence, so an empty batch cannot slip past
        // the gate simply for lacking anything to grade.
        let aggregate_confidence = if children.is_empty() {
            if level == Level::Subtask { 1.0 } else { 0.0 }
        } else {
            children.iter().map(|n| n.confidence).sum::<f64>() / children.len() as f64
        };

        let has_violations = !violations.is_empty();
        let threshold = self.config.threshold_for(level);
        let soft_accept_threshold = threshold * self.config.soft_accept_ratio;

        let decision = if aggregate_confidence >= threshold && !has_violations {
            GateDecision::Pass
        } else if attempt <= self.config.max_rework_per_stage {
            GateDecision::Rework
        } else if aggregate_confidence >= soft_accept_threshold {
            // Rework budget exhausted but still within the soft-accept
            // band: pass with warnings rather than abandon the subtree.
            GateDecision::Pass
        } else {
            GateDecision::Abandon
        };

        QualityReport {
            level,
            parent_local_id: parent_local_id.to_string(),
            aggregate_confidence,
            violations,
            decision,
            attempt,
        }
    }

    fn collect_violations(&self, level: Level, children: &[Node]) -> Vec<Violation> {
        let mut violations = Vec::new();
        let mut seen_titles: HashSet<String> = HashSet::new();

        for node in children {
            let normalized_title = node.title.trim().to_lowercase();
            if !seen_titles.insert(normalized_title) {
                violations.push(Violation::DuplicateTitle {
                    local_id: node.local_id.clone(),
                });
            }
            if node.title.trim().is_empty() {
                violations.push(Violation::MissingRequiredField {
                    local_id: node.local_id.clone(),
                    field: "title".into(),
                });
            }
            if node.description.trim().is_empty() {
                violations.push(Violation::MissingRequiredField {
                    local_id: node.local_id.clone(),
                    field: "description".into(),
                });
            }
            if requires_acceptance_criteria(level) && node.acceptance_criteria.is_empty() {
                violations.push(Violation::MissingRequiredField {
                    local_id: node.local_id.clone(),
                    field: "acceptance_criteria".into(),
                });
            }
            if requires_priority(level) && node.priority.is_none() {
                violations.push(Violation::MissingPriority {
                    local_id: node.local_id.clone(),
                });
            }
            if requires_non_empty_labels(level) && node.labels.is_empty() {
                violations.push(Violation::MissingRequiredField {
                    local_id: node.local_id.clone(),
                    field: "labels".into(),
                });
            }
            match node.estimate {
                Some(estimate) => {
                    let valid = match estimate.unit {
                        crate::hierarchy::EstimateUnit::Points => crate::analyzer::merge::FIBONACCI_POINTS
                            .iter()
                            .any(|p| (p - estimate.magnitude).abs() < f64::EPSILON),
                        crate::hierarchy::EstimateUnit::Hours | crate::hierarchy::EstimateUnit::Days => {
                            estimate.magnitude >= 0.0
                        }
                    };
                    if !valid {
                        violations.push(Violation::InvalidEstimateUnit {
                            local_id: node.local_id.clone(),
                        });
                    }
                }
                None if requires_estimate(level) => {
                    violations.push(Violation::MissingRequiredField {
                        local_id: node.local_id.clone(),
                        field: "estimate".into(),
                    });
                }
                None => {}
            }
        }
        violations
    }
}

fn requires_acceptance_criteria(level: Level) -> bool {
    matches!(level, Level::Story | Level::Task)
}

fn requires_priority(level: Level) -> bool {
    matches!(level, Level::Story | Level::Task | Level::Subtask)
}

fn requires_estimate(level: Level) -> bool {
    matches!(level, Level::Task | Level::Subtask)
}

fn requires_non_empty_labels(level: Level) -> bool {
    matches!(level, Level::Epic | Level::Story | Level::Task | Level::Subtask)
}
