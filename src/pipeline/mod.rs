//! Decomposition Pipeline: the seven-stage fan-out/fan-in executor
//! that drives a [`Hierarchy`](crate::hierarchy::Hierarchy) into
//! existence, one level at a time, behind a hard barrier between levels.

pub mod finalize;
pub mod stage;

use std::sync::Arc;

use tracing::instrument;

use crate::analyzer::{AnalyzerContext, AnalyzerRegistry};
use crate::config::{Config, MergeConfig};
use crate::event_bus::Event;
use crate::event_bus::event::{ParentExpanded, StageComplete, StageRework, StageStarted};
use crate::gate::{GateDecision, QualityGate, QualityReport};
use crate::hierarchy::{Hierarchy, HierarchyError, Level, Node, SiblingDependency};
use crate::idea::Idea;

pub use finalize::compute_sibling_dependencies;
pub use stage::{FanOutGate, ParentOutcome, StageResult};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Hierarchy(#[from] HierarchyError),
    /// An analyzer reported an unrecoverable credential failure; the
    /// whole run aborts rather than just the affected parent's subtree.
    #[error("provider `{provider}` authentication failed")]
    FatalAuth { provider: String },
}

/// How many of a parent's own ancestors (excluding the parent itself,
/// which is passed separately) are carried into analyzer context, to
/// bound prompt size.
const MAX_ANCESTOR_TITLES: usize = 3;

/// Drives the seven-level expansion of a single idea into a hierarchy.
pub struct DecompositionPipeline<'a> {
    registry: &'a AnalyzerRegistry,
    config: &'a Config,
    run_id: String,
    emitter: Option<Arc<dyn crate::event_bus::EventEmitter>>,
    fan_out_gate: Arc<FanOutGate>,
}

impl<'a> DecompositionPipeline<'a> {
    pub fn new(registry: &'a AnalyzerRegistry, config: &'a Config, run_id: impl Into<String>) -> Self {
        Self {
            registry,
            config,
            run_id: run_id.into(),
            emitter: None,
            fan_out_gate: FanOutGate::new(config.caller.max_concurrency),
        }
    }

    #[must_use]
    pub fn with_emitter(mut self, emitter: Arc<dyn crate::event_bus::EventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    fn emit(&self, event: Event) {
        if let Some(emitter) = &self.emitter {
            let _ = emitter.emit(event);
        }
    }

    /// Run the full pipeline: seed the root `Idea` node, expand level by
    /// level down to `Subtask` (every parent at a level fanned out
    /// concurrently, bounded by the fan-out gate, behind a hard barrier
    /// between levels), and finish with the S₇ Finalize pass that
    /// annotates sibling dependencies without expanding anything further.
    #[instrument(skip(self, idea), fields(run_id = %self.run_id))]
    pub async fn run(
        &self,
        idea: &Idea,
    ) -> Result<(Hierarchy, Vec<QualityReport>, Vec<SiblingDependency>), PipelineError> {
        let mut hierarchy = Hierarchy::new();
        let mut reports = Vec::new();

        let root = Node {
            local_id: uuid::Uuid::new_v4().to_string(),
            level: Level::Idea,
            parent_local_id: None,
            title: truncate_title(&idea.description),
            description: idea.description.clone(),
            acceptance_criteria: vec![],
            estimate: None,
            priority: None,
            labels: vec![],
            extra: rustc_hash::FxHashMap::default(),
            confidence: 1.0,
            provenance: Default::default(),
        };
        hierarchy.insert(root)?;

        let mut frontier: Vec<Node> = vec![hierarchy.root().expect("just inserted").clone()];

        for level in Level::ALL.iter().copied() {
            let Some(child_level) = level.child() else {
                break;
            };
            if frontier.is_empty() {
                break;
            }

            self.emit(Event::StageStarted(StageStarted {
                run_id: self.run_id.clone(),
                level: child_level,
                parents_pending: frontier.len(),
                timestamp: chrono::Utc::now(),
            }));

            let stage_result = stage::run_stage(child_level, &self.fan_out_gate, &frontier, |parent| {
                let ancestors = self.ancestor_titles(&hierarchy, &parent);
                self.expand_parent(&idea.description, ancestors, parent, child_level)
            })
            .await;

            if let Some(provider) = stage_result.fatal {
                return Err(PipelineError::FatalAuth { provider });
            }

            for parent in &frontier {
                self.emit_parent_events(parent, child_level, &stage_result);
            }

            for node in &stage_result.next_frontier {
                hierarchy.insert(node.clone())?;
            }
            reports.extend(stage_result.reports.iter().cloned());

            self.emit(Event::StageComplete(StageComplete {
                run_id: self.run_id.clone(),
                level: child_level,
                passed: stage_result.passed,
                abandoned: stage_result.abandoned,
                timestamp: chrono::Utc::now(),
            }));

            frontier = stage_result.next_frontier;
        }

        let dependencies = compute_sibling_dependencies(&hierarchy);

        Ok((hierarchy, reports, dependencies))
    }

    /// Translate one stage's aggregate result back into the
    /// `ParentExpanded`/`StageRework` per-parent events the consumer-facing
    /// stream documents, matched to `parent` by the report it produced.
    fn emit_parent_events(&self, parent: &Node, child_level: Level, stage_result: &StageResult) {
        let Some(report) = stage_result
            .reports
            .iter()
            .find(|r| r.parent_local_id == parent.local_id)
        else {
            return;
        };

        for attempt in 1..report.attempt {
            self.emit(Event::StageRework(StageRework {
                run_id: self.run_id.clone(),
                parent_local_id: parent.local_id.clone(),
                level: child_level,
                attempt,
                reason: "aggregate confidence below threshold".into(),
                timestamp: chrono::Utc::now(),
            }));
        }

        if report.decision == GateDecision::Pass {
            let children_produced = stage_result
                .next_frontier
                .iter()
                .filter(|n| n.parent_local_id.as_deref() == Some(parent.local_id.as_str()))
                .count();
            self.emit(Event::ParentExpanded(ParentExpanded {
                run_id: self.run_id.clone(),
                parent_local_id: parent.local_id.clone(),
                level: child_level,
                children_produced,
                aggregate_confidence: report.aggregate_confidence,
                timestamp: chrono::Utc::now(),
            }));
        }
    }

    /// Walk `parent`'s own ancestor chain (excluding itself) up from its
    /// immediate parent toward the root, keeping only the nearest
    /// [`MAX_ANCESTOR_TITLES`] titles, then present them root-to-nearest
    /// so an analyzer reads them in narrative order.
    fn ancestor_titles(&self, hierarchy: &Hierarchy, parent: &Node) -> Vec<String> {
        let mut titles = Vec::new();
        let mut current = parent.parent_local_id.clone();
        while let Some(id) = current {
            let Some(node) = hierarchy.get(&id) else { break };
            titles.push(node.title.clone());
            if titles.len() >= MAX_ANCESTOR_TITLES {
                break;
            }
            current = node.parent_local_id.clone();
        }
        titles.reverse();
        titles
    }

    /// Expand one parent, rerunning the analyzers for as many rework
    /// cycles as the gate configuration allows before settling on a
    /// terminal `Passed`/`Abandoned` outcome. An abandoned parent never
    /// contributes to `next_frontier` (see [`stage::run_stage`]), so
    /// nothing downstream is ever promoted under an abandoned subtree.
    async fn expand_parent(
        &self,
        idea_description: &str,
        ancestor_titles: Vec<String>,
        parent: Node,
        child_level: Level,
    ) -> ParentOutcome {
        let merge_config: &MergeConfig = &self.config.merge;
        let priority_order: Vec<String> = self
            .registry
            .analyzers_for(child_level)
            .iter()
            .map(|a| a.id().to_string())
            .collect();
        let gate = QualityGate::new(&self.config.gate);

        let mut attempt = 1;
        let mut rework_attempts = Vec::new();
        let mut previous_report: Option<QualityReport> = None;

        loop {
            let context = AnalyzerContext {
                idea_description: idea_description.to_string(),
                ancestor_titles: ancestor_titles.clone(),
                rework_feedback: previous_report.clone(),
            };

            let expansion = self
                .registry
                .expand(&parent, child_level, &context, merge_config, &priority_order)
                .await;

            let mut children = match expansion {
                Ok(outcome) => outcome.children,
                Err(crate::analyzer::ExpandError::FatalAuth { provider }) => {
                    return ParentOutcome::Fatal { provider };
                }
                Err(crate::analyzer::ExpandError::AllFailed(_)) => Vec::new(),
            };
            for child in &mut children {
                child.parent_local_id = Some(parent.local_id.clone());
            }

            let report = gate.evaluate(child_level, &parent.local_id, &children, attempt);
            previous_report = Some(report.clone());

            match report.decision {
                GateDecision::Pass if rework_attempts.is_empty() => {
                    return ParentOutcome::Passed { children, report };
                }
                GateDecision::Pass => {
                    return ParentOutcome::Reworked {
                        attempts: rework_attempts,
                        report,
                        children,
                    };
                }
                GateDecision::Abandon => return ParentOutcome::Abandoned { report },
                GateDecision::Rework => {
                    rework_attempts.push(attempt);
                    attempt += 1;
                    continue;
                }
            }
        }
    }
}

fn truncate_title(description: &str) -> String {
    const MAX_TITLE_LEN: usize = 80;
    if description.len() <= MAX_TITLE_LEN {
        description.to_string()
    } else {
        format!("{}…", &description[..MAX_TITLE_LEN])
    }
}
