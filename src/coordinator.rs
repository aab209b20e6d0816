//! Run Coordinator: the public entry point. Validates configuration,
//! drives the Pipeline and (if a tracker is configured) the Writer behind
//! a run-scoped cancellation/timeout, and composes the final
//! [`RunReport`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::instrument;

use crate::analyzer::AnalyzerRegistry;
use crate::caller::RateLimitedCaller;
use crate::config::Config;
use crate::diagnostics::{ErrorEvent, LadderError};
use crate::event_bus::Event;
use crate::event_bus::event::{RunComplete, RunFailed, RunStarted, WriteBatchComplete};
use crate::gate::{GateDecision, QualityReport};
use crate::hierarchy::Level;
use crate::idea::Idea;
use crate::pipeline::DecompositionPipeline;
use crate::tracker::{Tracker, TrackerWriter, WriteReport};

/// Levels whose Abandon decision fails the whole run (k ≤ 2: Initiative,
/// Feature) rather than merely pruning that parent's subtree.
const RUN_FAILING_LEVELS: &[Level] = &[Level::Initiative, Level::Feature];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    ConfigInvalid,
    ProviderAuth,
    QualityAbandon,
    Cancelled,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunStatus {
    /// Every stage passed without a single rework cycle.
    Completed,
    /// Every stage passed, but at least one parent needed rework before
    /// doing so, or a write-time link failure was merely reported.
    CompletedWithWarnings,
    /// At least one subtree (level ≥ 3) was abandoned or pruned, but the
    /// rest of the hierarchy committed.
    PartiallyCompleted,
    /// The run did not produce a usable hierarchy.
    Failed { cause: FailureCause },
}

/// The single structured value a run produces; the Coordinator does not
/// persist anything beyond this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub nodes_created: usize,
    pub nodes_written: usize,
    pub pruned_local_ids: Vec<String>,
    pub link_failures: usize,
    pub diagnostics: Vec<ErrorEvent>,
}

/// Cooperative cancellation handle for one run, in the same spirit as
/// [`crate::caller::CancellationHandle`] but awaited rather than polled,
/// since the Coordinator races it directly against the run's work.
#[derive(Clone)]
pub struct RunCancellationHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl RunCancellationHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(());
    }
}

struct ExecutionOutcome {
    total_nodes: usize,
    reports: Vec<QualityReport>,
    write_report: Option<WriteReport>,
    hard_failure: Option<(FailureCause, LadderError)>,
}

enum RunOutcome {
    Finished(ExecutionOutcome),
    Cancelled,
}

pub struct RunCoordinator<'a> {
    config: Config,
    registry: &'a AnalyzerRegistry,
    tracker: Option<&'a dyn Tracker>,
    emitter: Option<Arc<dyn crate::event_bus::EventEmitter>>,
    cancel_tx: mpsc::UnboundedSender<()>,
    cancel_rx: Mutex<mpsc::UnboundedReceiver<()>>,
}

impl<'a> RunCoordinator<'a> {
    pub fn new(config: Config, registry: &'a AnalyzerRegistry) -> Self {
        let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();
        Self {
            config,
            registry,
            tracker: None,
            emitter: None,
            cancel_tx,
            cancel_rx: Mutex::new(cancel_rx),
        }
    }

    #[must_use]
    pub fn with_tracker(mut self, tracker: &'a dyn Tracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    #[must_use]
    pub fn with_emitter(mut self, emitter: Arc<dyn crate::event_bus::EventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn cancellation_handle(&self) -> RunCancellationHandle {
        RunCancellationHandle {
            tx: self.cancel_tx.clone(),
        }
    }

    fn emit(&self, event: Event) {
        if let Some(emitter) = &self.emitter {
            let _ = emitter.emit(event);
        }
    }

    async fn wait_for_cancel(&self) {
        let _ = self.cancel_rx.lock().await.recv().await;
    }

    /// Drive one run to completion: validate, expand, write, and report.
    /// Always returns a `RunReport` (even on failure) so a caller never
    /// has to unwind a stack to learn what happened, the same
    /// never-panic-on-a-provider-error philosophy extended to the whole run.
    #[instrument(skip(self, idea))]
    pub async fn run(&self, idea: Idea) -> RunReport {
        let run_id = uuid::Uuid::new_v4().to_string();
        self.emit(Event::RunStarted(RunStarted {
            run_id: run_id.clone(),
            timestamp: chrono::Utc::now(),
        }));

        if let Err(err) = self.config.validate() {
            return self.finish_failed(&run_id, FailureCause::ConfigInvalid, LadderError::msg(err.to_string()));
        }

        let mut work = Box::pin(self.execute(&run_id, &idea));
        let cancel_or_timeout = async {
            tokio::select! {
                _ = tokio::time::sleep(self.config.coordinator.run_timeout) => {}
                _ = self.wait_for_cancel() => {}
            }
        };

        // Biased so a cancellation already queued before the run started is
        // never lost to a fast, all-synchronous execution racing it on the
        // very first poll.
        let outcome = tokio::select! {
            biased;
            _ = cancel_or_timeout => {
                match tokio::time::timeout(self.config.coordinator.grace_on_cancel, &mut work).await {
                    Ok(result) => RunOutcome::Finished(result),
                    Err(_) => RunOutcome::Cancelled,
                }
            }
            result = &mut work => RunOutcome::Finished(result),
        };

        match outcome {
            RunOutcome::Cancelled => {
                self.finish_failed(&run_id, FailureCause::Cancelled, LadderError::msg("run cancelled or timed out"))
            }
            RunOutcome::Finished(execution) => self.finish(&run_id, execution),
        }
    }

    /// The actual pipeline → writer sequence, cancellation-agnostic: the
    /// caller is responsible for racing this against a deadline.
    async fn execute(&self, run_id: &str, idea: &Idea) -> ExecutionOutcome {
        let pipeline = DecompositionPipeline::new(self.registry, &self.config, run_id.to_string());
        let pipeline = match &self.emitter {
            Some(emitter) => pipeline.with_emitter(Arc::clone(emitter)),
            None => pipeline,
        };

        let (hierarchy, reports, dependencies) = match pipeline.run(idea).await {
            Ok(result) => result,
            Err(err @ crate::pipeline::PipelineError::FatalAuth { .. }) => {
                return ExecutionOutcome {
                    total_nodes: 0,
                    reports: Vec::new(),
                    write_report: None,
                    hard_failure: Some((FailureCause::ProviderAuth, LadderError::msg(err.to_string()))),
                };
            }
            Err(err) => {
                return ExecutionOutcome {
                    total_nodes: 0,
                    reports: Vec::new(),
                    write_report: None,
                    hard_failure: Some((FailureCause::Internal, LadderError::msg(err.to_string()))),
                };
            }
        };
        let total_nodes = hierarchy.len();

        if let Some((level, attempts)) = fatal_abandon(&reports) {
            return ExecutionOutcome {
                total_nodes,
                reports,
                write_report: None,
                hard_failure: Some((
                    FailureCause::QualityAbandon,
                    LadderError::msg(format!(
                        "quality gate abandoned level {level} after {attempts} rework cycles"
                    )),
                )),
            };
        }

        let write_report = match self.tracker {
            Some(tracker) => {
                let caller = RateLimitedCaller::new("tracker", self.config.caller.clone());
                let writer = TrackerWriter::new(tracker, caller, &self.config.writer);
                let report = writer.write(&hierarchy, &dependencies).await;
                for batch in &report.batches {
                    self.emit(Event::WriteBatchComplete(WriteBatchComplete {
                        run_id: run_id.to_string(),
                        batch: batch.level as u64,
                        created: batch.created,
                        failed: batch.failed,
                        timestamp: chrono::Utc::now(),
                    }));
                }
                Some(report)
            }
            None => None,
        };

        ExecutionOutcome {
            total_nodes,
            reports,
            write_report,
            hard_failure: None,
        }
    }

    fn finish(&self, run_id: &str, execution: ExecutionOutcome) -> RunReport {
        if let Some((cause, error)) = execution.hard_failure {
            return self.finish_failed(run_id, cause, error);
        }

        let any_rework = execution.reports.iter().any(|r| r.attempt > 1);
        let any_abandon = execution.reports.iter().any(|r| r.decision == GateDecision::Abandon);
        let any_pruned = execution
            .write_report
            .as_ref()
            .map(|w| w.batches.iter().any(|b| !b.pruned_subtrees.is_empty()))
            .unwrap_or(false);

        let status = if any_abandon || any_pruned {
            RunStatus::PartiallyCompleted
        } else if any_rework {
            RunStatus::CompletedWithWarnings
        } else {
            RunStatus::Completed
        };

        let nodes_written = execution.write_report.as_ref().map(|w| w.id_map.len()).unwrap_or(0);
        let pruned_local_ids = execution
            .write_report
            .as_ref()
            .map(|w| w.batches.iter().flat_map(|b| b.pruned_subtrees.clone()).collect())
            .unwrap_or_default();
        let link_failures = execution.write_report.as_ref().map(|w| w.link_failures.len()).unwrap_or(0);

        self.emit(Event::RunComplete(RunComplete {
            run_id: run_id.to_string(),
            status: format!("{status:?}"),
            timestamp: chrono::Utc::now(),
        }));

        RunReport {
            run_id: run_id.to_string(),
            status,
            nodes_created: execution.total_nodes,
            nodes_written,
            pruned_local_ids,
            link_failures,
            diagnostics: Vec::new(),
        }
    }

    fn finish_failed(&self, run_id: &str, cause: FailureCause, error: LadderError) -> RunReport {
        self.emit(Event::RunFailed(RunFailed {
            run_id: run_id.to_string(),
            reason: error.message.clone(),
            timestamp: chrono::Utc::now(),
        }));

        RunReport {
            run_id: run_id.to_string(),
            status: RunStatus::Failed { cause: cause.clone() },
            nodes_created: 0,
            nodes_written: 0,
            pruned_local_ids: Vec::new(),
            link_failures: 0,
            diagnostics: vec![ErrorEvent::coordinator(error)],
        }
    }
}

/// The first Abandon decision at a run-failing level (Initiative or
/// Feature), if any, with the attempt count it was abandoned on.
fn fatal_abandon(reports: &[QualityReport]) -> Option<(Level, u32)> {
    reports
        .iter()
        .find(|r| r.decision == GateDecision::Abandon && RUN_FAILING_LEVELS.contains(&r.level))
        .map(|r| (r.level, r.attempt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{Analyzer, AnalyzerContext, AnalyzerError, Candidate};
    use crate::hierarchy::Node;
    use async_trait::async_trait;

    struct StubAnalyzer {
        levels: Vec<Level>,
    }

    #[async_trait]
    impl Analyzer for StubAnalyzer {
        fn id(&self) -> &str {
            "stub"
        }

        fn levels(&self) -> &[Level] {
            &self.levels
        }

        async fn analyze(
            &self,
            parent: &Node,
            _context: &AnalyzerContext,
        ) -> Result<Vec<Candidate>, AnalyzerError> {
            let child_level = parent.level.child().unwrap();
            Ok((0..2)
                .map(|i| Candidate {
                    node: Node {
                        local_id: uuid::Uuid::new_v4().to_string(),
                        level: child_level,
                        parent_local_id: Some(parent.local_id.clone()),
                        title: format!("{} child {i}", parent.title),
                        description: "generated".into(),
                        acceptance_criteria: vec!["done".into()],
                        estimate: Some(crate::hierarchy::Estimate {
                            magnitude: 5.0,
                            unit: crate::hierarchy::EstimateUnit::Points,
                        }),
                        priority: Some(crate::hierarchy::Priority::Medium),
                        labels: vec!["generated".into()],
                        extra: rustc_hash::FxHashMap::default(),
                        confidence: 0.95,
                        provenance: Default::default(),
                    },
                    field_confidence: rustc_hash::FxHashMap::default(),
                    analyzer_id: "stub".into(),
                })
                .collect())
        }
    }

    fn registry() -> AnalyzerRegistry {
        let mut registry = AnalyzerRegistry::new();
        for level in Level::ALL.iter().copied() {
            if let Some(child) = level.child() {
                registry.register(Arc::new(StubAnalyzer { levels: vec![child] }));
            }
        }
        registry
    }

    #[tokio::test]
    async fn happy_path_completes_without_a_tracker() {
        let registry = registry();
        let config = Config::default();
        let coordinator = RunCoordinator::new(config, &registry);
        let report = coordinator.run(Idea::new("Build a URL shortener")).await;
        assert_eq!(report.status, RunStatus::Completed);
        assert!(report.diagnostics.is_empty());
    }

    #[tokio::test]
    async fn provider_auth_failure_aborts_before_any_tracker_call() {
        struct AuthFailingAnalyzer;

        #[async_trait]
        impl Analyzer for AuthFailingAnalyzer {
            fn id(&self) -> &str {
                "auth-failing"
            }

            fn levels(&self) -> &[Level] {
                &[Level::Initiative]
            }

            async fn analyze(
                &self,
                _parent: &Node,
                _context: &AnalyzerContext,
            ) -> Result<Vec<Candidate>, AnalyzerError> {
                Err(AnalyzerError::Auth {
                    provider: "llm-provider".into(),
                })
            }
        }

        let mut registry = AnalyzerRegistry::new();
        registry.register(Arc::new(AuthFailingAnalyzer));
        let config = Config::default();
        let coordinator = RunCoordinator::new(config, &registry);
        let report = coordinator.run(Idea::new("Build a URL shortener")).await;

        assert_eq!(
            report.status,
            RunStatus::Failed {
                cause: FailureCause::ProviderAuth
            }
        );
        assert_eq!(report.nodes_written, 0);
    }

    #[tokio::test]
    async fn invalid_config_fails_before_any_call() {
        let registry = registry();
        let mut config = Config::default();
        config.gate.confidence_threshold = 5.0;
        let coordinator = RunCoordinator::new(config, &registry);
        let report = coordinator.run(Idea::new("Build a URL shortener")).await;
        assert_eq!(
            report.status,
            RunStatus::Failed {
                cause: FailureCause::ConfigInvalid
            }
        );
    }

    #[tokio::test]
    async fn cancellation_handle_can_be_signalled_without_panicking() {
        let registry = registry();
        let config = Config::default();
        let coordinator = RunCoordinator::new(config, &registry);
        let handle = coordinator.cancellation_handle();
        // A run's own work can still legitimately finish inside the grace
        // period after a cancel signal (see `run`'s biased race); this
        // only asserts that signalling and then completing a run never
        // panics or deadlocks, not which status wins the race.
        handle.cancel();
        let report = coordinator.run(Idea::new("Build a URL shortener")).await;
        assert!(!report.run_id.is_empty());
    }
}
