use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;

use hdorch::analyzer::{Analyzer, AnalyzerContext, AnalyzerError, AnalyzerRegistry, Candidate};
use hdorch::caller::Classification;
use hdorch::config::Config;
use hdorch::coordinator::{FailureCause, RunCoordinator, RunStatus};
use hdorch::event_bus::{Event, EventBus, MemorySink};
use hdorch::hierarchy::{Estimate, EstimateUnit, Level, Node, Priority};
use hdorch::idea::Idea;
use hdorch::tracker::{IssueDraft, RemoteId, Tracker, TrackerCallError};

fn child_candidate(parent: &Node, child_level: Level, index: usize, confidence: f64, analyzer_id: &str) -> Candidate {
    Candidate {
        node: Node {
            local_id: uuid::Uuid::new_v4().to_string(),
            level: child_level,
            parent_local_id: Some(parent.local_id.clone()),
            title: format!("{} child {index}", parent.title),
            description: "generated".into(),
            acceptance_criteria: vec!["done".into()],
            estimate: Some(Estimate {
                magnitude: 5.0,
                unit: EstimateUnit::Points,
            }),
            priority: Some(Priority::Medium),
            labels: vec!["generated".into()],
            extra: FxHashMap::default(),
            confidence,
            provenance: Default::default(),
        },
        field_confidence: FxHashMap::default(),
        analyzer_id: analyzer_id.into(),
    }
}

/// Always produces two well-formed children at `level` with a confidence
/// comfortably above any default threshold.
struct HighConfidenceAnalyzer {
    level: Level,
}

#[async_trait]
impl Analyzer for HighConfidenceAnalyzer {
    fn id(&self) -> &str {
        "high-confidence"
    }

    fn levels(&self) -> &[Level] {
        std::slice::from_ref(&self.level)
    }

    async fn analyze(&self, parent: &Node, _context: &AnalyzerContext) -> Result<Vec<Candidate>, AnalyzerError> {
        let child_level = parent.level.child().unwrap();
        Ok((0..2)
            .map(|i| child_candidate(parent, child_level, i, 0.95, "high-confidence"))
            .collect())
    }
}

/// Produces low-confidence children on the first attempt, then high
/// confidence ones on every rework attempt after.
struct ReworkThenPassAnalyzer {
    level: Level,
}

#[async_trait]
impl Analyzer for ReworkThenPassAnalyzer {
    fn id(&self) -> &str {
        "rework-then-pass"
    }

    fn levels(&self) -> &[Level] {
        std::slice::from_ref(&self.level)
    }

    async fn analyze(&self, parent: &Node, context: &AnalyzerContext) -> Result<Vec<Candidate>, AnalyzerError> {
        let child_level = parent.level.child().unwrap();
        let confidence = if context.rework_feedback.is_some() { 0.95 } else { 0.3 };
        Ok((0..2)
            .map(|i| child_candidate(parent, child_level, i, confidence, "rework-then-pass"))
            .collect())
    }
}

/// Always produces children just inside the soft-accept band, regardless
/// of how many rework cycles it has already been given.
struct SoftAcceptAnalyzer {
    level: Level,
}

#[async_trait]
impl Analyzer for SoftAcceptAnalyzer {
    fn id(&self) -> &str {
        "soft-accept"
    }

    fn levels(&self) -> &[Level] {
        std::slice::from_ref(&self.level)
    }

    async fn analyze(&self, parent: &Node, _context: &AnalyzerContext) -> Result<Vec<Candidate>, AnalyzerError> {
        let child_level = parent.level.child().unwrap();
        Ok((0..2)
            .map(|i| child_candidate(parent, child_level, i, 0.76, "soft-accept"))
            .collect())
    }
}

/// Sleeps past any reasonable cancellation grace period before returning,
/// so a run can be cancelled mid-expansion.
struct SlowAnalyzer {
    level: Level,
    delay: Duration,
}

#[async_trait]
impl Analyzer for SlowAnalyzer {
    fn id(&self) -> &str {
        "slow"
    }

    fn levels(&self) -> &[Level] {
        std::slice::from_ref(&self.level)
    }

    async fn analyze(&self, parent: &Node, _context: &AnalyzerContext) -> Result<Vec<Candidate>, AnalyzerError> {
        tokio::time::sleep(self.delay).await;
        let child_level = parent.level.child().unwrap();
        Ok((0..2)
            .map(|i| child_candidate(parent, child_level, i, 0.95, "slow"))
            .collect())
    }
}

fn high_confidence_registry() -> AnalyzerRegistry {
    let mut registry = AnalyzerRegistry::new();
    for level in Level::ALL.iter().copied() {
        if let Some(child) = level.child() {
            registry.register(Arc::new(HighConfidenceAnalyzer { level: child }));
        }
    }
    registry
}

/// A full registry of `HighConfidenceAnalyzer`s, except `child_level`
/// (the level a parent at the top of the ladder expands into), which is
/// instead handled by `special`.
fn registry_with_override(child_level: Level, special: Arc<dyn Analyzer>) -> AnalyzerRegistry {
    let mut registry = AnalyzerRegistry::new();
    registry.register(special);
    for level in Level::ALL.iter().copied() {
        if let Some(child) = level.child() {
            if child == child_level {
                continue;
            }
            registry.register(Arc::new(HighConfidenceAnalyzer { level: child }));
        }
    }
    registry
}

struct RejectingTracker {
    issues: StdMutex<FxHashMap<String, RemoteId>>,
    next_id: AtomicUsize,
    reject_level: Level,
}

impl RejectingTracker {
    fn new(reject_level: Level) -> Self {
        Self {
            issues: StdMutex::new(FxHashMap::default()),
            next_id: AtomicUsize::new(1),
            reject_level,
        }
    }
}

#[async_trait]
impl Tracker for RejectingTracker {
    fn id(&self) -> &str {
        "rejecting"
    }

    async fn lookup_by_external_key(
        &self,
        external_key: &str,
    ) -> Result<Option<RemoteId>, (TrackerCallError, Classification)> {
        Ok(self.issues.lock().unwrap().get(external_key).cloned())
    }

    async fn create_issue(&self, draft: &IssueDraft<'_>) -> Result<RemoteId, (TrackerCallError, Classification)> {
        if draft.level == self.reject_level {
            return Err((
                TrackerCallError::Message("rejected by policy".into()),
                Classification::FatalClient,
            ));
        }
        let id = RemoteId(format!("REM-{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        self.issues
            .lock()
            .unwrap()
            .insert(draft.external_key.to_string(), id.clone());
        Ok(id)
    }

    async fn link_issues(
        &self,
        _from: &RemoteId,
        _to: &RemoteId,
        _link_type: &str,
    ) -> Result<(), (TrackerCallError, Classification)> {
        Ok(())
    }
}

#[tokio::test]
async fn a_parent_reworked_once_then_passing_reports_completed_with_warnings() {
    let special = Arc::new(ReworkThenPassAnalyzer { level: Level::Initiative });
    let registry = registry_with_override(Level::Initiative, special);
    let config = Config::default();
    let coordinator = RunCoordinator::new(config, &registry);

    let report = coordinator.run(Idea::new("Build a URL shortener")).await;

    assert_eq!(report.status, RunStatus::CompletedWithWarnings);
    assert!(report.diagnostics.is_empty());
}

#[tokio::test]
async fn a_parent_stuck_in_the_soft_accept_band_completes_with_warnings_instead_of_abandoning() {
    let special = Arc::new(SoftAcceptAnalyzer { level: Level::Initiative });
    let registry = registry_with_override(Level::Initiative, special);
    let config = Config::default();
    let coordinator = RunCoordinator::new(config, &registry);

    let report = coordinator.run(Idea::new("Build a URL shortener")).await;

    assert_eq!(report.status, RunStatus::CompletedWithWarnings);
}

#[tokio::test]
async fn a_tracker_rejection_prunes_a_subtree_and_reports_partially_completed() {
    let registry = high_confidence_registry();
    let tracker = RejectingTracker::new(Level::Epic);
    let config = Config::default();
    let coordinator = RunCoordinator::new(config, &registry).with_tracker(&tracker);

    let report = coordinator.run(Idea::new("Build a URL shortener")).await;

    assert_eq!(report.status, RunStatus::PartiallyCompleted);
    assert!(report.nodes_written < report.nodes_created);
    assert!(!report.pruned_local_ids.is_empty());
}

#[tokio::test]
async fn cancelling_mid_stage_stops_the_run_before_any_stage_completes() {
    let special = Arc::new(SlowAnalyzer {
        level: Level::Initiative,
        delay: Duration::from_millis(300),
    });
    let registry = registry_with_override(Level::Initiative, special);

    let mut config = Config::default();
    config.coordinator.grace_on_cancel = Duration::from_millis(20);
    config.coordinator.run_timeout = Duration::from_secs(5);

    let sink = MemorySink::new();
    let snapshot = sink.clone();
    let bus = EventBus::with_sink(sink);
    bus.listen_for_events();

    let coordinator = RunCoordinator::new(config, &registry).with_emitter(bus.get_emitter());
    let handle = coordinator.cancellation_handle();

    let run_future = coordinator.run(Idea::new("Build a URL shortener"));
    let cancel_after_a_beat = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
    };
    let (report, _) = tokio::join!(run_future, cancel_after_a_beat);

    tokio::time::sleep(Duration::from_millis(50)).await;
    bus.stop_listener().await;

    assert_eq!(
        report.status,
        RunStatus::Failed {
            cause: FailureCause::Cancelled
        }
    );
    assert_eq!(report.nodes_written, 0);

    let entries = snapshot.snapshot();
    assert!(entries.iter().any(|e| matches!(e, Event::RunStarted(_))));
    assert!(entries.iter().any(|e| matches!(e, Event::RunFailed(_))));
    assert!(!entries.iter().any(|e| matches!(e, Event::StageComplete(_))));
    assert!(!entries.iter().any(|e| matches!(e, Event::WriteBatchComplete(_))));
}
