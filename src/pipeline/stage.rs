//! Per-stage fan-out/fan-in mechanics: the concurrent expansion of every
//! parent at one level, the backpressure gate bounding how many of those
//! expansions may be in flight at once, and the cross-parent
//! "sibling-aware pass" that the design calls for between merge and the
//! gate.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Notify;

use crate::gate::QualityReport;
use crate::hierarchy::{Level, Node};

/// Terminal outcome of expanding one parent at one level, after as many
/// rework cycles as the gate's configured budget allowed.
pub enum ParentOutcome {
    Passed {
        children: Vec<Node>,
        report: QualityReport,
    },
    /// Reached a terminal decision after one or more internal rework
    /// cycles; `attempts` lists the attempt numbers that were reworked
    /// (for `stage.rework` event emission), `report` is the *final*
    /// decision (Pass or Abandon) for that parent.
    Reworked {
        attempts: Vec<u32>,
        report: QualityReport,
        children: Vec<Node>,
    },
    Abandoned { report: QualityReport },
    /// An analyzer reported an unrecoverable authentication failure;
    /// the whole run must abort rather than just this parent's subtree.
    Fatal { provider: String },
}

/// Aggregate result of fanning a whole stage's parents out and back in.
pub struct StageResult {
    pub level: Level,
    pub next_frontier: Vec<Node>,
    pub reports: Vec<QualityReport>,
    pub passed: usize,
    pub abandoned: usize,
    /// Set when any parent's expansion hit an unrecoverable
    /// authentication failure; the pipeline aborts the whole run rather
    /// than reading `next_frontier`.
    pub fatal: Option<String>,
}

/// Bounds how many parent expansions may be in flight at once: fan-out
/// stops dispatching at a high-water mark
/// (default `4 * concurrency_cap`) and resumes only once the in-flight
/// count drains to a low-water mark (default `2 * concurrency_cap`).
///
/// This is distinct from (and sits above) the per-provider concurrency
/// semaphore inside [`crate::caller::RateLimitedCaller`]: that one bounds
/// in-flight *provider calls*, this one bounds in-flight *parent
/// expansions* so a very wide hierarchy cannot queue unbounded futures.
pub struct FanOutGate {
    inflight: AtomicUsize,
    notify: Notify,
    high_water: usize,
    low_water: usize,
}

impl FanOutGate {
    pub fn new(concurrency_cap: usize) -> Arc<Self> {
        let concurrency_cap = concurrency_cap.max(1);
        Arc::new(Self {
            inflight: AtomicUsize::new(0),
            notify: Notify::new(),
            high_water: concurrency_cap * 4,
            low_water: concurrency_cap * 2,
        })
    }

    /// Block until the in-flight count is below the high-water mark, then
    /// reserve a slot. Callers must pair this with [`Self::release`].
    pub async fn acquire(self: &Arc<Self>) {
        loop {
            let current = self.inflight.load(Ordering::SeqCst);
            if current < self.high_water {
                self.inflight.fetch_add(1, Ordering::SeqCst);
                return;
            }
            self.notify.notified().await;
        }
    }

    pub fn release(self: &Arc<Self>) {
        let previous = self.inflight.fetch_sub(1, Ordering::SeqCst);
        if previous.saturating_sub(1) <= self.low_water {
            self.notify.notify_waiters();
        }
    }

    #[cfg(test)]
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn high_water(&self) -> usize {
        self.high_water
    }
}

/// Run every parent's expansion concurrently (bounded by `gate`),
/// collect results as they complete, then apply the cross-parent
/// sibling-aware pass before handing back the committed children.
///
/// `expand_one` is the per-parent expansion closure (built by
/// [`super::DecompositionPipeline::expand_parent`]); it owns its own
/// rework loop and always resolves to a [`ParentOutcome`].
pub async fn run_stage<F, Fut>(
    level: Level,
    fan_out_gate: &Arc<FanOutGate>,
    parents: &[Node],
    expand_one: F,
) -> StageResult
where
    F: Fn(Node) -> Fut,
    Fut: std::future::Future<Output = ParentOutcome>,
{
    let mut futures = FuturesUnordered::new();

    for parent in parents {
        fan_out_gate.acquire().await;
        let gate = Arc::clone(fan_out_gate);
        let fut = expand_one(parent.clone());
        futures.push(async move {
            let outcome = fut.await;
            gate.release();
            outcome
        });
    }

    let mut next_frontier = Vec::new();
    let mut reports = Vec::new();
    let mut passed = 0usize;
    let mut abandoned = 0usize;
    let mut fatal = None;

    while let Some(outcome) = futures.next().await {
        match outcome {
            ParentOutcome::Passed { children, report } => {
                passed += 1;
                next_frontier.extend(children);
                reports.push(report);
            }
            ParentOutcome::Reworked {
                report, children, ..
            } => {
                match report.decision {
                    crate::gate::GateDecision::Pass => {
                        passed += 1;
                        next_frontier.extend(children);
                    }
                    _ => abandoned += 1,
                }
                reports.push(report);
            }
            ParentOutcome::Abandoned { report } => {
                abandoned += 1;
                reports.push(report);
            }
            ParentOutcome::Fatal { provider } => {
                fatal.get_or_insert(provider);
                break;
            }
        }
    }

    enforce_global_uniqueness(level, &mut next_frontier);

    StageResult {
        level,
        next_frontier,
        reports,
        passed,
        abandoned,
        fatal,
    }
}

/// Levels whose titles must be unique *across the whole run*, not just
/// within a parent's child set. Fixed rather than configurable; see
/// `DESIGN.md` for the reasoning.
const GLOBALLY_UNIQUE_LEVELS: &[Level] = &[Level::Epic];

/// Deterministically disambiguate duplicate titles across different
/// parents' children at levels in [`GLOBALLY_UNIQUE_LEVELS`] by
/// appending a stable numeric suffix to every repeat after the first,
/// in stage-output order.
fn enforce_global_uniqueness(level: Level, nodes: &mut [Node]) {
    if !GLOBALLY_UNIQUE_LEVELS.contains(&level) {
        return;
    }
    let mut seen: HashSet<String> = HashSet::new();
    let mut counts: std::collections::HashMap<String, u32> = std::collections::HashMap::new();
    for node in nodes.iter_mut() {
        let normalized = node.title.trim().to_lowercase();
        if seen.insert(normalized.clone()) {
            continue;
        }
        let count = counts.entry(normalized).or_insert(1);
        *count += 1;
        node.title = format!("{} ({})", node.title, count);
    }
}
