//! Registry of analyzers keyed by the level they produce, dispatching a
//! parent to every registered analyzer for its child level and merging
//! the results.

use std::sync::Arc;

use futures_util::future::join_all;
use rustc_hash::FxHashMap;
use tracing::instrument;

use crate::config::MergeConfig;
use crate::hierarchy::{Level, Node};

use super::{Analyzer, AnalyzerContext, AnalyzerError};

#[derive(Default)]
pub struct AnalyzerRegistry {
    by_level: FxHashMap<Level, Vec<Arc<dyn Analyzer>>>,
}

/// Outcome of dispatching one parent to every analyzer registered for the
/// child level.
pub struct ExpansionOutcome {
    pub children: Vec<Node>,
    /// Analyzer ids whose call failed (recoverably) for this parent.
    pub failed_analyzers: Vec<String>,
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.register(analyzer);
        self
    }

    pub fn register(&mut self, analyzer: Arc<dyn Analyzer>) {
        for level in analyzer.levels() {
            self.by_level
                .entry(*level)
                .or_default()
                .push(Arc::clone(&analyzer));
        }
    }

    pub fn analyzers_for(&self, level: Level) -> &[Arc<dyn Analyzer>] {
        self.by_level.get(&level).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Dispatch `parent` to every analyzer registered for `child_level`,
    /// run them concurrently, and merge the surviving candidates.
    ///
    /// Returns `Err(ExpandError::AllFailed)` only when every analyzer
    /// failed recoverably, the "all analyzers failed" case deferred to
    /// the gate by marking the parent unexpanded. A partial failure (at
    /// least one analyzer succeeded) is reported via `failed_analyzers`
    /// rather than as an error. `Err(ExpandError::FatalAuth)` takes
    /// priority over both: an unrecoverable credential failure from any
    /// one analyzer aborts this expansion regardless of what the others
    /// returned, so the caller can short-circuit the whole run.
    #[instrument(skip(self, context, merge_config), fields(level = %child_level, parent = %parent.local_id))]
    pub async fn expand(
        &self,
        parent: &Node,
        child_level: Level,
        context: &AnalyzerContext,
        merge_config: &MergeConfig,
        priority_order: &[String],
    ) -> Result<ExpansionOutcome, ExpandError> {
        let analyzers = self.analyzers_for(child_level);
        if analyzers.is_empty() {
            return Ok(ExpansionOutcome {
                children: Vec::new(),
                failed_analyzers: Vec::new(),
            });
        }

        let calls = analyzers.iter().map(|analyzer| {
            let analyzer = Arc::clone(analyzer);
            async move {
                let result = analyzer.analyze(parent, context).await;
                (analyzer.id().to_string(), result)
            }
        });

        let results = join_all(calls).await;

        let mut candidates = Vec::new();
        let mut failed_analyzers = Vec::new();
        for (analyzer_id, result) in results {
            match result {
                Ok(mut produced) => {
                    for candidate in &mut produced {
                        candidate.node.parent_local_id = Some(parent.local_id.clone());
                    }
                    candidates.extend(produced);
                }
                Err(AnalyzerError::Auth { provider }) => {
                    tracing::error!(analyzer = %analyzer_id, %provider, "analyzer authentication failed, aborting run");
                    return Err(ExpandError::FatalAuth { provider });
                }
                Err(err) => {
                    tracing::warn!(analyzer = %analyzer_id, error = %err, "analyzer call failed");
                    failed_analyzers.push(analyzer_id);
                }
            }
        }

        if candidates.is_empty() && !failed_analyzers.is_empty() {
            return Err(ExpandError::AllFailed(AllAnalyzersFailed {
                parent_local_id: parent.local_id.clone(),
                attempted: failed_analyzers,
            }));
        }

        let children = super::merge_candidates(candidates, merge_config, priority_order);
        Ok(ExpansionOutcome {
            children,
            failed_analyzers,
        })
    }
}

#[derive(Debug, Clone)]
pub enum ExpandError {
    AllFailed(AllAnalyzersFailed),
    FatalAuth { provider: String },
}

impl std::fmt::Display for ExpandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpandError::AllFailed(err) => write!(f, "{err}"),
            ExpandError::FatalAuth { provider } => write!(f, "provider `{provider}` authentication failed"),
        }
    }
}

impl std::error::Error for ExpandError {}

#[derive(Debug, Clone)]
pub struct AllAnalyzersFailed {
    pub parent_local_id: String,
    pub attempted: Vec<String>,
}

impl std::fmt::Display for AllAnalyzersFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "all {} analyzer(s) failed for parent `{}`",
            self.attempted.len(),
            self.parent_local_id
        )
    }
}

impl std::error::Error for AllAnalyzersFailed {}
