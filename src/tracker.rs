//! Tracker Writer: bulk, topologically-ordered persistence of a
//! committed [`Hierarchy`](crate::hierarchy::Hierarchy) into an external
//! issue tracker, with idempotent external keys, partial-failure
//! bucketing (Retryable goes back through the Caller, NonRetryable prunes
//! the affected subtree), and a best-effort post-write pass that links
//! the sibling dependencies [`crate::pipeline::compute_sibling_dependencies`]
//! computed during Finalize.

use std::collections::HashSet;

use async_trait::async_trait;
use futures_util::future::join_all;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use crate::caller::{CallError, Classification, RateLimitedCaller};
use crate::config::WriterConfig;
use crate::hierarchy::{Hierarchy, Level, Node, SiblingDependency};

/// Opaque id assigned by the tracker on creation, distinct from a node's
/// `local_id` (which only ever has meaning inside this run).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteId(pub String);

impl std::fmt::Display for RemoteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Maps a run's local ids to the tracker's remote ids as they are
/// committed. Shared across write batches; the writer holds the only
/// exclusive handle during a write, readers (the post-write link pass)
/// only ever see committed entries.
#[derive(Debug, Default)]
pub struct IdMap {
    remote_of_local: FxHashMap<String, RemoteId>,
}

impl IdMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, local_id: &str) -> Option<&RemoteId> {
        self.remote_of_local.get(local_id)
    }

    fn insert(&mut self, local_id: String, remote_id: RemoteId) {
        self.remote_of_local.insert(local_id, remote_id);
    }

    pub fn len(&self) -> usize {
        self.remote_of_local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remote_of_local.is_empty()
    }
}

/// The fields needed to create one issue in the tracker, level-specific
/// beyond the generic title/description every level carries.
#[derive(Debug, Clone)]
pub struct IssueDraft<'a> {
    pub level: Level,
    pub title: &'a str,
    pub description: &'a str,
    pub acceptance_criteria: &'a [String],
    pub parent_remote_id: Option<&'a RemoteId>,
    /// The tracker-specific link type for the edge to `parent_remote_id`
    /// (e.g. "epic link" vs "parent link"), resolved from
    /// [`WriterConfig::link_type_for`]. Meaningless when
    /// `parent_remote_id` is `None` (the root `Idea` node).
    pub parent_link_type: &'a str,
    /// Idempotency key: deterministic from the node's local id so a retried
    /// create cannot double-create the same node.
    pub external_key: &'a str,
}

/// The external issue tracker this crate writes into. Implementations are
/// expected to be thin wrappers that classify their own errors, the same
/// contract as [`crate::analyzer::Analyzer`]: the writer never talks to a
/// provider except through a [`RateLimitedCaller`].
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Stable identifier used in provenance and error scoping.
    fn id(&self) -> &str;

    /// Look up a previously created issue by its idempotency key, so a
    /// resumed or retried write does not double-create it.
    async fn lookup_by_external_key(
        &self,
        external_key: &str,
    ) -> Result<Option<RemoteId>, (TrackerCallError, Classification)>;

    async fn create_issue(
        &self,
        draft: &IssueDraft<'_>,
    ) -> Result<RemoteId, (TrackerCallError, Classification)>;

    async fn link_issues(
        &self,
        from: &RemoteId,
        to: &RemoteId,
        link_type: &str,
    ) -> Result<(), (TrackerCallError, Classification)>;
}

#[derive(Debug, Clone, Error)]
pub enum TrackerCallError {
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Error, Diagnostic)]
pub enum TrackerError {
    #[error("tracker `{provider}` authentication failed")]
    #[diagnostic(code(hdorch::tracker::auth))]
    Auth { provider: String },

    #[error("tracker call failed: {0}")]
    #[diagnostic(code(hdorch::tracker::call))]
    Call(#[from] CallError),

    #[error("tracker rejected node `{local_id}`: {message}")]
    #[diagnostic(code(hdorch::tracker::rejected))]
    Rejected { local_id: String, message: String },
}

/// One node's write outcome, bucketed by the partial-failure rule below.
enum WriteOutcome {
    Created(RemoteId),
    /// Went back to the Caller's retry budget and still failed; treated
    /// the same as `NonRetryable` by the time it reaches the writer,
    /// since the Caller already exhausted its own retries.
    Retryable(TrackerError),
    NonRetryable(TrackerError),
}

/// What happened when committing one level's batch.
pub struct BatchReport {
    pub level: Level,
    pub created: usize,
    pub failed: usize,
    /// Local ids whose entire subtree was pruned because the node itself
    /// failed non-retryably.
    pub pruned_subtrees: Vec<String>,
}

/// Aggregate outcome of writing a whole hierarchy.
pub struct WriteReport {
    pub id_map: IdMap,
    pub batches: Vec<BatchReport>,
    pub link_failures: Vec<(SiblingDependency, String)>,
}

/// Drives the topological bulk write of a committed hierarchy.
pub struct TrackerWriter<'a> {
    tracker: &'a dyn Tracker,
    caller: RateLimitedCaller,
    config: &'a WriterConfig,
}

impl<'a> TrackerWriter<'a> {
    pub fn new(tracker: &'a dyn Tracker, caller: RateLimitedCaller, config: &'a WriterConfig) -> Self {
        Self {
            tracker,
            caller,
            config,
        }
    }

    /// Write every node in `hierarchy` in strict topological order
    /// (parents before children): levels are written one at a time, but
    /// within a level each `config.batch_size` chunk is submitted to the
    /// Caller concurrently, since every node in a batch shares the same
    /// already-committed parent generation. Finishes with the
    /// best-effort post-write link pass for `dependencies`.
    #[instrument(skip(self, hierarchy, dependencies))]
    pub async fn write(
        &self,
        hierarchy: &Hierarchy,
        dependencies: &[SiblingDependency],
    ) -> WriteReport {
        let mut id_map = IdMap::new();
        let mut pruned: HashSet<String> = HashSet::new();
        let mut batches = Vec::new();

        let ordered = hierarchy.topological_order();
        for level in Level::ALL.iter().copied() {
            let nodes_at_level: Vec<&Node> = ordered.iter().copied().filter(|n| n.level == level).collect();
            if nodes_at_level.is_empty() {
                continue;
            }

            let mut created = 0usize;
            let mut failed = 0usize;
            let mut newly_pruned = Vec::new();

            for batch in nodes_at_level.chunks(self.config.batch_size) {
                let outcomes = join_all(batch.iter().map(|node| {
                    let already_pruned = node
                        .parent_local_id
                        .as_deref()
                        .is_some_and(|parent_id| pruned.contains(parent_id));
                    async move {
                        if already_pruned {
                            (node.local_id.clone(), None)
                        } else {
                            (node.local_id.clone(), Some(self.write_one(node, &id_map).await))
                        }
                    }
                }))
                .await;

                for (local_id, outcome) in outcomes {
                    match outcome {
                        None => {
                            pruned.insert(local_id.clone());
                            newly_pruned.push(local_id);
                        }
                        Some(WriteOutcome::Created(remote_id)) => {
                            id_map.insert(local_id, remote_id);
                            created += 1;
                        }
                        Some(WriteOutcome::Retryable(_)) | Some(WriteOutcome::NonRetryable(_)) => {
                            failed += 1;
                            pruned.insert(local_id.clone());
                            newly_pruned.push(local_id);
                        }
                    }
                }
            }

            batches.push(BatchReport {
                level,
                created,
                failed,
                pruned_subtrees: newly_pruned,
            });
        }

        let link_failures = self.link_siblings(dependencies, &id_map).await;

        WriteReport {
            id_map,
            batches,
            link_failures,
        }
    }

    async fn write_one(&self, node: &Node, id_map: &IdMap) -> WriteOutcome {
        let external_key = external_key_for(node);

        let existing = self
            .caller
            .call(|| {
                let tracker = self.tracker;
                let external_key = external_key.clone();
                async move {
                    tracker
                        .lookup_by_external_key(&external_key)
                        .await
                        .map_err(|(err, class)| (err, class))
                }
            })
            .await;

        match existing {
            Ok(Some(remote_id)) => return WriteOutcome::Created(remote_id),
            Ok(None) => {}
            Err(CallError::Auth { provider }) => {
                return WriteOutcome::NonRetryable(TrackerError::Auth { provider });
            }
            Err(err) => return WriteOutcome::Retryable(TrackerError::Call(err)),
        }

        let parent_remote_id = node.parent_local_id.as_deref().and_then(|id| id_map.get(id));
        let parent_link_type = node
            .level
            .parent_level()
            .map(|parent_level| self.config.link_type_for(parent_level, node.level))
            .unwrap_or(&self.config.default_link_type);
        let draft = IssueDraft {
            level: node.level,
            title: &node.title,
            description: &node.description,
            acceptance_criteria: &node.acceptance_criteria,
            parent_remote_id,
            parent_link_type,
            external_key: &external_key,
        };

        let result = self
            .caller
            .call(|| {
                let tracker = self.tracker;
                let draft = draft.clone();
                async move { tracker.create_issue(&draft).await }
            })
            .await;

        match result {
            Ok(remote_id) => WriteOutcome::Created(remote_id),
            Err(CallError::Auth { provider }) => WriteOutcome::NonRetryable(TrackerError::Auth { provider }),
            Err(CallError::FatalClient { message, .. }) => WriteOutcome::NonRetryable(TrackerError::Rejected {
                local_id: node.local_id.clone(),
                message,
            }),
            Err(err) => WriteOutcome::Retryable(TrackerError::Call(err)),
        }
    }

    /// Best-effort: issue a `link_type_for(parent_level, child_level)`
    /// call for every dependency whose endpoints both committed; a
    /// failure here is recorded but never reopens or fails the write.
    async fn link_siblings(
        &self,
        dependencies: &[SiblingDependency],
        id_map: &IdMap,
    ) -> Vec<(SiblingDependency, String)> {
        let outcomes = join_all(dependencies.iter().map(|dependency| async move {
            let (Some(from), Some(to)) = (
                id_map.get(&dependency.from_local_id),
                id_map.get(&dependency.to_local_id),
            ) else {
                return Some((dependency.clone(), "endpoint was pruned, not linked".to_string()));
            };

            let link_type = self.config.default_link_type.clone();
            let result = self
                .caller
                .call(|| {
                    let tracker = self.tracker;
                    let link_type = link_type.clone();
                    async move { tracker.link_issues(from, to, &link_type).await }
                })
                .await;

            result.err().map(|err| (dependency.clone(), err.to_string()))
        }))
        .await;

        outcomes.into_iter().flatten().collect()
    }
}

/// Deterministic idempotency key derived purely from a node's local id,
/// so a retried create for the same node always resolves to the same
/// external key regardless of how many times it is attempted.
fn external_key_for(node: &Node) -> String {
    format!("hdorch:{}", node.local_id)
}
