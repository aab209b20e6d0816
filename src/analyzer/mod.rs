//! Pluggable analyzer components: the extensibility point through
//! which an LLM-backed or rule-based expander turns one parent node into
//! candidate children at the next level down.

pub mod merge;
pub mod registry;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

use crate::caller::CallError;
use crate::gate::QualityReport;
use crate::hierarchy::{Level, Node};

pub use merge::merge_candidates;
pub use registry::{AnalyzerRegistry, ExpandError};

/// A candidate child produced by an analyzer, not yet merged with other
/// analyzers' candidates or validated against a parent's invariants.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub node: Node,
    /// Per-field confidence, keyed by the same field names `merge`
    /// understands (`title`, `description`, `acceptance_criteria`,
    /// `estimate`, `priority`, `labels`). Fields absent here fall back to
    /// `node.confidence`.
    pub field_confidence: rustc_hash::FxHashMap<String, f64>,
    pub analyzer_id: String,
}

/// Pluggable expansion strategy for a set of hierarchy levels.
///
/// Implementations are expected to be thin wrappers around a
/// [`crate::caller::RateLimitedCaller`]-guarded external call; the
/// registry never calls a provider directly.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Stable identifier used in provenance and error scoping.
    fn id(&self) -> &str;

    /// Levels this analyzer can expand a parent into (the analyzer
    /// receives the parent and produces children one level below it).
    fn levels(&self) -> &[Level];

    /// Produce candidate children for `parent`. `context` carries
    /// whatever upstream data (idea context, ancestor titles) the
    /// analyzer needs to stay grounded.
    async fn analyze(
        &self,
        parent: &Node,
        context: &AnalyzerContext,
    ) -> Result<Vec<Candidate>, AnalyzerError>;
}

/// Read-only context handed to every analyzer call.
#[derive(Debug, Clone)]
pub struct AnalyzerContext {
    pub idea_description: String,
    /// Ancestor titles from the parent's own chain up to `Idea`,
    /// truncated to the last 3 levels to bound prompt size.
    pub ancestor_titles: Vec<String>,
    /// On a rework cycle, the prior attempt's gate report so an analyzer
    /// can see what to fix. `None` on the first attempt.
    pub rework_feedback: Option<QualityReport>,
}

#[derive(Debug, Error, Diagnostic)]
pub enum AnalyzerError {
    #[error("analyzer provider `{provider}` authentication failed")]
    #[diagnostic(code(hdorch::analyzer::auth))]
    Auth { provider: String },

    #[error("analyzer call failed: {0}")]
    #[diagnostic(code(hdorch::analyzer::call))]
    Call(#[from] CallError),

    #[error("analyzer returned malformed output: {0}")]
    #[diagnostic(code(hdorch::analyzer::malformed))]
    Malformed(String),
}

impl AnalyzerError {
    /// `true` when the registry should simply drop this analyzer's
    /// contribution for the parent rather than fail the whole stage (the
    /// "all-analyzers-failed" case is handled one level up, in the
    /// registry, by counting these).
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, AnalyzerError::Auth { .. })
    }
}
