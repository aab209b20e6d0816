//! Top-level error taxonomy for the orchestrator.
//!
//! Every fallible operation the crate exposes ultimately resolves to an
//! [`OrchestratorError`] variant. The taxonomy mirrors the six kinds the run
//! report distinguishes: a malformed configuration, a provider that refused
//! credentials, a provider whose retry budget was exhausted, a quality gate
//! that could not be satisfied within the rework budget, a user-requested
//! cancellation, and anything else (a bug, treated as data rather than a
//! panic so a [`crate::coordinator::RunReport`] can still be produced).

use miette::Diagnostic;
use thiserror::Error;

use crate::analyzer::AnalyzerError;
use crate::caller::CallError;
use crate::config::ConfigError;
use crate::tracker::TrackerError;

#[derive(Debug, Error, Diagnostic)]
pub enum OrchestratorError {
    #[error("invalid configuration: {0}")]
    #[diagnostic(
        code(hdorch::config_invalid),
        help("Check the recognized options and their constraints before starting a run.")
    )]
    ConfigInvalid(#[from] ConfigError),

    #[error("provider authentication failed: {provider}")]
    #[diagnostic(
        code(hdorch::provider_auth),
        help("Verify the credential configured for provider `{provider}` is still valid.")
    )]
    ProviderAuth { provider: String },

    #[error("provider `{provider}` exhausted its retry budget: {message}")]
    #[diagnostic(
        code(hdorch::provider_retryable_exhausted),
        help("The provider kept failing with retryable errors past the configured attempt limit.")
    )]
    ProviderRetryableExhausted { provider: String, message: String },

    #[error("quality gate could not be satisfied for level {level} after {attempts} rework cycles")]
    #[diagnostic(
        code(hdorch::quality_abandon),
        help("Raise `max_rework_per_stage` or lower `confidence_threshold` if this is expected.")
    )]
    QualityAbandon { level: String, attempts: u32 },

    #[error("run cancelled")]
    #[diagnostic(code(hdorch::cancelled))]
    Cancelled,

    #[error("internal error: {0}")]
    #[diagnostic(
        code(hdorch::internal),
        help("This indicates an invariant was violated; please file a report with the run id.")
    )]
    Internal(String),
}

impl From<AnalyzerError> for OrchestratorError {
    fn from(err: AnalyzerError) -> Self {
        match err {
            AnalyzerError::Auth { provider } => OrchestratorError::ProviderAuth { provider },
            AnalyzerError::Call(call_err) => call_err.into(),
            other => OrchestratorError::Internal(other.to_string()),
        }
    }
}

impl From<CallError> for OrchestratorError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Auth { provider } => OrchestratorError::ProviderAuth { provider },
            CallError::RetriesExhausted { provider, last } => {
                OrchestratorError::ProviderRetryableExhausted {
                    provider,
                    message: last,
                }
            }
            CallError::Cancelled => OrchestratorError::Cancelled,
            other => OrchestratorError::Internal(other.to_string()),
        }
    }
}

impl From<TrackerError> for OrchestratorError {
    fn from(err: TrackerError) -> Self {
        match err {
            TrackerError::Auth { provider } => OrchestratorError::ProviderAuth { provider },
            TrackerError::Call(call_err) => call_err.into(),
            other => OrchestratorError::Internal(other.to_string()),
        }
    }
}

/// Construct an `Internal` error carrying a short invariant-violation note.
///
/// This is the only sanctioned way to surface "this should never happen"
/// conditions: it never unwinds the stack, it produces an ordinary `Err` so
/// the coordinator can still finish the run and hand back a `RunReport`
/// describing the failure.
#[macro_export]
macro_rules! invariant_violation {
    ($($arg:tt)*) => {
        $crate::errors::OrchestratorError::Internal(format!($($arg)*))
    };
}
