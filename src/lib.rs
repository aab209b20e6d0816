//! # hdorch: Hierarchical Decomposition Orchestrator
//!
//! `hdorch` turns a free-form product idea into a fully populated,
//! seven-level project hierarchy (Idea → Initiative → Feature → Epic →
//! Story → Task → Subtask), validates each level against confidence-based
//! quality gates with bounded rework, persists the structure into an
//! external issue tracker, and emits a structured progress/event stream
//! for downstream consumers (dashboards, a learning store).
//!
//! ## Core Concepts
//!
//! - **[`idea`]**: the immutable free-text input that starts a run.
//! - **[`hierarchy`]**: the uniform `Node`/`Hierarchy` data model and its
//!   invariants (level monotonicity, parent existence, confidence bounds).
//! - **[`analyzer`]**: the pluggable expansion components and their
//!   deterministic merge algorithm.
//! - **[`gate`]**: the pure pass/rework/abandon decision procedure.
//! - **[`caller`]**: the per-provider concurrency/rate-limit/retry wrapper
//!   every external call is routed through.
//! - **[`pipeline`]**: the seven-stage fan-out/fan-in executor that drives a
//!   `Hierarchy` into existence behind a hard stage barrier.
//! - **[`tracker`]**: bulk issue-tracker writer with topological ordering,
//!   idempotent writes, and subtree pruning on non-retryable failure.
//! - **[`coordinator`]**: the public entry point tying the above together
//!   and producing the final `RunReport`.
//!
//! ## Ambient stack
//!
//! - **[`config`]**: recognized run options, defaults, and pre-flight
//!   validation.
//! - **[`errors`]**: the top-level error taxonomy every fallible operation
//!   resolves to.
//! - **[`diagnostics`]**: the scoped error-ladder record accumulated into a
//!   `RunReport` and rendered by [`telemetry`].
//! - **[`event_bus`]**: the run's consumer-facing newline-delimited-JSON
//!   progress stream, distinct from `tracing` spans.
//! - **[`telemetry`]**: human-readable rendering of events and error chains.
//!
//! ## Quick Start
//!
//! ```no_run
//! use hdorch::analyzer::AnalyzerRegistry;
//! use hdorch::config::Config;
//! use hdorch::coordinator::RunCoordinator;
//! use hdorch::idea::Idea;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! config.validate()?;
//!
//! let registry = AnalyzerRegistry::new();
//! let coordinator = RunCoordinator::new(config, &registry);
//! let idea = Idea::new("Build a URL shortener");
//! let report = coordinator.run(idea).await;
//! # Ok(())
//! # }
//! ```

pub mod analyzer;
pub mod caller;
pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod errors;
pub mod event_bus;
pub mod gate;
pub mod hierarchy;
pub mod idea;
pub mod pipeline;
pub mod telemetry;
pub mod tracker;
