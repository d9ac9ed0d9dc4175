//! Orchestration core for esmbt.
//!
//! This crate ties the schema's `RunConfig` and the runtime collaborators into
//! the `RunOrchestrator`: the fixed build → stop → reset → start pipeline, its
//! stage state machine, the `RunReport` produced once per invocation, and
//! Ctrl-C handling that turns an interrupt into a cancelled stage.

pub mod concurrency;
pub mod lifecycle;
pub mod orchestrator;
pub mod report;

pub use concurrency::install_signal_handler;
pub use lifecycle::{validate_transition, RunPhase, Stage};
pub use orchestrator::{NoopObserver, RunObserver, RunOrchestrator};
pub use report::{FailureKind, RunReport, StageError};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(#[from] esmbt_schema::ConfigError),
    #[error("runtime error: {0}")]
    Runtime(#[from] esmbt_runtime::RuntimeError),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
