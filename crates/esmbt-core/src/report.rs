use crate::lifecycle::Stage;
use crate::CoreError;
use esmbt_runtime::{Artifact, RuntimeError, ServerHandle};
use esmbt_schema::RunConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Classification of a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Configuration,
    BuildFailed,
    ProcessControl,
    EnvironmentMismatch,
    ResetFailed,
    StartupTimeout,
    Cancelled,
    Io,
}

impl FailureKind {
    pub fn of(err: &RuntimeError) -> Self {
        match err {
            RuntimeError::Config(_) | RuntimeError::UnsupportedTarget(_) => {
                FailureKind::Configuration
            }
            RuntimeError::BuildFailed { .. } => FailureKind::BuildFailed,
            RuntimeError::SpawnFailed(_)
            | RuntimeError::ServerExited { .. }
            | RuntimeError::ProcessControl(_) => FailureKind::ProcessControl,
            RuntimeError::EnvironmentMismatch { .. } => FailureKind::EnvironmentMismatch,
            RuntimeError::ResetFailed { .. } => FailureKind::ResetFailed,
            RuntimeError::StartupTimeout { .. } => FailureKind::StartupTimeout,
            RuntimeError::Cancelled { .. } => FailureKind::Cancelled,
            RuntimeError::Io(_) => FailureKind::Io,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Configuration => "configuration",
            FailureKind::BuildFailed => "build_failed",
            FailureKind::ProcessControl => "process_control",
            FailureKind::EnvironmentMismatch => "environment_mismatch",
            FailureKind::ResetFailed => "reset_failed",
            FailureKind::StartupTimeout => "startup_timeout",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Io => "io",
        };
        f.write_str(s)
    }
}

/// A failure recorded against the stage it happened in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    pub stage: Stage,
    pub kind: FailureKind,
    pub message: String,
    /// Captured collaborator output, if any was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl StageError {
    pub fn from_runtime(stage: Stage, err: &RuntimeError) -> Self {
        Self {
            stage,
            kind: FailureKind::of(err),
            message: err.to_string(),
            output: err.output().filter(|o| !o.is_empty()).map(str::to_owned),
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.stage, self.kind, self.message)
    }
}

/// The single summary of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub config: RunConfig,
    /// Verified on success, otherwise the stage the run failed in.
    pub final_stage: Stage,
    pub success: bool,
    pub errors: Vec<StageError>,
    pub artifact: Option<Artifact>,
    pub server_handle: Option<ServerHandle>,
    /// A started server was left running after a timeout or interrupt.
    pub server_possibly_running: bool,
    pub attempts: BTreeMap<Stage, u32>,
    pub started_at: String,
    pub finished_at: String,
    pub duration_ms: u64,
}

impl RunReport {
    /// The error that ended the run, if it failed.
    pub fn failure(&self) -> Option<&StageError> {
        self.errors.last()
    }

    pub fn to_json_pretty(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
