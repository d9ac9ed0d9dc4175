//! External collaborators of the esmbt pipeline.
//!
//! This crate implements the leaf layer: the `ExtensionBuilder`,
//! `ProcessController` and `DatabaseResetter` traits, their shell-backed
//! implementations (`ToolchainBuilder`, `ServerController`, `CommandResetter`),
//! recording fakes for tests, and prerequisite checks for the configured
//! executables.

pub mod backend;
pub mod builder;
mod command;
pub mod database;
pub mod mock;
pub mod prereq;
pub mod process;

pub use backend::{
    Artifact, CancelToken, DatabaseResetter, ExtensionBuilder, Launch, ProcessController,
    ServerHandle,
};
pub use builder::{artifact_path, ToolchainBuilder};
pub use database::CommandResetter;
pub use prereq::{check_prereqs, format_missing, MissingPrereq};
pub use process::ServerController;

use esmbt_schema::{ConfigError, Environment, TargetOs};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unsupported target '{0}'")]
    UnsupportedTarget(TargetOs),
    #[error("build failed: {summary}")]
    BuildFailed { summary: String, output: String },
    #[error("server did not become ready within {waited_secs}s ({handle} left running)")]
    StartupTimeout {
        handle: ServerHandle,
        waited_secs: u64,
    },
    #[error("interrupted by the user")]
    Cancelled { handle: Option<ServerHandle> },
    #[error("failed to launch server: {0}")]
    SpawnFailed(String),
    #[error("server ({handle}) exited before becoming ready: {status}")]
    ServerExited {
        handle: ServerHandle,
        status: String,
    },
    #[error("process control failed: {0}")]
    ProcessControl(String),
    #[error(
        "database '{database}' belongs to '{resolved}' but the run targets '{requested}'"
    )]
    EnvironmentMismatch {
        requested: Environment,
        resolved: Environment,
        database: String,
    },
    #[error("database reset failed: {summary}")]
    ResetFailed { summary: String, output: String },
}

impl RuntimeError {
    /// Handle of a server that may still be running after this error.
    pub fn server_handle(&self) -> Option<ServerHandle> {
        match self {
            RuntimeError::StartupTimeout { handle, .. } => Some(*handle),
            RuntimeError::Cancelled { handle } => *handle,
            _ => None,
        }
    }

    /// Captured collaborator output, when there is any.
    pub fn output(&self) -> Option<&str> {
        match self {
            RuntimeError::BuildFailed { output, .. } | RuntimeError::ResetFailed { output, .. } => {
                Some(output)
            }
            _ => None,
        }
    }
}

/// Combine captured stdout and stderr into one transcript.
pub(crate) fn transcript(output: &std::process::Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&stderr);
    }
    text
}

/// Describe how a child process ended.
pub(crate) fn describe_status(status: std::process::ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return format!("killed by signal {sig}");
        }
    }
    "unknown exit status".to_owned()
}
