use crate::RuntimeError;
use esmbt_schema::{Environment, LogLevel, RunConfig, TargetOs};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A built extension at its deterministic, architecture/OS-qualified path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    /// blake3 digest of the file contents.
    pub digest: String,
}

/// Reference to a game-server process, either started by us or discovered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ServerHandle {
    pub pid: u32,
}

impl ServerHandle {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }
}

impl fmt::Display for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.pid)
    }
}

/// Everything the server needs to load a freshly built extension.
#[derive(Debug, Clone, Copy)]
pub struct Launch<'a> {
    pub artifact: &'a Artifact,
    pub log_level: LogLevel,
    pub environment: Environment,
}

/// Shared flag flipped by an interrupt; long waits poll it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub trait ExtensionBuilder: Send + Sync {
    fn supports(&self, target: TargetOs) -> bool;

    /// Compile the extension for `config` and place it at its deterministic
    /// output path. Failures are never retried by the caller.
    fn build(&self, config: &RunConfig) -> Result<Artifact, RuntimeError>;
}

pub trait ProcessController: Send + Sync {
    /// Find a server instance left running by an earlier invocation.
    fn discover(&self) -> Result<Option<ServerHandle>, RuntimeError>;

    /// Stop the server behind `handle`. Stopping a process that is already
    /// gone, or was never started, succeeds.
    fn stop(&self, handle: &ServerHandle) -> Result<(), RuntimeError>;

    /// Launch the server and block until it is ready, the startup timeout
    /// elapses, or `cancel` fires. On timeout or cancellation the error
    /// carries the handle and the process is left running.
    fn start(&self, launch: &Launch<'_>, cancel: &CancelToken)
        -> Result<ServerHandle, RuntimeError>;
}

pub trait DatabaseResetter: Send + Sync {
    /// Clean the persistent store selected by `environment`. Only safe while
    /// the server is stopped; callers enforce that ordering.
    fn reset(&self, environment: Environment) -> Result<(), RuntimeError>;
}
