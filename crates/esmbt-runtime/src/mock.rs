//! Recording fakes for the three collaborators.
//!
//! All fakes share a `CallLog` so tests can assert the exact order in which
//! the pipeline touched the builder, the server and the database.

use crate::backend::{
    Artifact, CancelToken, DatabaseResetter, ExtensionBuilder, Launch, ProcessController,
    ServerHandle,
};
use crate::builder::file_digest;
use crate::RuntimeError;
use esmbt_schema::{Architecture, Environment, RunConfig, TargetOs};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Build(RunConfig),
    Discover,
    Stop(ServerHandle),
    Start {
        artifact: PathBuf,
        environment: Environment,
    },
    Reset(Environment),
}

/// Shared, ordered record of collaborator calls.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: Call) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }
}

/// Writes a small fake library instead of compiling.
pub struct MockBuilder {
    log: CallLog,
    output_dir: PathBuf,
    supported: Vec<TargetOs>,
    failure: Option<String>,
}

impl MockBuilder {
    pub fn new(log: CallLog, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            log,
            output_dir: output_dir.into(),
            supported: TargetOs::ALL.to_vec(),
            failure: None,
        }
    }

    pub fn supporting(mut self, targets: &[TargetOs]) -> Self {
        self.supported = targets.to_vec();
        self
    }

    pub fn failing(mut self, summary: &str) -> Self {
        self.failure = Some(summary.to_owned());
        self
    }
}

impl ExtensionBuilder for MockBuilder {
    fn supports(&self, target: TargetOs) -> bool {
        self.supported.contains(&target)
    }

    fn build(&self, config: &RunConfig) -> Result<Artifact, RuntimeError> {
        self.log.record(Call::Build(*config));
        if !self.supports(config.target_os) {
            return Err(RuntimeError::UnsupportedTarget(config.target_os));
        }
        if let Some(summary) = &self.failure {
            return Err(RuntimeError::BuildFailed {
                summary: summary.clone(),
                output: format!("error: {summary}\n"),
            });
        }

        let suffix = match config.architecture {
            Architecture::X86 => "",
            Architecture::X64 => "_x64",
        };
        let path = self
            .output_dir
            .join(config.target_os.as_str())
            .join(config.architecture.as_str())
            .join(format!("mock{suffix}.{}", config.target_os.library_extension()));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, format!("mock-extension:{config}"))?;
        let digest = file_digest(&path)?;
        Ok(Artifact { path, digest })
    }
}

/// How `MockProcessController::start` behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartBehavior {
    #[default]
    Ready,
    /// Never becomes ready; the process stays up.
    Timeout,
    /// Exits before becoming ready.
    Exit,
    /// Fires the cancel token mid-wait.
    Interrupt,
}

pub struct MockProcessController {
    log: CallLog,
    prior: Option<ServerHandle>,
    behavior: StartBehavior,
    stop_failure: Option<String>,
    next_pid: AtomicU32,
    running: Mutex<HashSet<u32>>,
}

impl MockProcessController {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            prior: None,
            behavior: StartBehavior::Ready,
            stop_failure: None,
            next_pid: AtomicU32::new(1000),
            running: Mutex::new(HashSet::new()),
        }
    }

    /// Pretend a server from an earlier run is up and discoverable.
    pub fn with_prior(mut self, handle: ServerHandle) -> Self {
        self.prior = Some(handle);
        self.running.get_mut().unwrap_or_else(PoisonError::into_inner).insert(handle.pid);
        self
    }

    pub fn with_start(mut self, behavior: StartBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn failing_stop(mut self, message: &str) -> Self {
        self.stop_failure = Some(message.to_owned());
        self
    }

    fn running(&self) -> MutexGuard<'_, HashSet<u32>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self, handle: &ServerHandle) -> bool {
        self.running().contains(&handle.pid)
    }

    pub fn running_count(&self) -> usize {
        self.running().len()
    }
}

impl ProcessController for MockProcessController {
    fn discover(&self) -> Result<Option<ServerHandle>, RuntimeError> {
        self.log.record(Call::Discover);
        Ok(self.prior.filter(|h| self.is_running(h)))
    }

    fn stop(&self, handle: &ServerHandle) -> Result<(), RuntimeError> {
        self.log.record(Call::Stop(*handle));
        if let Some(message) = &self.stop_failure {
            return Err(RuntimeError::ProcessControl(message.clone()));
        }
        self.running().remove(&handle.pid);
        Ok(())
    }

    fn start(
        &self,
        launch: &Launch<'_>,
        cancel: &CancelToken,
    ) -> Result<ServerHandle, RuntimeError> {
        self.log.record(Call::Start {
            artifact: launch.artifact.path.clone(),
            environment: launch.environment,
        });
        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled { handle: None });
        }

        let handle = ServerHandle::new(self.next_pid.fetch_add(1, Ordering::SeqCst));
        self.running().insert(handle.pid);
        match self.behavior {
            StartBehavior::Ready => Ok(handle),
            StartBehavior::Timeout => Err(RuntimeError::StartupTimeout {
                handle,
                waited_secs: 1,
            }),
            StartBehavior::Exit => {
                self.running().remove(&handle.pid);
                Err(RuntimeError::ServerExited {
                    handle,
                    status: "exit code 1".to_owned(),
                })
            }
            StartBehavior::Interrupt => {
                cancel.cancel();
                Err(RuntimeError::Cancelled {
                    handle: Some(handle),
                })
            }
        }
    }
}

pub struct MockDatabase {
    log: CallLog,
    failure: Option<String>,
    label: Option<Environment>,
}

impl MockDatabase {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            failure: None,
            label: None,
        }
    }

    pub fn failing(mut self, summary: &str) -> Self {
        self.failure = Some(summary.to_owned());
        self
    }

    /// Label every reset target with `environment`, whatever was requested.
    pub fn labelled(mut self, environment: Environment) -> Self {
        self.label = Some(environment);
        self
    }
}

impl DatabaseResetter for MockDatabase {
    fn reset(&self, environment: Environment) -> Result<(), RuntimeError> {
        if let Some(label) = self.label.filter(|l| *l != environment) {
            return Err(RuntimeError::EnvironmentMismatch {
                requested: environment,
                resolved: label,
                database: format!("mock_{label}"),
            });
        }
        self.log.record(Call::Reset(environment));
        if let Some(summary) = &self.failure {
            return Err(RuntimeError::ResetFailed {
                summary: summary.clone(),
                output: String::new(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use esmbt_schema::LogLevel;

    fn config() -> RunConfig {
        RunConfig::new(
            Architecture::X64,
            TargetOs::Windows,
            LogLevel::Debug,
            Environment::Test,
        )
    }

    #[test]
    fn builder_writes_deterministic_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let log = CallLog::new();
        let builder = MockBuilder::new(log.clone(), dir.path());

        let a = builder.build(&config()).unwrap();
        let b = builder.build(&config()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.path, dir.path().join("windows/x64/mock_x64.dll"));
        assert_eq!(log.count(|c| matches!(c, Call::Build(_))), 2);
    }

    #[test]
    fn builder_failure_carries_output() {
        let dir = tempfile::tempdir().unwrap();
        let builder = MockBuilder::new(CallLog::new(), dir.path()).failing("boom");
        let err = builder.build(&config()).unwrap_err();
        assert_eq!(err.output(), Some("error: boom\n"));
    }

    #[test]
    fn controller_tracks_running_servers() {
        let prior = ServerHandle::new(7);
        let log = CallLog::new();
        let ctl = MockProcessController::new(log.clone()).with_prior(prior);
        assert_eq!(ctl.discover().unwrap(), Some(prior));

        ctl.stop(&prior).unwrap();
        ctl.stop(&prior).unwrap();
        assert_eq!(ctl.discover().unwrap(), None);
        assert_eq!(ctl.running_count(), 0);
    }

    #[test]
    fn timeout_leaves_server_running() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = MockBuilder::new(CallLog::new(), dir.path())
            .build(&config())
            .unwrap();
        let ctl = MockProcessController::new(CallLog::new()).with_start(StartBehavior::Timeout);
        let launch = Launch {
            artifact: &artifact,
            log_level: LogLevel::Debug,
            environment: Environment::Test,
        };

        let err = ctl.start(&launch, &CancelToken::new()).unwrap_err();
        let handle = err.server_handle().unwrap();
        assert!(ctl.is_running(&handle));
    }

    #[test]
    fn mislabelled_database_is_not_reset() {
        let log = CallLog::new();
        let db = MockDatabase::new(log.clone()).labelled(Environment::Production);
        assert!(matches!(
            db.reset(Environment::Test),
            Err(RuntimeError::EnvironmentMismatch { .. })
        ));
        assert!(log.calls().is_empty());
        db.reset(Environment::Production).unwrap();
        assert_eq!(log.calls(), vec![Call::Reset(Environment::Production)]);
    }
}
