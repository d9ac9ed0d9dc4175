//! The build → stop → reset → start pipeline.
//!
//! `RunOrchestrator` owns no build or process logic. It sequences the three
//! collaborators, moves a `RunState` through the stage machine in
//! [`crate::lifecycle`], and condenses the outcome into one `RunReport`.

use crate::lifecycle::{validate_transition, RunPhase, Stage};
use crate::report::{RunReport, StageError};
use crate::CoreError;
use chrono::Utc;
use esmbt_runtime::{
    Artifact, CancelToken, DatabaseResetter, ExtensionBuilder, Launch, ProcessController,
    RuntimeError, ServerHandle,
};
use esmbt_schema::RunConfig;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Progress callbacks, invoked synchronously from the pipeline thread.
pub trait RunObserver {
    fn stage_started(&self, _stage: Stage) {}
    fn stage_finished(&self, _stage: Stage) {}
    fn stage_failed(&self, _stage: Stage, _error: &StageError) {}
}

pub struct NoopObserver;

impl RunObserver for NoopObserver {}

/// Mutable progress of a single run. Only the orchestrator changes it.
#[derive(Debug)]
struct RunState {
    phase: RunPhase,
    attempts: BTreeMap<Stage, u32>,
    artifact: Option<Artifact>,
    server_handle: Option<ServerHandle>,
    server_possibly_running: bool,
    errors: Vec<StageError>,
}

impl RunState {
    fn new() -> Self {
        Self {
            phase: RunPhase::At(Stage::Idle),
            attempts: BTreeMap::new(),
            artifact: None,
            server_handle: None,
            server_possibly_running: false,
            errors: Vec::new(),
        }
    }

    fn transition(&mut self, to: RunPhase) -> Result<(), CoreError> {
        validate_transition(self.phase, to)?;
        debug!("run phase: {} -> {to}", self.phase);
        self.phase = to;
        Ok(())
    }

    fn enter(&mut self, stage: Stage) -> Result<(), CoreError> {
        self.transition(RunPhase::At(stage))
    }

    /// Record `error` and move to `Failed` at the current stage.
    fn fail(&mut self, error: StageError) -> Result<(), CoreError> {
        self.transition(RunPhase::Failed(error.stage))?;
        self.errors.push(error);
        Ok(())
    }
}

pub struct RunOrchestrator<'a> {
    builder: &'a dyn ExtensionBuilder,
    process: &'a dyn ProcessController,
    database: &'a dyn DatabaseResetter,
    observer: &'a dyn RunObserver,
    cancel: CancelToken,
    prior: Option<ServerHandle>,
}

impl<'a> RunOrchestrator<'a> {
    pub fn new(
        builder: &'a dyn ExtensionBuilder,
        process: &'a dyn ProcessController,
        database: &'a dyn DatabaseResetter,
    ) -> Self {
        Self {
            builder,
            process,
            database,
            observer: &NoopObserver,
            cancel: CancelToken::new(),
            prior: None,
        }
    }

    pub fn with_observer(mut self, observer: &'a dyn RunObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Stop this server instead of discovering one.
    pub fn with_prior_handle(mut self, handle: ServerHandle) -> Self {
        self.prior = Some(handle);
        self
    }

    /// Execute the pipeline once for `config`.
    ///
    /// Stage failures end up in the report; `Err` is reserved for an illegal
    /// state transition, which indicates a bug rather than a failed run.
    pub fn run(&self, config: &RunConfig) -> Result<RunReport, CoreError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        info!("run started: {config}");

        let mut state = RunState::new();
        self.drive(config, &mut state)?;

        let final_stage = state.phase.stage();
        let success = state.phase == RunPhase::At(Stage::Verified);
        if success {
            info!("run verified in {:.1}s", clock.elapsed().as_secs_f64());
        } else {
            error!("run failed at {final_stage}");
        }

        Ok(RunReport {
            config: *config,
            final_stage,
            success,
            errors: state.errors,
            artifact: state.artifact,
            server_handle: state.server_handle,
            server_possibly_running: state.server_possibly_running,
            attempts: state.attempts,
            started_at: started_at.to_rfc3339(),
            finished_at: Utc::now().to_rfc3339(),
            duration_ms: clock.elapsed().as_millis() as u64,
        })
    }

    fn drive(&self, config: &RunConfig, state: &mut RunState) -> Result<(), CoreError> {
        if !self.builder.supports(config.target_os) {
            let err = RuntimeError::UnsupportedTarget(config.target_os);
            let se = StageError::from_runtime(Stage::Idle, &err);
            self.observer.stage_failed(Stage::Idle, &se);
            return state.fail(se);
        }

        let Some(artifact) = self.stage(state, Stage::Building, || self.builder.build(config))?
        else {
            return Ok(());
        };
        state.artifact = Some(artifact.clone());

        if self
            .stage(state, Stage::StoppingServer, || self.stop_previous())?
            .is_none()
        {
            return Ok(());
        }

        if self
            .stage(state, Stage::ResettingDatabase, || {
                self.database.reset(config.environment)
            })?
            .is_none()
        {
            return Ok(());
        }

        let launch = Launch {
            artifact: &artifact,
            log_level: config.log_level,
            environment: config.environment,
        };
        let Some(handle) = self.stage(state, Stage::StartingServer, || {
            self.process.start(&launch, &self.cancel)
        })?
        else {
            return Ok(());
        };
        state.server_handle = Some(handle);

        state.enter(Stage::Verified)
    }

    /// Enter `stage` and run `op` in it. `Ok(None)` means the stage failed and
    /// the failure is recorded in `state`.
    fn stage<T>(
        &self,
        state: &mut RunState,
        stage: Stage,
        op: impl FnOnce() -> Result<T, RuntimeError>,
    ) -> Result<Option<T>, CoreError> {
        state.enter(stage)?;

        if self.cancel.is_cancelled() {
            warn!("interrupted before {stage}");
            let se = StageError::from_runtime(stage, &RuntimeError::Cancelled { handle: None });
            self.observer.stage_failed(stage, &se);
            state.fail(se)?;
            return Ok(None);
        }

        info!("stage {stage} started");
        self.observer.stage_started(stage);
        *state.attempts.entry(stage).or_insert(0) += 1;

        match op() {
            Ok(value) => {
                info!("stage {stage} finished");
                self.observer.stage_finished(stage);
                Ok(Some(value))
            }
            Err(err) => {
                if let Some(handle) = err.server_handle() {
                    warn!("server ({handle}) may still be running");
                    state.server_handle = Some(handle);
                    state.server_possibly_running = true;
                }
                let se = StageError::from_runtime(stage, &err);
                error!("stage {stage} failed: {err}");
                self.observer.stage_failed(stage, &se);
                state.fail(se)?;
                Ok(None)
            }
        }
    }

    fn stop_previous(&self) -> Result<(), RuntimeError> {
        let handle = match self.prior {
            Some(h) => Some(h),
            None => self.process.discover()?,
        };
        match handle {
            Some(h) => {
                info!("stopping previous server ({h})");
                self.process.stop(&h)
            }
            None => {
                debug!("no previous server to stop");
                Ok(())
            }
        }
    }
}
