use esmbt_core::{FailureKind, RunOrchestrator, RunReport, Stage};
use esmbt_runtime::mock::{
    Call, CallLog, MockBuilder, MockDatabase, MockProcessController, StartBehavior,
};
use esmbt_runtime::{CancelToken, ServerHandle};
use esmbt_schema::{Architecture, Environment, LogLevel, RunConfig, TargetOs};
use std::path::Path;

struct Fixture {
    log: CallLog,
    builder: MockBuilder,
    process: MockProcessController,
    database: MockDatabase,
}

impl Fixture {
    fn new(out: &Path) -> Self {
        let log = CallLog::new();
        Self {
            builder: MockBuilder::new(log.clone(), out),
            process: MockProcessController::new(log.clone()),
            database: MockDatabase::new(log.clone()),
            log,
        }
    }

    fn run(&self, config: &RunConfig) -> RunReport {
        RunOrchestrator::new(&self.builder, &self.process, &self.database)
            .run(config)
            .unwrap()
    }

    fn touched_server_or_database(&self) -> bool {
        self.log.count(|c| {
            matches!(
                c,
                Call::Discover | Call::Stop(_) | Call::Start { .. } | Call::Reset(_)
            )
        }) > 0
    }
}

fn dev_config() -> RunConfig {
    RunConfig::new(
        Architecture::X64,
        TargetOs::Windows,
        LogLevel::Debug,
        Environment::Development,
    )
}

fn all_configs() -> Vec<RunConfig> {
    let mut configs = Vec::new();
    for &architecture in Architecture::ALL {
        for &target_os in TargetOs::ALL {
            for &log_level in LogLevel::ALL {
                for &environment in Environment::ALL {
                    configs.push(RunConfig::new(
                        architecture,
                        target_os,
                        log_level,
                        environment,
                    ));
                }
            }
        }
    }
    configs
}

#[test]
fn every_valid_config_reaches_verified_with_one_artifact() {
    let out = tempfile::tempdir().unwrap();
    for config in all_configs() {
        let fx = Fixture::new(out.path());
        let report = fx.run(&config);

        assert!(report.success, "{config}: {:?}", report.errors);
        assert_eq!(report.final_stage, Stage::Verified);
        assert!(report.errors.is_empty());
        let artifact = report.artifact.expect("artifact");
        assert!(artifact.path.starts_with(
            out.path()
                .join(config.target_os.as_str())
                .join(config.architecture.as_str())
        ));
        assert_eq!(fx.log.count(|c| matches!(c, Call::Build(_))), 1);
    }
}

#[test]
fn scenario_x64_windows_info_development_is_verified() {
    let out = tempfile::tempdir().unwrap();
    let fx = Fixture::new(out.path());
    let config = RunConfig::new(
        Architecture::X64,
        TargetOs::Windows,
        LogLevel::Info,
        Environment::Development,
    );

    let report = fx.run(&config);

    assert!(report.success);
    assert_eq!(report.final_stage, Stage::Verified);
    assert!(report.errors.is_empty());
    assert!(report.server_handle.is_some());
    assert!(!report.server_possibly_running);

    let calls = fx.log.calls();
    let artifact = report.artifact.unwrap().path;
    assert_eq!(
        calls,
        vec![
            Call::Build(config),
            Call::Discover,
            Call::Reset(Environment::Development),
            Call::Start {
                artifact,
                environment: Environment::Development,
            },
        ]
    );
}

#[test]
fn scenario_forced_build_failure_has_no_side_effects() {
    let out = tempfile::tempdir().unwrap();
    let mut fx = Fixture::new(out.path());
    fx.builder = MockBuilder::new(fx.log.clone(), out.path()).failing("linker not found");
    let config = RunConfig::new(
        Architecture::X86,
        TargetOs::Windows,
        LogLevel::Debug,
        Environment::Test,
    );

    let report = fx.run(&config);

    assert!(!report.success);
    assert_eq!(report.final_stage, Stage::Building);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].kind, FailureKind::BuildFailed);
    assert_eq!(report.errors[0].stage, Stage::Building);
    assert!(report.errors[0].output.is_some());
    assert!(report.artifact.is_none());
    assert!(!fx.touched_server_or_database());
}

#[test]
fn reset_failure_never_starts_the_server() {
    let out = tempfile::tempdir().unwrap();
    let mut fx = Fixture::new(out.path());
    fx.database = MockDatabase::new(fx.log.clone()).failing("table locked");

    let report = fx.run(&dev_config());

    assert_eq!(report.final_stage, Stage::ResettingDatabase);
    assert_eq!(report.errors[0].kind, FailureKind::ResetFailed);
    assert_eq!(fx.log.count(|c| matches!(c, Call::Start { .. })), 0);
    assert!(!report.attempts.contains_key(&Stage::StartingServer));
}

#[test]
fn environment_mismatch_stops_before_reset_and_start() {
    let out = tempfile::tempdir().unwrap();
    let mut fx = Fixture::new(out.path());
    fx.database = MockDatabase::new(fx.log.clone()).labelled(Environment::Production);

    let report = fx.run(&dev_config());

    assert_eq!(report.final_stage, Stage::ResettingDatabase);
    assert_eq!(report.errors[0].kind, FailureKind::EnvironmentMismatch);
    assert_eq!(fx.log.count(|c| matches!(c, Call::Reset(_))), 0);
    assert_eq!(fx.log.count(|c| matches!(c, Call::Start { .. })), 0);
}

#[test]
fn previous_server_is_stopped_before_reset() {
    let out = tempfile::tempdir().unwrap();
    let prior = ServerHandle::new(77);
    let mut fx = Fixture::new(out.path());
    fx.process = MockProcessController::new(fx.log.clone()).with_prior(prior);

    let report = fx.run(&dev_config());

    assert!(report.success);
    let calls = fx.log.calls();
    let stop = calls.iter().position(|c| *c == Call::Stop(prior)).unwrap();
    let reset = calls
        .iter()
        .position(|c| matches!(c, Call::Reset(_)))
        .unwrap();
    assert!(stop < reset);
    assert!(!fx.process.is_running(&prior));
}

#[test]
fn stop_failure_is_fatal_to_the_run() {
    let out = tempfile::tempdir().unwrap();
    let mut fx = Fixture::new(out.path());
    fx.process = MockProcessController::new(fx.log.clone())
        .with_prior(ServerHandle::new(5))
        .failing_stop("process survived SIGKILL");

    let report = fx.run(&dev_config());

    assert_eq!(report.final_stage, Stage::StoppingServer);
    assert_eq!(report.errors[0].kind, FailureKind::ProcessControl);
    assert_eq!(fx.log.count(|c| matches!(c, Call::Reset(_))), 0);
}

#[test]
fn startup_timeout_records_possibly_running_handle() {
    let out = tempfile::tempdir().unwrap();
    let mut fx = Fixture::new(out.path());
    fx.process = MockProcessController::new(fx.log.clone()).with_start(StartBehavior::Timeout);

    let report = fx.run(&dev_config());

    assert_eq!(report.final_stage, Stage::StartingServer);
    assert_eq!(report.errors[0].kind, FailureKind::StartupTimeout);
    assert!(report.server_possibly_running);
    let handle = report.server_handle.unwrap();
    assert!(fx.process.is_running(&handle));
}

#[test]
fn unsupported_target_fails_in_idle_without_side_effects() {
    let out = tempfile::tempdir().unwrap();
    let mut fx = Fixture::new(out.path());
    fx.builder = MockBuilder::new(fx.log.clone(), out.path()).supporting(&[TargetOs::Windows]);
    let config = RunConfig::new(
        Architecture::X64,
        TargetOs::Linux,
        LogLevel::Info,
        Environment::Development,
    );

    let report = fx.run(&config);

    assert_eq!(report.final_stage, Stage::Idle);
    assert_eq!(report.errors[0].kind, FailureKind::Configuration);
    assert!(fx.log.calls().is_empty());
    assert!(report.attempts.is_empty());
}

#[test]
fn cancellation_between_stages_fails_the_next_stage() {
    let out = tempfile::tempdir().unwrap();
    let fx = Fixture::new(out.path());
    let cancel = CancelToken::new();
    cancel.cancel();

    let report = RunOrchestrator::new(&fx.builder, &fx.process, &fx.database)
        .with_cancel(cancel)
        .run(&dev_config())
        .unwrap();

    assert_eq!(report.final_stage, Stage::Building);
    assert_eq!(report.errors[0].kind, FailureKind::Cancelled);
    assert!(fx.log.calls().is_empty());
}

#[test]
fn interrupted_start_keeps_the_handle() {
    let out = tempfile::tempdir().unwrap();
    let mut fx = Fixture::new(out.path());
    fx.process = MockProcessController::new(fx.log.clone()).with_start(StartBehavior::Interrupt);

    let report = fx.run(&dev_config());

    assert_eq!(report.final_stage, Stage::StartingServer);
    assert_eq!(report.errors[0].kind, FailureKind::Cancelled);
    assert!(report.server_possibly_running);
    assert!(report.server_handle.is_some());
}

#[test]
fn report_serializes_to_json() {
    let out = tempfile::tempdir().unwrap();
    let fx = Fixture::new(out.path());
    let report = fx.run(&dev_config());

    let json: serde_json::Value = serde_json::from_str(&report.to_json_pretty().unwrap()).unwrap();
    assert_eq!(json["final_stage"], "verified");
    assert_eq!(json["success"], true);
    assert_eq!(json["config"]["architecture"], "x64");
    assert_eq!(json["attempts"]["building"], 1);
    assert_eq!(json["artifact"]["digest"].as_str().unwrap().len(), 64);
}
