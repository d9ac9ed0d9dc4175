use super::{colorize_stage, exit_code, json_pretty, spin_fail, spin_ok, spinner};
use esmbt_core::{
    install_signal_handler, CoreError, RunObserver, RunOrchestrator, RunReport, Stage,
    StageError,
};
use esmbt_runtime::{
    check_prereqs, format_missing, CancelToken, CommandResetter, ServerController,
    ToolchainBuilder,
};
use esmbt_schema::{load_project, ConfigError, RunConfig};
use indicatif::ProgressBar;
use std::cell::RefCell;
use std::path::Path;
use tracing::debug;

/// Lines of captured collaborator output echoed on failure.
const OUTPUT_TAIL_LINES: usize = 20;

pub struct RunArgs<'a> {
    pub use_x32: bool,
    pub target: &'a str,
    pub log_level: &'a str,
    pub environment: &'a str,
}

fn config_err(e: ConfigError) -> String {
    CoreError::from(e).to_string()
}

pub fn run(project_path: &Path, args: &RunArgs<'_>, json: bool) -> Result<u8, String> {
    let config = RunConfig::from_flags(args.use_x32, args.target, args.log_level, args.environment)
        .map_err(config_err)?;
    let project = load_project(project_path).map_err(config_err)?;
    project.config.check_run(&config).map_err(config_err)?;
    debug!("project root: {}", project.root.display());

    if std::env::var("ESMBT_SKIP_PREREQS").as_deref() != Ok("1") {
        let missing = check_prereqs(&project);
        if !missing.is_empty() {
            return Err(format_missing(&missing));
        }
    }

    let cancel = CancelToken::new();
    install_signal_handler(cancel.clone());

    let builder = ToolchainBuilder::new(project.clone());
    let process = ServerController::new(project.clone());
    let database = CommandResetter::new(project);
    let progress = Progress::new(!json);

    let report = RunOrchestrator::new(&builder, &process, &database)
        .with_observer(&progress)
        .with_cancel(cancel)
        .run(&config)
        .map_err(|e| e.to_string())?;

    if json {
        println!("{}", json_pretty(&report)?);
    } else {
        print_summary(&report);
    }
    Ok(exit_code(&report))
}

/// Renders one spinner per stage.
struct Progress {
    enabled: bool,
    current: RefCell<Option<ProgressBar>>,
}

impl Progress {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            current: RefCell::new(None),
        }
    }
}

fn stage_messages(stage: Stage) -> (&'static str, &'static str) {
    match stage {
        Stage::Idle => ("checking target...", "target supported"),
        Stage::Building => ("building extension...", "extension built"),
        Stage::StoppingServer => ("stopping server...", "server stopped"),
        Stage::ResettingDatabase => ("resetting database...", "database reset"),
        Stage::StartingServer => ("starting server...", "server ready"),
        Stage::Verified => ("verifying...", "verified"),
    }
}

impl RunObserver for Progress {
    fn stage_started(&self, stage: Stage) {
        if self.enabled {
            *self.current.borrow_mut() = Some(spinner(stage_messages(stage).0));
        }
    }

    fn stage_finished(&self, stage: Stage) {
        if let Some(pb) = self.current.borrow_mut().take() {
            spin_ok(&pb, stage_messages(stage).1);
        }
    }

    fn stage_failed(&self, stage: Stage, error: &StageError) {
        let msg = format!("{stage} failed: {}", error.kind);
        match self.current.borrow_mut().take() {
            Some(pb) => spin_fail(&pb, &msg),
            None if self.enabled => eprintln!("✗ {msg}"),
            None => {}
        }
    }
}

fn print_summary(report: &RunReport) {
    if report.success {
        println!("{}: {}", colorize_stage(report.final_stage), report.config);
    } else {
        println!(
            "failed at {}: {}",
            colorize_stage(report.final_stage),
            report.config
        );
    }
    if let Some(artifact) = &report.artifact {
        let short = artifact.digest.get(..12).unwrap_or(&artifact.digest);
        println!("artifact: {} ({short})", artifact.path.display());
    }
    if let Some(handle) = report.server_handle {
        if report.server_possibly_running {
            println!("server:   {handle} may still be running; stop it before the next run");
        } else {
            println!("server:   {handle}");
        }
    }

    for error in &report.errors {
        eprintln!("error: {}", error.message);
        if let Some(output) = &error.output {
            let lines: Vec<&str> = output.lines().collect();
            let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
            for line in &lines[start..] {
                eprintln!("  | {line}");
            }
        }
    }
}
