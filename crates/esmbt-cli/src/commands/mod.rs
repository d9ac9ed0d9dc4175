pub mod run;

use esmbt_core::{FailureKind, RunReport, Stage};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_BUILD_FAILED: u8 = 3;
pub const EXIT_STOP_FAILED: u8 = 4;
pub const EXIT_RESET_FAILED: u8 = 5;
pub const EXIT_START_FAILED: u8 = 6;
/// Conventional status for a run stopped by SIGINT.
pub const EXIT_INTERRUPTED: u8 = 130;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_stage(stage: Stage) -> String {
    use console::Style;
    let text = stage.to_string();
    match stage {
        Stage::Verified => Style::new().green().bold().apply_to(text).to_string(),
        Stage::Idle => Style::new().dim().apply_to(text).to_string(),
        _ => Style::new().red().apply_to(text).to_string(),
    }
}

/// Process exit code for a finished run.
pub fn exit_code(report: &RunReport) -> u8 {
    if report.success {
        return EXIT_SUCCESS;
    }
    let Some(failure) = report.failure() else {
        return EXIT_FAILURE;
    };
    match failure.kind {
        FailureKind::Configuration => return EXIT_CONFIG_ERROR,
        // Recorded against whichever stage was next, so the stage says nothing.
        FailureKind::Cancelled => return EXIT_INTERRUPTED,
        _ => {}
    }
    match failure.stage {
        Stage::Idle => EXIT_CONFIG_ERROR,
        Stage::Building => EXIT_BUILD_FAILED,
        Stage::StoppingServer => EXIT_STOP_FAILED,
        Stage::ResettingDatabase => EXIT_RESET_FAILED,
        Stage::StartingServer => EXIT_START_FAILED,
        Stage::Verified => EXIT_FAILURE,
    }
}
