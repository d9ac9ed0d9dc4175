use esmbt_schema::Project;
use std::fmt;
use std::process::Command;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: String,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// An executable is present if it is an existing path, or found on PATH.
/// Paths resolve exactly as they do at launch.
fn executable_exists(project: &Project, program: &str) -> bool {
    let resolved = project.program(program);
    if resolved.components().count() > 1 {
        return resolved.is_file();
    }
    command_exists(program)
}

/// Check every executable the project file names.
/// Returns a list of missing items. Empty list means all prerequisites are met.
pub fn check_prereqs(project: &Project) -> Vec<MissingPrereq> {
    let config = &project.config;
    let mut missing = Vec::new();

    let toolchain = &config.build.command[0];
    if !executable_exists(project, toolchain) {
        missing.push(MissingPrereq {
            name: toolchain.clone(),
            purpose: "compiling the extension",
            install_hint: "install the Rust toolchain via rustup, plus the cross targets in build.targets",
        });
    }

    if !executable_exists(project, &config.server.binary) {
        missing.push(MissingPrereq {
            name: config.server.binary.clone(),
            purpose: "running the game server",
            install_hint: "point server.binary at the dedicated server executable",
        });
    }

    let clean = &config.database.command[0];
    if !executable_exists(project, clean) {
        missing.push(MissingPrereq {
            name: clean.clone(),
            purpose: "resetting the database",
            install_hint: "install the database client, or fix database.command",
        });
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nesmbt needs these executables to build, deploy and reset.");
    msg
}
