use crate::backend::{Artifact, ExtensionBuilder};
use crate::command::run_bounded;
use crate::{describe_status, transcript, RuntimeError};
use esmbt_schema::{Architecture, Project, RunConfig, TargetOs};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info};

/// Deterministic location of the deployed extension for `config`.
///
/// `<output_dir>/<os>/<arch>/<name>[_x64].<ext>`, following the game's
/// naming for 32- and 64-bit extensions.
pub fn artifact_path(project: &Project, config: &RunConfig) -> PathBuf {
    let build = &project.config.build;
    let suffix = match config.architecture {
        Architecture::X86 => "",
        Architecture::X64 => "_x64",
    };
    let file_name = format!(
        "{}{suffix}.{}",
        build.extension_name,
        config.target_os.library_extension()
    );
    project
        .resolve(&build.output_dir)
        .join(config.target_os.as_str())
        .join(config.architecture.as_str())
        .join(file_name)
}

/// Compile an extension by shelling out to the configured toolchain.
pub struct ToolchainBuilder {
    project: Project,
}

impl ToolchainBuilder {
    pub fn new(project: Project) -> Self {
        Self { project }
    }

    fn working_dir(&self) -> PathBuf {
        self.project.resolve(&self.project.config.build.working_dir)
    }

    /// Where the toolchain leaves the library before it is copied out.
    fn compiled_path(&self, config: &RunConfig) -> PathBuf {
        let build = &self.project.config.build;
        let target_dir = Path::new(&build.target_dir);
        let target_dir = if target_dir.is_absolute() {
            target_dir.to_path_buf()
        } else {
            self.working_dir().join(target_dir)
        };
        target_dir
            .join(config.target_triple())
            .join(&build.profile)
            .join(config.target_os.toolchain_library_name(&build.crate_name))
    }

    fn command(&self, config: &RunConfig) -> Command {
        let argv = &self.project.config.build.command;
        let mut cmd = Command::new(self.project.program(&argv[0]));
        cmd.args(&argv[1..])
            .args(["--target", config.target_triple()])
            .current_dir(self.working_dir())
            .env("ESM_LOG_LEVEL", config.log_level.as_str())
            .env("ESM_ENV", config.environment.as_str())
            .env("ESM_ARCH", config.architecture.as_str());
        if let Some(sha) = git_sha_short(&self.project.root) {
            cmd.env("ESM_BUILD_SHA", sha);
        }
        cmd
    }
}

impl ExtensionBuilder for ToolchainBuilder {
    fn supports(&self, target: TargetOs) -> bool {
        self.project.config.build.targets.contains(&target)
    }

    fn build(&self, config: &RunConfig) -> Result<Artifact, RuntimeError> {
        if !self.supports(config.target_os) {
            return Err(RuntimeError::UnsupportedTarget(config.target_os));
        }

        let mut cmd = self.command(config);
        debug!("running toolchain: {cmd:?}");
        let limit = Duration::from_secs(self.project.config.build.timeout_secs);
        let finished = run_bounded(&mut cmd, limit).map_err(|e| RuntimeError::BuildFailed {
            summary: format!(
                "failed to run '{}': {e}",
                self.project.config.build.command[0]
            ),
            output: String::new(),
        })?;
        let output = finished.output;
        let text = transcript(&output);

        if finished.timed_out {
            return Err(RuntimeError::BuildFailed {
                summary: format!("toolchain timed out after {}s", limit.as_secs()),
                output: text,
            });
        }
        if !output.status.success() {
            let summary = first_error_line(&text).map_or_else(
                || format!("toolchain failed with {}", describe_status(output.status)),
                str::to_owned,
            );
            return Err(RuntimeError::BuildFailed {
                summary,
                output: text,
            });
        }

        let compiled = self.compiled_path(config);
        if !compiled.is_file() {
            return Err(RuntimeError::BuildFailed {
                summary: format!(
                    "toolchain succeeded but produced no library at {}",
                    compiled.display()
                ),
                output: text,
            });
        }

        let dest = artifact_path(&self.project, config);
        install(&compiled, &dest)?;
        let digest = file_digest(&dest)?;
        info!("extension built: {}", dest.display());
        Ok(Artifact { path: dest, digest })
    }
}

/// Copy `src` over `dest`, creating parent directories.
pub(crate) fn install(src: &Path, dest: &Path) -> Result<(), RuntimeError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dest)?;
    Ok(())
}

pub(crate) fn file_digest(path: &Path) -> Result<String, RuntimeError> {
    let bytes = fs::read(path)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

fn first_error_line(output: &str) -> Option<&str> {
    output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("error: ") || line.starts_with("error["))
}

fn git_sha_short(dir: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .current_dir(dir)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let sha = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    (!sha.is_empty()).then_some(sha)
}

#[cfg(test)]
mod tests {
    use super::*;
    use esmbt_schema::{parse_project_str, Environment, LogLevel};

    fn project(dir: &Path, command: &str) -> Project {
        let config = parse_project_str(&format!(
            r#"
[build]
command = {command}
crate_name = "esm_arma"
extension_name = "esm"
targets = ["windows", "linux"]

[server]
binary = "server"

[database]
command = ["true"]
"#
        ))
        .unwrap();
        Project::new(dir, config)
    }

    fn run_config(arch: Architecture, os: TargetOs) -> RunConfig {
        RunConfig::new(arch, os, LogLevel::Info, Environment::Development)
    }

    #[test]
    fn artifact_paths_are_arch_and_os_qualified() {
        let dir = tempfile::tempdir().unwrap();
        let project = project(dir.path(), r#"["true"]"#);

        let x64 = artifact_path(&project, &run_config(Architecture::X64, TargetOs::Windows));
        let x86 = artifact_path(&project, &run_config(Architecture::X86, TargetOs::Windows));
        let linux = artifact_path(&project, &run_config(Architecture::X64, TargetOs::Linux));

        assert_eq!(
            x64,
            dir.path().join("target/esmbt/windows/x64/esm_x64.dll")
        );
        assert_eq!(x86, dir.path().join("target/esmbt/windows/x86/esm.dll"));
        assert_eq!(linux, dir.path().join("target/esmbt/linux/x64/esm_x64.so"));
    }

    #[test]
    fn first_error_line_finds_compiler_error() {
        let output = "   Compiling esm v0.1.0\nwarning: unused\nerror: expected `;`\n";
        assert_eq!(first_error_line(output), Some("error: expected `;`"));
        assert_eq!(first_error_line("all good"), None);
    }

    #[test]
    fn rejects_unsupported_target() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = project(dir.path(), r#"["true"]"#);
        project.config.build.targets = vec![TargetOs::Windows];
        let builder = ToolchainBuilder::new(project);

        let err = builder
            .build(&run_config(Architecture::X64, TargetOs::Linux))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::UnsupportedTarget(TargetOs::Linux)));
    }

    #[cfg(unix)]
    #[test]
    fn failing_toolchain_reports_output() {
        let dir = tempfile::tempdir().unwrap();
        let project = project(
            dir.path(),
            r#"["sh", "-c", "echo 'error: boom' >&2; exit 101", "sh"]"#,
        );
        let builder = ToolchainBuilder::new(project);

        let err = builder
            .build(&run_config(Architecture::X64, TargetOs::Windows))
            .unwrap_err();
        match err {
            RuntimeError::BuildFailed { summary, output } => {
                assert_eq!(summary, "error: boom");
                assert!(output.contains("error: boom"));
            }
            other => panic!("expected BuildFailed, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn missing_library_is_a_build_failure() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ToolchainBuilder::new(project(dir.path(), r#"["true"]"#));

        let err = builder
            .build(&run_config(Architecture::X64, TargetOs::Windows))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::BuildFailed { .. }));
        assert!(err.to_string().contains("produced no library"));
    }

    #[cfg(unix)]
    #[test]
    fn successful_build_installs_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        // Writes the library where a cargo cross build would; "$2" is the triple.
        let script = r#"["sh", "-c", "mkdir -p target/$2/release && echo $ESM_LOG_LEVEL-$ESM_ENV > target/$2/release/esm_arma.dll", "sh"]"#;
        let builder = ToolchainBuilder::new(project(dir.path(), script));
        let config = run_config(Architecture::X64, TargetOs::Windows);

        let first = builder.build(&config).unwrap();
        let second = builder.build(&config).unwrap();

        assert_eq!(first.path, second.path);
        assert_eq!(first.digest, second.digest);
        assert_eq!(
            fs::read_to_string(&first.path).unwrap().trim(),
            "info-development"
        );
        let entries = fs::read_dir(first.path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[cfg(unix)]
    #[test]
    fn hung_toolchain_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = project(dir.path(), r#"["sh", "-c", "echo Compiling esm; sleep 30", "sh"]"#);
        project.config.build.timeout_secs = 1;
        let builder = ToolchainBuilder::new(project);

        let started = std::time::Instant::now();
        let err = builder
            .build(&run_config(Architecture::X64, TargetOs::Windows))
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        match err {
            RuntimeError::BuildFailed { summary, output } => {
                assert_eq!(summary, "toolchain timed out after 1s");
                assert!(output.contains("Compiling esm"));
            }
            other => panic!("expected BuildFailed, got {other:?}"),
        }
    }
}
