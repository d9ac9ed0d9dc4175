use crate::types::{Environment, RunConfig, TargetOs};
use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_PROJECT_FILE: &str = "esmbt.toml";

/// Contents of `esmbt.toml`: how to reach the three external collaborators.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    pub build: BuildSection,
    pub server: ServerSection,
    pub database: DatabaseSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BuildSection {
    /// Toolchain invocation; `--target <triple>` is appended.
    #[serde(default = "default_build_command")]
    pub command: Vec<String>,
    #[serde(default = "default_dir")]
    pub working_dir: String,
    /// Toolchain output directory, relative to `working_dir`.
    #[serde(default = "default_target_dir")]
    pub target_dir: String,
    /// Library crate the toolchain produces.
    pub crate_name: String,
    /// Stem of the deployed file (`esm` -> `esm.dll` / `esm_x64.dll`).
    pub extension_name: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    /// Toolchain profile directory holding the compiled library.
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_targets")]
    pub targets: Vec<TargetOs>,
    /// Upper bound on one toolchain invocation.
    #[serde(default = "default_build_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_dir")]
    pub working_dir: String,
    /// Executable name used to find an instance left over from an earlier run.
    #[serde(default)]
    pub process_name: Option<String>,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub readiness: Readiness,
}

/// What counts as "the server is up".
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Readiness {
    /// A line containing `pattern` is appended to the log at `path`.
    Log { path: String, pattern: String },
    /// A TCP connection to `address` is accepted.
    Tcp { address: String },
    /// The process is still alive after `settle_ms`.
    Process {
        #[serde(default = "default_settle")]
        settle_ms: u64,
    },
}

impl Default for Readiness {
    fn default() -> Self {
        Readiness::Process {
            settle_ms: default_settle(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSection {
    /// Clean command; `{env}` and `{database}` are substituted.
    pub command: Vec<String>,
    #[serde(default = "default_dir")]
    pub working_dir: String,
    #[serde(default = "default_reset_timeout")]
    pub timeout_secs: u64,
    /// Reset targets keyed by the environment profile that selects them.
    #[serde(default)]
    pub targets: BTreeMap<String, DatabaseTarget>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DatabaseTarget {
    pub database: String,
    /// Environment the data in `database` belongs to.
    pub environment: Environment,
}

fn default_build_command() -> Vec<String> {
    vec!["cargo".to_owned(), "build".to_owned(), "--release".to_owned()]
}

fn default_dir() -> String {
    ".".to_owned()
}

fn default_target_dir() -> String {
    "target".to_owned()
}

fn default_output_dir() -> String {
    "target/esmbt".to_owned()
}

fn default_profile() -> String {
    "release".to_owned()
}

fn default_targets() -> Vec<TargetOs> {
    vec![TargetOs::Windows]
}

fn default_build_timeout() -> u64 {
    1800
}

fn default_reset_timeout() -> u64 {
    300
}

fn default_startup_timeout() -> u64 {
    120
}

fn default_stop_grace() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    250
}

fn default_settle() -> u64 {
    2000
}

impl ProjectConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.build.command.is_empty() {
            return Err(ConfigError::EmptyCommand("build.command"));
        }
        if self.build.crate_name.trim().is_empty() {
            return Err(ConfigError::EmptyField("build.crate_name"));
        }
        if self.build.extension_name.trim().is_empty() {
            return Err(ConfigError::EmptyField("build.extension_name"));
        }
        if self.build.targets.is_empty() {
            return Err(ConfigError::EmptyField("build.targets"));
        }
        if self.build.timeout_secs == 0 {
            return Err(ConfigError::ZeroDuration("build.timeout_secs"));
        }
        if self.server.binary.trim().is_empty() {
            return Err(ConfigError::EmptyField("server.binary"));
        }
        if self.server.startup_timeout_secs == 0 {
            return Err(ConfigError::ZeroDuration("server.startup_timeout_secs"));
        }
        if self.server.stop_grace_secs == 0 {
            return Err(ConfigError::ZeroDuration("server.stop_grace_secs"));
        }
        if self.server.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroDuration("server.poll_interval_ms"));
        }
        match &self.server.readiness {
            Readiness::Log { path, pattern } => {
                if path.trim().is_empty() {
                    return Err(ConfigError::EmptyField("server.readiness.path"));
                }
                if pattern.is_empty() {
                    return Err(ConfigError::EmptyField("server.readiness.pattern"));
                }
            }
            Readiness::Tcp { address } => {
                if address.trim().is_empty() {
                    return Err(ConfigError::EmptyField("server.readiness.address"));
                }
            }
            Readiness::Process { .. } => {}
        }
        if self.database.command.is_empty() {
            return Err(ConfigError::EmptyCommand("database.command"));
        }
        if self.database.timeout_secs == 0 {
            return Err(ConfigError::ZeroDuration("database.timeout_secs"));
        }
        for key in self.database.targets.keys() {
            key.parse::<Environment>()?;
        }
        Ok(())
    }

    /// The reset target the given environment profile selects.
    pub fn database_target(&self, env: Environment) -> Result<&DatabaseTarget, ConfigError> {
        self.database
            .targets
            .get(env.as_str())
            .ok_or(ConfigError::NoDatabaseTarget(env))
    }

    /// Checks that must hold for `run` before any stage executes.
    pub fn check_run(&self, run: &RunConfig) -> Result<(), ConfigError> {
        if !self.build.targets.contains(&run.target_os) {
            return Err(ConfigError::UnsupportedTarget(run.target_os));
        }
        self.database_target(run.environment)?;
        Ok(())
    }
}

/// A parsed project file together with the directory its paths are relative to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub root: PathBuf,
    pub config: ProjectConfig,
}

impl Project {
    pub fn new(root: impl Into<PathBuf>, config: ProjectConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    /// Resolve a path from the project file against the project root.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }

    /// Resolve a program named in the project file. Bare names are left for a
    /// PATH lookup; anything with a path separator is resolved like a path.
    pub fn program(&self, program: &str) -> PathBuf {
        if program.contains('/') || program.contains('\\') {
            self.resolve(program)
        } else {
            PathBuf::from(program)
        }
    }
}

pub fn parse_project_str(input: &str) -> Result<ProjectConfig, ConfigError> {
    let config: ProjectConfig = toml::from_str(input)?;
    config.validate()?;
    Ok(config)
}

pub fn load_project(path: impl AsRef<Path>) -> Result<Project, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        source: e,
    })?;
    let config = parse_project_str(&content)?;
    let root = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok(Project::new(root, config))
}
