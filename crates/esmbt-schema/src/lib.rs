//! Run configuration and project file schema for esmbt.
//!
//! This crate defines the vocabulary shared by every other crate: the option
//! enums (`Architecture`, `TargetOs`, `LogLevel`, `Environment`), the immutable
//! per-invocation `RunConfig`, and the `esmbt.toml` project file describing how
//! to reach the toolchain, the game server and the database clean command.

pub mod project;
pub mod types;

pub use project::{
    load_project, parse_project_str, BuildSection, DatabaseSection, DatabaseTarget, Project,
    ProjectConfig, Readiness, ServerSection, DEFAULT_PROJECT_FILE,
};
pub use types::{Architecture, Environment, LogLevel, RunConfig, TargetOs};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {field} (expected one of: {expected})")]
    UnknownValue {
        field: &'static str,
        value: String,
        expected: String,
    },
    #[error("failed to read project file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse project file: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("{0} must not be empty")]
    EmptyCommand(&'static str),
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("unsupported target '{0}': not listed in build.targets")]
    UnsupportedTarget(TargetOs),
    #[error("no database target configured for environment '{0}'")]
    NoDatabaseTarget(Environment),
}
