use crate::backend::DatabaseResetter;
use crate::command::run_bounded;
use crate::{describe_status, transcript, RuntimeError};
use esmbt_schema::{DatabaseTarget, Environment, Project};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info};

/// Resets the server's database by running the configured clean command.
pub struct CommandResetter {
    project: Project,
}

impl CommandResetter {
    pub fn new(project: Project) -> Self {
        Self { project }
    }

    /// Resolve the reset target for `environment` and refuse it when the data
    /// behind it belongs to a different environment.
    pub fn resolve_target(
        &self,
        environment: Environment,
    ) -> Result<&DatabaseTarget, RuntimeError> {
        let target = self.project.config.database_target(environment)?;
        if target.environment != environment {
            return Err(RuntimeError::EnvironmentMismatch {
                requested: environment,
                resolved: target.environment,
                database: target.database.clone(),
            });
        }
        Ok(target)
    }

    fn argv(&self, environment: Environment, target: &DatabaseTarget) -> Vec<String> {
        self.project
            .config
            .database
            .command
            .iter()
            .map(|arg| {
                arg.replace("{env}", environment.as_str())
                    .replace("{database}", &target.database)
            })
            .collect()
    }
}

impl DatabaseResetter for CommandResetter {
    fn reset(&self, environment: Environment) -> Result<(), RuntimeError> {
        let target = self.resolve_target(environment)?;
        let argv = self.argv(environment, target);

        let database = &self.project.config.database;
        let mut cmd = Command::new(self.project.program(&argv[0]));
        cmd.args(&argv[1..])
            .current_dir(self.project.resolve(&database.working_dir))
            .env("ESM_ENV", environment.as_str())
            .env("ESM_DATABASE", &target.database);
        debug!("running database clean: {cmd:?}");

        let limit = Duration::from_secs(database.timeout_secs);
        let finished = run_bounded(&mut cmd, limit).map_err(|e| RuntimeError::ResetFailed {
            summary: format!("failed to run '{}': {e}", argv[0]),
            output: String::new(),
        })?;
        let output = finished.output;
        if finished.timed_out {
            return Err(RuntimeError::ResetFailed {
                summary: format!(
                    "clean command for '{}' timed out after {}s",
                    target.database,
                    limit.as_secs()
                ),
                output: transcript(&output),
            });
        }
        if !output.status.success() {
            return Err(RuntimeError::ResetFailed {
                summary: format!(
                    "clean command for '{}' failed with {}",
                    target.database,
                    describe_status(output.status)
                ),
                output: transcript(&output),
            });
        }
        info!("database '{}' reset for {environment}", target.database);
        Ok(())
    }
}
