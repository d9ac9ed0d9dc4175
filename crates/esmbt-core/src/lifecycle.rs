use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One step of the pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Building,
    StoppingServer,
    ResettingDatabase,
    StartingServer,
    Verified,
}

impl Stage {
    /// The stage entered after this one succeeds.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Idle => Some(Stage::Building),
            Stage::Building => Some(Stage::StoppingServer),
            Stage::StoppingServer => Some(Stage::ResettingDatabase),
            Stage::ResettingDatabase => Some(Stage::StartingServer),
            Stage::StartingServer => Some(Stage::Verified),
            Stage::Verified => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Idle => "idle",
            Stage::Building => "building",
            Stage::StoppingServer => "stopping_server",
            Stage::ResettingDatabase => "resetting_database",
            Stage::StartingServer => "starting_server",
            Stage::Verified => "verified",
        };
        f.write_str(s)
    }
}

/// Where a run currently is: inside a stage, or failed at one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum RunPhase {
    At(Stage),
    Failed(Stage),
}

impl RunPhase {
    pub fn stage(self) -> Stage {
        match self {
            RunPhase::At(s) | RunPhase::Failed(s) => s,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::At(Stage::Verified) | RunPhase::Failed(_))
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::At(s) => write!(f, "{s}"),
            RunPhase::Failed(s) => write!(f, "failed({s})"),
        }
    }
}

pub fn validate_transition(from: RunPhase, to: RunPhase) -> Result<(), CoreError> {
    let valid = match (from, to) {
        (RunPhase::At(a), RunPhase::At(b)) => a.next() == Some(b),
        (RunPhase::At(a), RunPhase::Failed(b)) => a == b && a != Stage::Verified,
        (RunPhase::Failed(_), _) => false,
    };

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
