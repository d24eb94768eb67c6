use serde::Serialize;
use thiserror::Error;

use crate::task::TaskState;

/// Errors raised while building, validating or configuring a pipeline.
///
/// All of these are detected before any action runs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Task '{0}' already exists")]
    DuplicateTask(String),

    #[error("Task '{0}' not found")]
    UnknownTask(String),

    #[error("Task '{task}' has no slot named '{slot}'")]
    UnknownSlot { task: String, slot: String },

    #[error("Input '{slot}' of task '{task}' is already bound to a producer")]
    SlotAlreadyBound { task: String, slot: String },

    #[error("Cycle detected between tasks: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    #[error("Input '{slot}' of task '{task}' has neither a producer nor a default value")]
    UnresolvedInput { task: String, slot: String },

    #[error("Outputs supplied for task '{task}' ({}) do not match its declared outputs ({})", .found.join(", "), .expected.join(", "))]
    OutputMismatch {
        task: String,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("Task '{task}' cannot move from {from:?} to {to:?}")]
    InvalidStateTransition {
        task: String,
        from: TaskState,
        to: TaskState,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown concurrency strategy '{0}', expected 'serial', 'parallel' or 'parallel:N'")]
    InvalidStrategy(String),

    #[error("Worker pool size must be at least 1")]
    ZeroWorkers,

    #[error("Couldn't read configuration file.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't parse configuration file.\n{0}")]
    Toml(#[from] toml::de::Error),
}

/// Failure of a single action invocation.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
#[error("action failed ({}):\n{stderr}", describe_exit(.exit_code))]
pub struct ActionError {
    /// Exit status of the external process, absent when it never ran to
    /// completion (spawn failure, signal, callable action error).
    pub exit_code: Option<i32>,
    /// Tail of the standard error stream, or the error message.
    pub stderr: String,
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code".to_string(),
    }
}

impl ActionError {
    pub fn new(exit_code: Option<i32>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stderr: stderr.into(),
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self::new(None, message)
    }
}

impl From<anyhow::Error> for ActionError {
    fn from(err: anyhow::Error) -> Self {
        ActionError::message(format!("{err:#}"))
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't decode cache entry.\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("Couldn't encode cache entry.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Task name '{0}' can't be used as a workspace directory name")]
    InvalidName(String),

    #[error("Couldn't create workspace directory.\n{0}")]
    Io(#[from] std::io::Error),
}

/// Errors that abort a run before any task is scheduled.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Couldn't open cache store.\n{0}")]
    Cache(#[from] CacheError),

    #[error("Failed to build worker pool.\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("Invalid progress bar template.\n{0}")]
    Style(#[from] indicatif::style::TemplateError),
}
