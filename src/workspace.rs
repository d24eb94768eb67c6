use std::fs;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

use crate::error::WorkspaceError;

/// Hands out a writable directory per task.
///
/// Implementations must never give two distinct tasks overlapping paths
/// within one run.
pub trait WorkspaceProvider: Send + Sync {
    fn workspace(&self, task: &str) -> Result<Utf8PathBuf, WorkspaceError>;
}

/// Partitions a root directory into one subdirectory per task name.
#[derive(Debug, Clone)]
pub struct RunDirectory {
    root: Utf8PathBuf,
}

impl RunDirectory {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }
}

impl WorkspaceProvider for RunDirectory {
    fn workspace(&self, task: &str) -> Result<Utf8PathBuf, WorkspaceError> {
        // A single normal component can neither escape the root nor nest
        // inside another task's directory.
        let mut components = Utf8Path::new(task).components();
        let valid = matches!(
            (components.next(), components.next()),
            (Some(Utf8Component::Normal(name)), None) if name == task
        );

        if !valid {
            return Err(WorkspaceError::InvalidName(task.to_string()));
        }

        let path = self.root.join(task);
        fs::create_dir_all(&path)?;
        tracing::debug!(task, %path, "workspace ready");

        Ok(path)
    }
}
