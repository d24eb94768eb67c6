//! Tasks and their lifecycle.
//!
//! A [`Task`] is an opaque unit of work. It declares ordered input slots,
//! ordered output slot names and an [`Action`]. The engine never looks inside
//! the action; it only wires values into inputs and reads values out of
//! outputs.
//!
//! ## Lifecycle
//!
//! ```text
//! Pending ──► Ready ──► Running ──► Completed
//!    │          │          └──────► Failed
//!    │          ├─────────────────► Failed   (abort)
//!    ├──────────┴─────────────────► Skipped  (bypass)
//!    └────────────────────────────► Failed   (blocked by a failed producer)
//! ```

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::core::{ArcStr, Outputs, Value};
use crate::error::GraphError;

/// The state of a task within a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Completed,
    Skipped,
    Failed,
}

impl TaskState {
    pub fn can_transition(self, to: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, to),
            (Pending, Ready)
                | (Pending, Skipped)
                | (Pending, Failed)
                | (Ready, Running)
                | (Ready, Skipped)
                | (Ready, Failed)
                | (Running, Completed)
                | (Running, Failed)
        )
    }

    /// Whether dependents may read this task's outputs.
    pub fn is_resolved(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Skipped)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Skipped | TaskState::Failed
        )
    }
}

/// Points at a named output of another task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotRef {
    pub task: String,
    pub output: String,
}

/// A named input attachment point.
///
/// The slot resolves to its producer's output when bound, and falls back to
/// the literal default otherwise.
#[derive(Debug, Clone)]
pub struct InputSlot {
    pub name: String,
    pub default: Option<Value>,
    pub source: Option<SlotRef>,
}

pub struct Task {
    pub(crate) name: ArcStr,
    pub(crate) inputs: Vec<InputSlot>,
    pub(crate) outputs: Vec<String>,
    pub(crate) action: Action,
    pub(crate) state: TaskState,
    pub(crate) resolved: Option<Outputs>,
}

impl Task {
    pub fn new(name: impl AsRef<str>, action: Action) -> Self {
        Self {
            name: name.as_ref().into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            action,
            state: TaskState::Pending,
            resolved: None,
        }
    }

    /// Declares an input slot which must be connected to a producer.
    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(InputSlot {
            name: name.into(),
            default: None,
            source: None,
        });
        self
    }

    /// Declares an input slot carrying a literal value. Connecting a producer
    /// to it later takes precedence over the literal.
    pub fn literal(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.push(InputSlot {
            name: name.into(),
            default: Some(value.into()),
            source: None,
        });
        self
    }

    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn inputs(&self) -> &[InputSlot] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    /// Output values, available once the task is `Completed` or `Skipped`.
    pub fn resolved(&self) -> Option<&Outputs> {
        self.resolved.as_ref()
    }

    pub(crate) fn input_slot_mut(&mut self, name: &str) -> Option<&mut InputSlot> {
        self.inputs.iter_mut().find(|slot| slot.name == name)
    }

    pub(crate) fn has_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|output| output == name)
    }

    /// Whether `outputs` carries exactly the declared output names.
    pub(crate) fn matches_outputs(&self, outputs: &Outputs) -> bool {
        outputs.len() == self.outputs.len() && self.outputs.iter().all(|o| outputs.contains_key(o))
    }

    pub(crate) fn transition(&mut self, to: TaskState) -> Result<(), GraphError> {
        if !self.state.can_transition(to) {
            return Err(GraphError::InvalidStateTransition {
                task: self.name.to_string(),
                from: self.state,
                to,
            });
        }

        tracing::trace!(task = %self.name, from = ?self.state, to = ?to, "transition");
        self.state = to;
        Ok(())
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("action", &self.action)
            .field("state", &self.state)
            .finish()
    }
}
