use std::collections::HashSet;

use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};

use crate::core::Outputs;
use crate::error::GraphError;
use crate::graph::Pipeline;
use crate::task::TaskState;

/// Substitutes the outputs of a task instead of running it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BypassDirective {
    pub task: String,
    pub outputs: Outputs,
}

impl BypassDirective {
    pub fn new(task: impl Into<String>, outputs: Outputs) -> Self {
        Self {
            task: task.into(),
            outputs,
        }
    }
}

impl Pipeline {
    /// Marks `task` as `Skipped` with the supplied output values.
    ///
    /// Edges stay untouched; dependents read the supplied values exactly as if
    /// the task had run. The supplied names must match the declared outputs
    /// one to one, and the task must not have started yet.
    pub fn bypass(&mut self, task: &str, outputs: Outputs) -> Result<(), GraphError> {
        let state = self.graph[self.lookup(task)?].state();
        let index = self.check_bypass(task, &outputs, state)?;
        self.commit_bypass(index, outputs);
        Ok(())
    }

    pub fn apply(&mut self, directive: &BypassDirective) -> Result<(), GraphError> {
        self.bypass(&directive.task, directive.outputs.clone())
    }

    /// Applies every directive, or none of them.
    ///
    /// All directives are checked against the pipeline before the first one
    /// takes effect, so a rejected set leaves every task as it was.
    pub fn apply_all(&mut self, directives: &[BypassDirective]) -> Result<(), GraphError> {
        let mut bypassed = HashSet::new();
        let mut checked = Vec::with_capacity(directives.len());

        for directive in directives {
            let index = self.lookup(&directive.task)?;
            // A second directive for the same task sees it already skipped.
            let state = if bypassed.insert(index) {
                self.graph[index].state()
            } else {
                TaskState::Skipped
            };
            checked.push(self.check_bypass(&directive.task, &directive.outputs, state)?);
        }

        for (index, directive) in checked.into_iter().zip(directives) {
            self.commit_bypass(index, directive.outputs.clone());
        }

        Ok(())
    }

    /// Checks that `task`, currently in `state`, may take `outputs`.
    fn check_bypass(
        &self,
        task: &str,
        outputs: &Outputs,
        state: TaskState,
    ) -> Result<NodeIndex, GraphError> {
        let index = self.lookup(task)?;
        let node = &self.graph[index];

        if !node.matches_outputs(outputs) {
            return Err(GraphError::OutputMismatch {
                task: task.to_string(),
                expected: node.outputs().to_vec(),
                found: outputs.keys().cloned().collect(),
            });
        }

        if !state.can_transition(TaskState::Skipped) {
            return Err(GraphError::InvalidStateTransition {
                task: task.to_string(),
                from: state,
                to: TaskState::Skipped,
            });
        }

        Ok(index)
    }

    fn commit_bypass(&mut self, index: NodeIndex, outputs: Outputs) {
        let node = &mut self.graph[index];
        node.state = TaskState::Skipped;
        node.resolved = Some(outputs);

        tracing::info!(task = node.name(), "bypassed");
    }
}
