//! Task graph construction and validation.
//!
//! A [`Graph`] is assembled from [`Task`]s and slot-to-slot connections. Each
//! connection becomes an edge from the producing task to the consuming task,
//! labelled with the two slot names. [`Graph::validate`] freezes the topology
//! into a [`Pipeline`], which carries the topological order used by the
//! executor. Only task state and resolved values change after that point.

use std::collections::HashMap;
use std::fmt::Display;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::core::{ArcStr, Outputs, Value};
use crate::error::GraphError;
use crate::task::{SlotRef, Task, TaskState};

/// Edge weight, naming the producer's output and the consumer's input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotEdge {
    pub output: String,
    pub input: String,
}

/// Mutable task graph under construction.
///
/// # Example
///
/// ```rust
/// use nagare::{Action, Graph, Outputs, Task, Value};
///
/// let mut graph = Graph::new();
/// graph.add_task(Task::new("a", Action::function("a", |_| {
///     Ok(Outputs::from([("x".to_string(), Value::text("1"))]))
/// })).output("x"))?;
/// graph.add_task(Task::new("b", Action::function("b", |_| Ok(Outputs::new()))).input("x"))?;
/// graph.connect("a", "x", "b", "x")?;
///
/// let pipeline = graph.validate()?;
/// assert_eq!(pipeline.order().collect::<Vec<_>>(), ["a", "b"]);
/// # Ok::<(), nagare::GraphError>(())
/// ```
#[derive(Debug, Default)]
pub struct Graph {
    graph: DiGraph<Task, SlotEdge>,
    index: HashMap<ArcStr, NodeIndex>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&mut self, task: Task) -> Result<(), GraphError> {
        if self.index.contains_key(task.name()) {
            return Err(GraphError::DuplicateTask(task.name().to_string()));
        }

        let name = task.name.clone();
        let index = self.graph.add_node(task);
        self.index.insert(name, index);

        Ok(())
    }

    /// Binds `consumer.input` to `producer.output`.
    pub fn connect(
        &mut self,
        producer: &str,
        output: &str,
        consumer: &str,
        input: &str,
    ) -> Result<(), GraphError> {
        let source = self.lookup(producer)?;
        let target = self.lookup(consumer)?;

        if !self.graph[source].has_output(output) {
            return Err(GraphError::UnknownSlot {
                task: producer.to_string(),
                slot: output.to_string(),
            });
        }

        let slot = self.graph[target]
            .input_slot_mut(input)
            .ok_or_else(|| GraphError::UnknownSlot {
                task: consumer.to_string(),
                slot: input.to_string(),
            })?;

        if slot.source.is_some() {
            return Err(GraphError::SlotAlreadyBound {
                task: consumer.to_string(),
                slot: input.to_string(),
            });
        }

        slot.source = Some(SlotRef {
            task: producer.to_string(),
            output: output.to_string(),
        });

        self.graph.add_edge(
            source,
            target,
            SlotEdge {
                output: output.to_string(),
                input: input.to_string(),
            },
        );

        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<NodeIndex, GraphError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownTask(name.to_string()))
    }

    /// Checks the graph is a DAG whose every input resolves, and freezes it.
    pub fn validate(self) -> Result<Pipeline, GraphError> {
        let order = match petgraph::algo::toposort(&self.graph, None) {
            Ok(order) => order,
            Err(_) => return Err(GraphError::CycleDetected(self.find_cycle())),
        };

        for &index in &order {
            let task = &self.graph[index];
            for slot in task.inputs() {
                if slot.source.is_none() && slot.default.is_none() {
                    return Err(GraphError::UnresolvedInput {
                        task: task.name().to_string(),
                        slot: slot.name.clone(),
                    });
                }
            }
        }

        Ok(Pipeline {
            graph: self.graph,
            index: self.index,
            order,
        })
    }

    /// Names the members of one cycle, sorted.
    fn find_cycle(&self) -> Vec<String> {
        let component = petgraph::algo::tarjan_scc(&self.graph)
            .into_iter()
            .find(|scc| {
                scc.len() > 1 || self.graph.find_edge(scc[0], scc[0]).is_some()
            })
            .unwrap_or_default();

        let mut names: Vec<_> = component
            .into_iter()
            .map(|index| self.graph[index].name().to_string())
            .collect();

        names.sort();
        names
    }
}

/// A validated task graph, ready to be bypassed and executed.
#[derive(Debug)]
pub struct Pipeline {
    pub(crate) graph: DiGraph<Task, SlotEdge>,
    pub(crate) index: HashMap<ArcStr, NodeIndex>,
    pub(crate) order: Vec<NodeIndex>,
}

impl Pipeline {
    pub fn task(&self, name: &str) -> Option<&Task> {
        self.index.get(name).map(|&index| &self.graph[index])
    }

    pub fn state(&self, name: &str) -> Option<TaskState> {
        self.task(name).map(Task::state)
    }

    pub fn outputs(&self, name: &str) -> Option<&Outputs> {
        self.task(name).and_then(Task::resolved)
    }

    /// Task names in the topological order computed at validation.
    pub fn order(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|&index| self.graph[index].name())
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Returns every task to `Pending` and forgets resolved outputs, so the
    /// pipeline can be run again. Bypasses have to be applied anew.
    pub fn reset(&mut self) {
        for task in self.graph.node_weights_mut() {
            task.state = TaskState::Pending;
            task.resolved = None;
        }
    }

    pub(crate) fn lookup(&self, name: &str) -> Result<NodeIndex, GraphError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownTask(name.to_string()))
    }

    /// Distinct tasks consuming any output of `index`.
    pub(crate) fn dependents(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut dependents: Vec<_> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect();
        dependents.sort();
        dependents.dedup();
        dependents
    }

    /// Distinct tasks producing any input of `index`.
    pub(crate) fn producers(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut producers: Vec<_> = self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .collect();
        producers.sort();
        producers.dedup();
        producers
    }

    /// Resolves the inputs of `index` in declaration order.
    ///
    /// Bound slots read their producer's outputs, which must be resolved.
    pub(crate) fn resolve_inputs(&self, index: NodeIndex) -> Option<Vec<(String, Value)>> {
        let task = &self.graph[index];

        let sources: HashMap<&str, NodeIndex> = self
            .graph
            .edges_directed(index, Direction::Incoming)
            .map(|edge| (edge.weight().input.as_str(), edge.source()))
            .collect();

        task.inputs()
            .iter()
            .map(|slot| {
                let value = match (&slot.source, sources.get(slot.name.as_str())) {
                    (Some(source), Some(&producer)) => self.graph[producer]
                        .resolved()?
                        .get(&source.output)?
                        .clone(),
                    _ => slot.default.clone()?,
                };

                Some((slot.name.clone(), value))
            })
            .collect()
    }
}

impl Display for Pipeline {
    /// Renders the pipeline as a Mermaid flowchart.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for &index in &self.order {
            let name = self.graph[index].name().replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.edge_references() {
            let SlotEdge { output, input } = edge.weight();
            writeln!(
                f,
                "    {} -- \"{} → {}\" --> {}",
                edge.source().index(),
                output,
                input,
                edge.target().index()
            )?;
        }

        Ok(())
    }
}
