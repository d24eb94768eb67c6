use std::fmt::{Display, Write};
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::error::ActionError;
use crate::graph::Pipeline;
use crate::task::TaskState;

/// Why a task ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// The action itself failed.
    ActionExecution(ActionError),
    /// A transitive producer failed, so the task was never admitted.
    BlockedByDependencyFailure { dependency: String },
    /// The run stopped admitting tasks after an earlier failure.
    Aborted,
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::ActionExecution(err) => write!(f, "{err}"),
            FailureKind::BlockedByDependencyFailure { dependency } => {
                write!(f, "blocked by failure of '{dependency}'")
            }
            FailureKind::Aborted => f.write_str("aborted after an earlier failure"),
        }
    }
}

/// Outcome of a single task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub name: String,
    pub state: TaskState,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    pub error: Option<FailureKind>,
    /// Outputs came from the cache rather than a fresh execution.
    pub cached: bool,
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Per-task outcome of a run, in the order tasks reached a terminal state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReport {
    pub records: Vec<TaskRecord>,
    #[serde(rename = "wall_time_ms", serialize_with = "as_millis")]
    pub wall_time: Duration,
}

impl ExecutionReport {
    pub fn record(&self, name: &str) -> Option<&TaskRecord> {
        self.records.iter().find(|record| record.name == name)
    }

    /// Every task ended `Completed` or `Skipped`.
    pub fn is_success(&self) -> bool {
        self.records.iter().all(|record| record.state.is_resolved())
    }

    /// The earliest failure caused by an action itself, falling back to any
    /// failed record.
    pub fn first_failure(&self) -> Option<&TaskRecord> {
        self.failed()
            .find(|record| matches!(record.error, Some(FailureKind::ActionExecution(_))))
            .or_else(|| self.failed().next())
    }

    pub fn failed(&self) -> impl Iterator<Item = &TaskRecord> {
        self.records
            .iter()
            .filter(|record| record.state == TaskState::Failed)
    }

    /// Zero for a successful run, one otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.is_success() { 0 } else { 1 }
    }

    /// Renders the executed pipeline as a Mermaid diagram, color-coded by
    /// outcome and, for executed tasks, by duration.
    ///
    /// * **Green → Red**: executed, fast to slow
    /// * **Blue**: reused from the cache
    /// * **Grey**: bypassed
    /// * **Dark red**: failed
    pub fn render_mermaid(&self, pipeline: &Pipeline) -> String {
        let mut f = String::new();
        let _ = self.write_mermaid(&mut f, pipeline);
        f
    }

    fn write_mermaid(&self, f: &mut String, pipeline: &Pipeline) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        let executed = self
            .records
            .iter()
            .filter(|r| r.state == TaskState::Completed && !r.cached)
            .map(|r| r.duration.as_secs_f64());

        let (min, max) = executed.fold((f64::MAX, f64::MIN), |(lo, hi), secs| {
            (lo.min(secs), hi.max(secs))
        });
        let (min, max) = if min > max { (0.0, 1.0) } else { (min, max) };
        let span = if (max - min).abs() < f64::EPSILON { 1.0 } else { max - min };

        for &index in &pipeline.order {
            let name = pipeline.graph[index].name();
            let escaped = name.replace('"', "\\\"");

            let (label, color) = match self.record(name) {
                Some(record) => match (record.state, record.cached) {
                    (TaskState::Completed, true) => ("cached".to_string(), "#ADD8E6".to_string()),
                    (TaskState::Completed, false) => {
                        let t = (record.duration.as_secs_f64() - min) / span;
                        (format!("{:.2?}", record.duration), gradient(t))
                    }
                    (TaskState::Skipped, _) => ("bypassed".to_string(), "#D3D3D3".to_string()),
                    (TaskState::Failed, _) => ("failed".to_string(), "#8B0000".to_string()),
                    (state, _) => (format!("{state:?}"), "#FFFFFF".to_string()),
                },
                None => ("not run".to_string(), "#FFFFFF".to_string()),
            };

            writeln!(f, "    {}[\"{}\\n{}\"]", index.index(), escaped, label)?;
            writeln!(f, "    style {} fill:{}", index.index(), color)?;
        }

        for edge in pipeline.graph.raw_edges() {
            writeln!(
                f,
                "    {} -- \"{} → {}\" --> {}",
                edge.source().index(),
                edge.weight.output,
                edge.weight.input,
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

/// Green at 0.0, through yellow, to red at 1.0.
fn gradient(t: f64) -> String {
    let t = t.clamp(0.0, 1.0);
    let (r, g) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
    };

    format!("#{r:02X}{g:02X}00")
}

impl Display for ExecutionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for record in &self.records {
            let state = format!("{:?}", record.state);
            write!(f, "{:<24} {:<10}", record.name, state)?;

            match (&record.error, record.cached) {
                (Some(reason), _) => writeln!(f, " {reason}")?,
                (None, true) => writeln!(f, " (cached)")?,
                (None, false) if record.state == TaskState::Completed => {
                    writeln!(f, " {:.2?}", record.duration)?
                }
                (None, false) => writeln!(f)?,
            }
        }

        write!(f, "finished in {:.2?}", self.wall_time)
    }
}
