//! Pipeline execution.
//!
//! The [`Executor`] drives a validated [`Pipeline`] to completion. Whatever
//! the strategy, bookkeeping happens on the calling thread: tasks are admitted
//! only once every producer is resolved, a failure blocks everything reachable
//! from the failed task, and each task ends in exactly one terminal state.

mod parallel;
mod report;

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use petgraph::graph::NodeIndex;
use tracing::{Level, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::action::{Action, ActionRunner, Invocation};
use crate::cache::{Cache, CacheStore, DiskStore, Fingerprint, MemoryStore, Provenance};
use crate::config::{RunConfig, Strategy};
use crate::core::{ArcStr, Outputs, Value};
use crate::error::{ActionError, EngineError, GraphError};
use crate::graph::Pipeline;
use crate::task::TaskState;
use crate::utils;
use crate::workspace::WorkspaceProvider;

pub use report::{ExecutionReport, FailureKind, TaskRecord};

/// Runs pipelines with a fixed configuration, runner and workspace provider.
pub struct Executor {
    config: RunConfig,
    runner: Arc<dyn ActionRunner>,
    workspace: Arc<dyn WorkspaceProvider>,
    cache: Option<Cache>,
}

impl Executor {
    /// Opens the cache store named by `config`, if caching is enabled.
    pub fn new(
        config: RunConfig,
        runner: Arc<dyn ActionRunner>,
        workspace: Arc<dyn WorkspaceProvider>,
    ) -> Result<Self, EngineError> {
        let cache = if config.cache {
            let store: Arc<dyn CacheStore> = match &config.cache_dir {
                Some(dir) => Arc::new(DiskStore::new(dir.clone())?),
                None => Arc::new(MemoryStore::new()),
            };
            Some(Cache::new(store))
        } else {
            None
        };

        Ok(Self {
            config,
            runner,
            workspace,
            cache,
        })
    }

    /// Uses `store` instead, so several executors can share entries. Has no
    /// effect when caching is disabled.
    pub fn with_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        if self.config.cache {
            self.cache = Some(Cache::new(store));
        }
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<&Cache> {
        self.cache.as_ref()
    }

    /// Applies the configured bypasses and executes every remaining task.
    ///
    /// Task failures don't make this return an error, they're recorded in the
    /// report. An error means the run couldn't start: a bypass directive was
    /// rejected, the pipeline already ran (see [`Pipeline::reset`]), or the
    /// worker pool couldn't be built.
    pub fn run(&self, pipeline: &mut Pipeline) -> Result<ExecutionReport, EngineError> {
        let start = Instant::now();

        if let Some(task) = pipeline
            .graph
            .node_weights()
            .find(|task| !matches!(task.state(), TaskState::Pending | TaskState::Skipped))
        {
            return Err(GraphError::InvalidStateTransition {
                task: task.name().to_string(),
                from: task.state(),
                to: TaskState::Ready,
            }
            .into());
        }

        pipeline.apply_all(&self.config.bypass)?;

        let progress = tracing::span!(Level::INFO, "running_tasks");
        progress.pb_set_length(pipeline.len() as u64);
        progress.pb_set_style(&utils::style_root()?);
        progress.pb_set_message("Running tasks...");
        let _enter = progress.enter();

        let mut run = Run::new(pipeline, progress.clone(), self.config.abort_on_failure);
        run.record_bypassed();

        match self.config.strategy {
            Strategy::Serial => self.run_serial(&mut run)?,
            Strategy::Parallel(workers) => self.run_parallel(&mut run, workers.get())?,
        }

        let report = ExecutionReport {
            records: run.records,
            wall_time: start.elapsed(),
        };

        match report.failed().count() {
            0 => tracing::info!("Run complete in {:.2?}", report.wall_time),
            n => tracing::error!("Run finished with {n} failed task(s) in {:.2?}", report.wall_time),
        }

        Ok(report)
    }

    fn run_serial(&self, run: &mut Run) -> Result<(), EngineError> {
        let style = utils::style_task()?;

        for index in run.pipeline.order.clone() {
            if run.state(index) != TaskState::Pending {
                continue;
            }

            let Some(job) = run.admit(index)? else {
                continue;
            };

            run.start(index)?;

            let span = tracing::span!(parent: &run.progress, Level::INFO, "task", name = &*job.name);
            span.pb_set_style(&style);
            span.pb_set_message(&format!("Running {}", job.name));

            let started = Instant::now();
            let result = span.in_scope(|| self.attempt(&job));
            run.finish(index, result, started.elapsed())?;
        }

        Ok(())
    }

    /// Executes `job`, turning a panic anywhere below into an action failure.
    pub(crate) fn attempt(&self, job: &Job) -> Result<(Outputs, Provenance), ActionError> {
        catch_unwind(AssertUnwindSafe(|| self.execute(job)))
            .unwrap_or_else(|panic| Err(ActionError::message(utils::panic_message(panic))))
    }

    /// Runs `job`, through the cache when enabled.
    fn execute(&self, job: &Job) -> Result<(Outputs, Provenance), ActionError> {
        let Some(cache) = &self.cache else {
            return self.invoke(job).map(|outputs| (outputs, Provenance::Executed));
        };

        let mut fingerprint = Fingerprint::of(&job.action, &job.inputs);

        // Commands see their workspace path, so their outputs live there.
        if let Action::Command(_) = &job.action {
            fingerprint = fingerprint.within(&self.workspace_for(job)?);
        }

        let (entry, provenance) = cache.get_or_run(fingerprint, &job.outputs, || self.invoke(job))?;

        // A concurrent flight for the same fingerprint may have been started
        // by a task declaring different outputs.
        if !entry.is_compatible(&job.outputs) {
            return self.invoke(job).map(|outputs| (outputs, Provenance::Executed));
        }

        if provenance == Provenance::Reused {
            tracing::debug!(task = %job.name, %fingerprint, "reusing cached outputs");
        }

        Ok((entry.outputs, provenance))
    }

    fn workspace_for(&self, job: &Job) -> Result<Utf8PathBuf, ActionError> {
        self.workspace
            .workspace(&job.name)
            .map_err(|err| ActionError::message(err.to_string()))
    }

    fn invoke(&self, job: &Job) -> Result<Outputs, ActionError> {
        let workspace = self.workspace_for(job)?;

        let invocation = Invocation {
            task: &job.name,
            inputs: &job.inputs,
            outputs: &job.outputs,
            workspace: &workspace,
        };

        let outputs = self.runner.run(&job.action, &invocation)?;

        let complete = outputs.len() == job.outputs.len()
            && job.outputs.iter().all(|name| outputs.contains_key(name));

        if !complete {
            return Err(ActionError::message(format!(
                "action produced outputs {:?}, expected {:?}",
                outputs.keys().collect::<Vec<_>>(),
                job.outputs
            )));
        }

        Ok(outputs)
    }
}

/// An admitted task, detached from the pipeline so it can cross threads.
pub(crate) struct Job {
    pub index: NodeIndex,
    pub name: ArcStr,
    pub action: Action,
    pub inputs: Vec<(String, Value)>,
    pub outputs: Vec<String>,
}

/// Bookkeeping of a single run.
pub(crate) struct Run<'p> {
    pipeline: &'p mut Pipeline,
    progress: Span,
    records: Vec<TaskRecord>,
    /// Root cause of every failed task.
    blame: HashMap<NodeIndex, ArcStr>,
    abort_on_failure: bool,
}

impl<'p> Run<'p> {
    fn new(pipeline: &'p mut Pipeline, progress: Span, abort_on_failure: bool) -> Self {
        Self {
            pipeline,
            progress,
            records: Vec::new(),
            blame: HashMap::new(),
            abort_on_failure,
        }
    }

    fn state(&self, index: NodeIndex) -> TaskState {
        self.pipeline.graph[index].state()
    }

    fn push(&mut self, record: TaskRecord) {
        self.records.push(record);
        self.progress.pb_inc(1);
    }

    fn record_bypassed(&mut self) {
        for index in self.pipeline.order.clone() {
            let task = &self.pipeline.graph[index];
            if task.state() == TaskState::Skipped {
                let record = TaskRecord {
                    name: task.name().to_string(),
                    state: TaskState::Skipped,
                    duration: Duration::ZERO,
                    error: None,
                    cached: false,
                };
                self.push(record);
            }
        }
    }

    /// Moves a pending task whose producers are all resolved to `Ready`.
    ///
    /// Returns `None` when the task was failed instead.
    fn admit(&mut self, index: NodeIndex) -> Result<Option<Job>, GraphError> {
        if self.abort_on_failure && !self.blame.is_empty() {
            self.fail(index, FailureKind::Aborted, Duration::ZERO)?;
            return Ok(None);
        }

        let Some(inputs) = self.pipeline.resolve_inputs(index) else {
            let err = ActionError::message("inputs could not be resolved");
            self.fail(index, FailureKind::ActionExecution(err), Duration::ZERO)?;
            return Ok(None);
        };

        let task = &mut self.pipeline.graph[index];
        task.transition(TaskState::Ready)?;

        Ok(Some(Job {
            index,
            name: task.name.clone(),
            action: task.action.clone(),
            inputs,
            outputs: task.outputs.clone(),
        }))
    }

    fn start(&mut self, index: NodeIndex) -> Result<(), GraphError> {
        self.pipeline.graph[index].transition(TaskState::Running)
    }

    fn finish(
        &mut self,
        index: NodeIndex,
        result: Result<(Outputs, Provenance), ActionError>,
        duration: Duration,
    ) -> Result<(), GraphError> {
        let (outputs, provenance) = match result {
            Ok(ok) => ok,
            Err(err) => return self.fail(index, FailureKind::ActionExecution(err), duration),
        };

        let task = &mut self.pipeline.graph[index];
        task.transition(TaskState::Completed)?;
        task.resolved = Some(outputs);

        let cached = provenance == Provenance::Reused;
        tracing::info!(task = %task.name, cached, "completed in {duration:.2?}");

        let record = TaskRecord {
            name: task.name().to_string(),
            state: TaskState::Completed,
            duration,
            error: None,
            cached,
        };
        self.push(record);

        Ok(())
    }

    /// Fails `index`, then blocks every pending task reachable from it.
    fn fail(
        &mut self,
        index: NodeIndex,
        reason: FailureKind,
        duration: Duration,
    ) -> Result<(), GraphError> {
        let task = &mut self.pipeline.graph[index];
        task.transition(TaskState::Failed)?;

        let root = match &reason {
            FailureKind::BlockedByDependencyFailure { dependency } => ArcStr::from(dependency.as_str()),
            _ => task.name.clone(),
        };

        tracing::error!(task = %task.name, "failed: {reason}");

        let record = TaskRecord {
            name: task.name().to_string(),
            state: TaskState::Failed,
            duration,
            error: Some(reason),
            cached: false,
        };
        self.blame.insert(index, root.clone());
        self.push(record);

        let mut stack = self.pipeline.dependents(index);
        while let Some(next) = stack.pop() {
            let task = &mut self.pipeline.graph[next];

            // Bypassed dependents keep their supplied values and shield what
            // lies behind them.
            if task.state() != TaskState::Pending {
                continue;
            }

            task.transition(TaskState::Failed)?;
            tracing::warn!(task = %task.name, "blocked by failure of '{root}'");

            let record = TaskRecord {
                name: task.name().to_string(),
                state: TaskState::Failed,
                duration: Duration::ZERO,
                error: Some(FailureKind::BlockedByDependencyFailure {
                    dependency: root.to_string(),
                }),
                cached: false,
            };
            self.blame.insert(next, root.clone());
            self.push(record);

            stack.extend(self.pipeline.dependents(next));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::sync::Mutex;

    use camino::{Utf8Path, Utf8PathBuf};

    use super::*;
    use crate::action::{CommandTemplate, LocalRunner};
    use crate::bypass::BypassDirective;
    use crate::graph::Graph;
    use crate::task::Task;
    use crate::workspace::RunDirectory;

    /// Counts invocations per task, then delegates to the local runner.
    #[derive(Default)]
    struct Counting {
        calls: Mutex<HashMap<String, usize>>,
    }

    impl Counting {
        fn calls(&self, task: &str) -> usize {
            self.calls.lock().unwrap().get(task).copied().unwrap_or(0)
        }

        fn total(&self) -> usize {
            self.calls.lock().unwrap().values().sum()
        }
    }

    impl ActionRunner for Counting {
        fn run(&self, action: &Action, invocation: &Invocation) -> Result<Outputs, ActionError> {
            *self
                .calls
                .lock()
                .unwrap()
                .entry(invocation.task.to_string())
                .or_default() += 1;
            LocalRunner.run(action, invocation)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        root: Utf8PathBuf,
        runner: Arc<Counting>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();
            Self {
                _dir: dir,
                root,
                runner: Arc::new(Counting::default()),
            }
        }

        fn executor(&self, config: RunConfig) -> Executor {
            Executor::new(
                config,
                self.runner.clone(),
                Arc::new(RunDirectory::new(self.root.join("work"))),
            )
            .unwrap()
        }
    }

    const STRATEGIES: [Strategy; 2] = [Strategy::Serial, Strategy::Parallel(NonZeroUsize::MIN.saturating_add(3))];

    fn outputs(pairs: &[(&str, &str)]) -> Outputs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::text(*v)))
            .collect()
    }

    fn emit(slot: &'static str, value: &'static str) -> Action {
        Action::function(format!("emit:{slot}:{value}"), move |_| Ok(outputs(&[(slot, value)])))
    }

    /// Reads input `from` and writes it, suffixed with `!`, to output `to`.
    fn shout(from: &'static str, to: &'static str) -> Action {
        Action::function(format!("shout:{from}:{to}"), move |inv| {
            let text = inv.input(from).and_then(Value::as_text).unwrap_or_default();
            Ok(Outputs::from([(to.to_string(), Value::text(format!("{text}!")))]))
        })
    }

    fn broken() -> Action {
        Action::function("broken", |_| anyhow::bail!("segmentation failed"))
    }

    /// a(x) -> b(x; y)
    fn chain() -> Pipeline {
        let mut graph = Graph::new();
        graph.add_task(Task::new("a", emit("x", "hello")).output("x")).unwrap();
        graph
            .add_task(Task::new("b", shout("x", "y")).input("x").output("y"))
            .unwrap();
        graph.connect("a", "x", "b", "x").unwrap();
        graph.validate().unwrap()
    }

    /// a(x) -> b(x; y) -> c(y; z), with b failing, plus an unrelated d.
    fn cascade() -> Pipeline {
        let mut graph = Graph::new();
        graph.add_task(Task::new("a", emit("x", "1")).output("x")).unwrap();
        graph
            .add_task(Task::new("b", broken()).input("x").output("y"))
            .unwrap();
        graph
            .add_task(Task::new("c", shout("y", "z")).input("y").output("z"))
            .unwrap();
        graph.add_task(Task::new("d", emit("w", "2")).output("w")).unwrap();
        graph.connect("a", "x", "b", "x").unwrap();
        graph.connect("b", "y", "c", "y").unwrap();
        graph.validate().unwrap()
    }

    #[test]
    fn test_outputs_flow_downstream() {
        for strategy in STRATEGIES {
            let fx = Fixture::new();
            let config = RunConfig::default().with_strategy(strategy).with_cache(false);
            let mut pipeline = chain();

            let report = fx.executor(config).run(&mut pipeline).unwrap();

            assert!(report.is_success(), "{strategy}");
            assert_eq!(pipeline.state("b"), Some(TaskState::Completed));
            assert_eq!(pipeline.outputs("b"), Some(&outputs(&[("y", "hello!")])));
            assert_eq!(fx.runner.calls("a"), 1);
            assert_eq!(fx.runner.calls("b"), 1);
            assert_eq!(report.records.len(), 2);
        }
    }

    #[test]
    fn test_bypassed_task_is_never_executed() {
        for strategy in STRATEGIES {
            let fx = Fixture::new();
            let config = RunConfig::default()
                .with_strategy(strategy)
                .with_bypass(BypassDirective::new("a", outputs(&[("x", "precomputed")])));
            let mut pipeline = chain();

            let report = fx.executor(config).run(&mut pipeline).unwrap();

            assert!(report.is_success());
            assert_eq!(fx.runner.calls("a"), 0);
            assert_eq!(pipeline.state("a"), Some(TaskState::Skipped));
            assert_eq!(report.record("a").unwrap().state, TaskState::Skipped);
            assert_eq!(
                pipeline.outputs("b"),
                Some(&outputs(&[("y", "precomputed!")]))
            );
        }
    }

    #[test]
    fn test_failure_blocks_dependents_only() {
        for strategy in STRATEGIES {
            let fx = Fixture::new();
            let config = RunConfig::default().with_strategy(strategy).with_cache(false);
            let mut pipeline = cascade();

            let report = fx.executor(config).run(&mut pipeline).unwrap();

            assert!(!report.is_success());
            assert_eq!(report.exit_code(), 1);
            assert_eq!(report.records.len(), 4);

            assert_eq!(pipeline.state("a"), Some(TaskState::Completed));
            assert_eq!(pipeline.state("d"), Some(TaskState::Completed));
            assert_eq!(pipeline.state("b"), Some(TaskState::Failed));
            assert_eq!(pipeline.state("c"), Some(TaskState::Failed));
            assert_eq!(fx.runner.calls("c"), 0);

            let b = report.record("b").unwrap();
            assert!(matches!(
                &b.error,
                Some(FailureKind::ActionExecution(err)) if err.stderr.contains("segmentation failed")
            ));
            assert_eq!(
                report.record("c").unwrap().error,
                Some(FailureKind::BlockedByDependencyFailure {
                    dependency: "b".into()
                })
            );
            assert_eq!(report.first_failure().unwrap().name, "b");
        }
    }

    #[test]
    fn test_failure_blocks_transitive_dependents() {
        for strategy in STRATEGIES {
            let fx = Fixture::new();
            let config = RunConfig::default().with_strategy(strategy).with_cache(false);

            // a(x) -> b(x; y) -> c(y; z) -> d(z; w), with a failing.
            let mut graph = Graph::new();
            graph.add_task(Task::new("a", broken()).output("x")).unwrap();
            graph
                .add_task(Task::new("b", shout("x", "y")).input("x").output("y"))
                .unwrap();
            graph
                .add_task(Task::new("c", shout("y", "z")).input("y").output("z"))
                .unwrap();
            graph
                .add_task(Task::new("d", shout("z", "w")).input("z").output("w"))
                .unwrap();
            graph.connect("a", "x", "b", "x").unwrap();
            graph.connect("b", "y", "c", "y").unwrap();
            graph.connect("c", "z", "d", "z").unwrap();
            let mut pipeline = graph.validate().unwrap();

            let report = fx.executor(config).run(&mut pipeline).unwrap();

            assert_eq!(report.records.len(), 4);
            assert_eq!(fx.runner.total(), 1);
            for name in ["b", "c", "d"] {
                assert_eq!(pipeline.state(name), Some(TaskState::Failed), "{strategy}");
                assert_eq!(
                    report.record(name).unwrap().error,
                    Some(FailureKind::BlockedByDependencyFailure {
                        dependency: "a".into()
                    })
                );
            }
        }
    }

    #[test]
    fn test_abort_on_failure_stops_admission() {
        let slow = Action::function("slow", |_| {
            std::thread::sleep(Duration::from_millis(100));
            Ok(outputs(&[("y", "late")]))
        });

        for strategy in [Strategy::Serial, Strategy::Parallel(NonZeroUsize::MIN.saturating_add(1))] {
            let fx = Fixture::new();
            let config = RunConfig::default()
                .with_strategy(strategy)
                .with_cache(false)
                .with_abort_on_failure(true);

            // a fails at once, s(y) -> d(y; z) is unrelated to it.
            let mut graph = Graph::new();
            graph.add_task(Task::new("s", slow.clone()).output("y")).unwrap();
            graph
                .add_task(Task::new("d", shout("y", "z")).input("y").output("z"))
                .unwrap();
            graph.connect("s", "y", "d", "y").unwrap();
            graph.add_task(Task::new("a", broken()).output("x")).unwrap();
            let mut pipeline = graph.validate().unwrap();
            assert_eq!(pipeline.order().next(), Some("a"));

            let report = fx.executor(config).run(&mut pipeline).unwrap();

            assert_eq!(report.records.len(), 3);
            assert!(pipeline.order().all(|name| pipeline.state(name).unwrap().is_terminal()));
            assert_eq!(pipeline.state("d"), Some(TaskState::Failed), "{strategy}");
            assert_eq!(fx.runner.calls("d"), 0);
            assert!(
                report
                    .records
                    .iter()
                    .any(|r| r.error == Some(FailureKind::Aborted)),
                "{strategy}: {report}"
            );
        }
    }

    #[test]
    fn test_runner_panic_becomes_task_failure() {
        struct Panicking;

        impl ActionRunner for Panicking {
            fn run(&self, _: &Action, _: &Invocation) -> Result<Outputs, ActionError> {
                panic!("runner exploded")
            }
        }

        for strategy in STRATEGIES {
            let fx = Fixture::new();
            let executor = Executor::new(
                RunConfig::default().with_strategy(strategy),
                Arc::new(Panicking),
                Arc::new(RunDirectory::new(fx.root.join("work"))),
            )
            .unwrap();
            let mut pipeline = chain();

            let report = executor.run(&mut pipeline).unwrap();

            assert_eq!(pipeline.state("a"), Some(TaskState::Failed), "{strategy}");
            assert_eq!(pipeline.state("b"), Some(TaskState::Failed));
            assert!(matches!(
                &report.record("a").unwrap().error,
                Some(FailureKind::ActionExecution(err)) if err.stderr.contains("runner exploded")
            ));
        }
    }

    #[test]
    fn test_rerun_hits_the_cache() {
        for strategy in STRATEGIES {
            let fx = Fixture::new();
            let executor = fx.executor(RunConfig::default().with_strategy(strategy));
            let mut pipeline = chain();

            executor.run(&mut pipeline).unwrap();
            assert_eq!(fx.runner.total(), 2);

            pipeline.reset();
            let report = executor.run(&mut pipeline).unwrap();

            assert!(report.is_success());
            assert_eq!(fx.runner.total(), 2);
            assert!(report.records.iter().all(|r| r.cached));
            assert_eq!(pipeline.outputs("b"), Some(&outputs(&[("y", "hello!")])));
        }
    }

    #[test]
    fn test_disk_cache_survives_executors() {
        let fx = Fixture::new();
        let config = RunConfig {
            cache_dir: Some(fx.root.join("cache")),
            ..RunConfig::default()
        };

        let mut pipeline = chain();
        fx.executor(config.clone()).run(&mut pipeline).unwrap();

        let mut pipeline = chain();
        let report = fx.executor(config).run(&mut pipeline).unwrap();

        assert!(report.is_success());
        assert_eq!(fx.runner.total(), 2);
        assert!(report.record("b").unwrap().cached);
    }

    #[test]
    fn test_identical_tasks_collapse() {
        let slow = Action::function("slow", |_| {
            std::thread::sleep(Duration::from_millis(50));
            Ok(outputs(&[("x", "same")]))
        });

        let mut graph = Graph::new();
        for i in 0..6 {
            graph
                .add_task(Task::new(format!("copy{i}"), slow.clone()).output("x"))
                .unwrap();
        }
        let mut pipeline = graph.validate().unwrap();

        let fx = Fixture::new();
        let config = RunConfig::default().with_strategy(Strategy::Parallel(NonZeroUsize::new(6).unwrap()));
        let report = fx.executor(config).run(&mut pipeline).unwrap();

        assert!(report.is_success());
        assert_eq!(fx.runner.total(), 1);
        assert_eq!(report.records.iter().filter(|r| !r.cached).count(), 1);
        for i in 0..6 {
            assert_eq!(
                pipeline.outputs(&format!("copy{i}")),
                Some(&outputs(&[("x", "same")]))
            );
        }
    }

    #[test]
    fn test_undeclared_outputs_fail_the_task() {
        let mut graph = Graph::new();
        graph
            .add_task(Task::new("a", emit("unexpected", "1")).output("x"))
            .unwrap();
        let mut pipeline = graph.validate().unwrap();

        let fx = Fixture::new();
        let report = fx.executor(RunConfig::default()).run(&mut pipeline).unwrap();

        assert_eq!(pipeline.state("a"), Some(TaskState::Failed));
        assert!(matches!(
            report.record("a").unwrap().error,
            Some(FailureKind::ActionExecution(_))
        ));
    }

    #[test]
    fn test_run_requires_fresh_pipeline() {
        let fx = Fixture::new();
        let executor = fx.executor(RunConfig::default().with_cache(false));
        let mut pipeline = chain();

        executor.run(&mut pipeline).unwrap();
        assert!(matches!(
            executor.run(&mut pipeline),
            Err(EngineError::Graph(GraphError::InvalidStateTransition {
                from: TaskState::Completed,
                ..
            }))
        ));
        assert_eq!(fx.runner.total(), 2);
    }

    #[test]
    fn test_bad_bypass_aborts_before_execution() {
        let fx = Fixture::new();
        let config = RunConfig::default().with_bypass(BypassDirective::new("ghost", Outputs::new()));
        let mut pipeline = chain();

        assert!(matches!(
            fx.executor(config).run(&mut pipeline),
            Err(EngineError::Graph(GraphError::UnknownTask(name))) if name == "ghost"
        ));
        assert_eq!(fx.runner.total(), 0);
    }

    #[test]
    fn test_rejected_bypass_set_leaves_pipeline_untouched() {
        let fx = Fixture::new();
        let valid = BypassDirective::new("a", outputs(&[("x", "precomputed")]));
        let config = RunConfig::default()
            .with_bypass(valid.clone())
            .with_bypass(BypassDirective::new("ghost", Outputs::new()));
        let mut pipeline = chain();

        assert!(fx.executor(config).run(&mut pipeline).is_err());
        assert_eq!(pipeline.state("a"), Some(TaskState::Pending));

        let report = fx
            .executor(RunConfig::default().with_bypass(valid))
            .run(&mut pipeline)
            .unwrap();

        assert!(report.is_success());
        assert_eq!(fx.runner.calls("a"), 0);
        assert_eq!(pipeline.outputs("b"), Some(&outputs(&[("y", "precomputed!")])));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_pipeline_in_workspaces() {
        let fx = Fixture::new();

        let write = CommandTemplate::new("sh")
            .arg("-c")
            .arg("printf hello > out.txt")
            .produces("x", "out.txt");
        let upper = CommandTemplate::new("sh")
            .arg("-c")
            .arg("tr a-z A-Z < \"$0\" > up.txt")
            .input("x")
            .produces("y", "up.txt");

        let mut graph = Graph::new();
        graph
            .add_task(Task::new("a", Action::command(write)).output("x"))
            .unwrap();
        graph
            .add_task(Task::new("b", Action::command(upper)).input("x").output("y"))
            .unwrap();
        graph.connect("a", "x", "b", "x").unwrap();
        let mut pipeline = graph.validate().unwrap();

        let report = fx.executor(RunConfig::default()).run(&mut pipeline).unwrap();
        assert!(report.is_success(), "{report}");

        let x = pipeline.outputs("a").unwrap()["x"].as_path().unwrap();
        let y = pipeline.outputs("b").unwrap()["y"].as_path().unwrap();
        assert_eq!(x, fx.root.join("work/a/out.txt"));
        assert_eq!(y, fx.root.join("work/b/up.txt"));
        assert_eq!(std::fs::read_to_string(y).unwrap(), "HELLO");
    }

    #[cfg(unix)]
    #[test]
    fn test_shared_store_keeps_workspaces_apart() {
        let fx = Fixture::new();
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());

        let write = CommandTemplate::new("sh")
            .arg("-c")
            .arg("printf hi > out.txt")
            .produces("x", "out.txt");

        let run = |root: &str| {
            let mut graph = Graph::new();
            graph
                .add_task(Task::new("a", Action::command(write.clone())).output("x"))
                .unwrap();
            let mut pipeline = graph.validate().unwrap();

            let executor = Executor::new(
                RunConfig::default(),
                fx.runner.clone(),
                Arc::new(RunDirectory::new(fx.root.join(root))),
            )
            .unwrap()
            .with_store(store.clone());

            let report = executor.run(&mut pipeline).unwrap();
            let x = pipeline.outputs("a").unwrap()["x"].as_path().unwrap().to_owned();
            (report, x)
        };

        let (_, first) = run("run1");
        let (report, second) = run("run2");

        assert!(!report.record("a").unwrap().cached);
        assert_eq!(second, fx.root.join("run2/a/out.txt"));
        assert!(second.exists());
        assert_ne!(first, second);

        let (report, again) = run("run1");
        assert!(report.record("a").unwrap().cached);
        assert_eq!(again, first);
        assert_eq!(fx.runner.total(), 2);
    }
}
