use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use petgraph::graph::NodeIndex;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use super::{Executor, FailureKind, Job, Run};
use crate::cache::Provenance;
use crate::core::Outputs;
use crate::error::{ActionError, EngineError};
use crate::task::TaskState;
use crate::utils;

enum Event {
    Started(NodeIndex),
    Finished(NodeIndex, Result<(Outputs, Provenance), ActionError>, Duration),
    /// The job was picked up after the run had been aborted.
    Declined(NodeIndex),
}

impl Executor {
    /// Executes the pipeline on a pool of `workers` threads.
    ///
    /// The algorithm works as follows:
    /// 1. Each pending task gets a count of its producers that aren't resolved
    ///    yet. Bypassed producers count as done from the start.
    /// 2. Tasks with a zero count are admitted and spawned onto the pool.
    /// 3. The calling thread waits for events from the workers, it never
    ///    occupies a worker slot itself. Every state transition happens here.
    /// 4. When a task completes, the counts of its dependents are decremented
    ///    and those reaching zero are spawned.
    /// 5. When a task fails, its pending dependents are failed transitively
    ///    and never spawned.
    /// 6. The loop ends once no spawned job is left outstanding.
    pub(super) fn run_parallel(&self, run: &mut Run, workers: usize) -> Result<(), EngineError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("nagare-worker-{i}"))
            .build()?;

        let mut dependency_counts: HashMap<NodeIndex, usize> = run
            .pipeline
            .order
            .iter()
            .filter(|&&index| run.state(index) == TaskState::Pending)
            .map(|&index| {
                let count = run
                    .pipeline
                    .producers(index)
                    .into_iter()
                    .filter(|&producer| !run.state(producer).is_resolved())
                    .count();
                (index, count)
            })
            .collect();

        let seeds: Vec<NodeIndex> = run
            .pipeline
            .order
            .iter()
            .copied()
            .filter(|index| dependency_counts.get(index) == Some(&0))
            .collect();

        let style = utils::style_task()?;
        let progress = run.progress.clone();
        let aborted = &AtomicBool::new(false);
        let (sender, receiver) = channel::<Event>();

        pool.in_place_scope(|s| -> Result<(), EngineError> {
            let spawn = |job: Job| {
                let sender = sender.clone();
                let style = style.clone();
                let progress = progress.clone();

                s.spawn(move |_| {
                    if aborted.load(Ordering::Acquire) {
                        let _ = sender.send(Event::Declined(job.index));
                        return;
                    }

                    let _ = sender.send(Event::Started(job.index));

                    let span = tracing::span!(parent: &progress, Level::INFO, "task", name = &*job.name);
                    span.pb_set_style(&style);
                    span.pb_set_message(&format!("Running {}", job.name));

                    let started = Instant::now();
                    let result = span.in_scope(|| self.attempt(&job));

                    let _ = sender.send(Event::Finished(job.index, result, started.elapsed()));
                });
            };

            let mut in_flight = 0_usize;

            for index in seeds {
                if let Some(job) = run.admit(index)? {
                    in_flight += 1;
                    spawn(job);
                }
            }

            while in_flight > 0 {
                let Ok(event) = receiver.recv() else {
                    break;
                };

                match event {
                    Event::Started(index) => run.start(index)?,
                    Event::Declined(index) => {
                        in_flight -= 1;
                        run.fail(index, FailureKind::Aborted, Duration::ZERO)?;
                    }
                    Event::Finished(index, result, duration) => {
                        in_flight -= 1;

                        let succeeded = result.is_ok();
                        run.finish(index, result, duration)?;

                        if !succeeded {
                            if run.abort_on_failure {
                                aborted.store(true, Ordering::Release);
                            }
                            continue;
                        }

                        // Unlock dependents
                        for dependent in run.pipeline.dependents(index) {
                            let Some(count) = dependency_counts.get_mut(&dependent) else {
                                continue;
                            };

                            *count -= 1;
                            if *count == 0
                                && run.state(dependent) == TaskState::Pending
                                && let Some(job) = run.admit(dependent)?
                            {
                                in_flight += 1;
                                spawn(job);
                            }
                        }
                    }
                }
            }

            Ok(())
        })
    }
}
