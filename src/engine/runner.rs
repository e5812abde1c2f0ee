use std::collections::HashMap;
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use indicatif::ProgressStyle;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::{Dynamic, Environment, Inputs, Policy, Source, TaskContext};
use crate::data::{Dataset, Record};
use crate::emit::{RunResult, emit};
use crate::engine::Diagnostics;
use crate::engine::diagnostics::ChunkExecution;
use crate::error::{ChunkExecutionError, ParamError};
use crate::registry::{Execution, Plan, Registry};

/// Outputs of one chunk, aligned with the plan. Tasks that are not computed
/// per chunk are `None`.
struct ChunkOutput {
    data: Vec<Option<Dynamic>>,
    times: Vec<(&'static str, Duration)>,
}

/// The merged result of a run: one dataset per task of the plan.
pub struct Merged {
    plan: Plan,
    data: HashMap<&'static str, Dynamic>,
    pub diagnostics: Diagnostics,
}

impl Merged {
    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Typed access to the merged table of `name`.
    pub fn get<R: Record>(&self, name: &str) -> Option<&Dataset<R>> {
        self.data.get(name)?.downcast_ref()
    }

    pub(crate) fn raw(&self, name: &str) -> Option<&Dynamic> {
        self.data.get(name)
    }
}

/// Runs resolved task chains over a station list.
pub struct Engine {
    registry: Registry,
    env: Environment,
    policy: Policy,
}

impl Engine {
    pub fn new(registry: Registry, env: Environment) -> Self {
        Self {
            registry,
            env,
            policy: Policy::default(),
        }
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Resolves `requested`, runs the chain over `stations`, and merges the
    /// per-chunk outputs into one dataset per task. Merged tables built from
    /// scratch are persisted as their configuration asks.
    pub fn materialize(&self, requested: &[&str], stations: &[String]) -> Result<Merged, ParamError> {
        let plan = self.registry.resolve(requested)?;
        tracing::debug!("Resolved plan {:?}", plan);

        let sources: Vec<Source> = plan
            .tasks
            .iter()
            .map(|task| task.source(&self.env))
            .collect();

        let chunks = self.policy.partition(stations);
        let (outputs, executions) = match self.policy {
            Policy::Serial => self.run_serial(&plan, &sources, &chunks)?,
            Policy::Parallel { .. } => self.run_parallel(&plan, &sources, &chunks)?,
        };

        let mut diagnostics = Diagnostics {
            chunks: executions,
            ..Default::default()
        };
        for output in &outputs {
            for (name, time) in &output.times {
                *diagnostics.task_times.entry(*name).or_default() += *time;
            }
        }

        let data = self.merge(&plan, &sources, outputs, stations, &mut diagnostics)?;

        tracing::info!("Materialized {} tasks over {} stations", plan.len(), stations.len());
        Ok(Merged {
            plan,
            data,
            diagnostics,
        })
    }

    /// Materializes the requested tasks and emits their namelist and info.
    pub fn run(&self, requested: &[&str], stations: &[String]) -> Result<(Merged, RunResult), ParamError> {
        let merged = self.materialize(requested, stations)?;
        let result = emit(&merged, &self.env, stations)?;
        tracing::info!("Build complete!");
        Ok((merged, result))
    }

    fn run_serial(
        &self,
        plan: &Plan,
        sources: &[Source],
        chunks: &[Vec<String>],
    ) -> Result<(Vec<ChunkOutput>, Vec<ChunkExecution>), ParamError> {
        let mut outputs = Vec::with_capacity(chunks.len());
        let mut executions = Vec::with_capacity(chunks.len());

        for (index, chunk) in chunks.iter().enumerate() {
            let start = Instant::now();
            let output = execute_chunk(plan, sources, &self.env, index, chunk)
                .map_err(|cause| chunk_error(index, chunk, cause))?;
            executions.push(ChunkExecution {
                index,
                stations: chunk.len(),
                start,
                duration: start.elapsed(),
            });
            outputs.push(output);
        }

        Ok((outputs, executions))
    }

    /// Executes every chunk on a dedicated pool. Each job gets its station
    /// slice and shared read-only access to the plan and environment, and
    /// reports back over a channel.
    fn run_parallel(
        &self,
        plan: &Plan,
        sources: &[Source],
        chunks: &[Vec<String>],
    ) -> Result<(Vec<ChunkOutput>, Vec<ChunkExecution>), ParamError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.policy.workers())
            .thread_name(|i| format!("stochparam-{i}"))
            .build()?;

        let total = chunks.len();
        let root_span = tracing::span!(Level::INFO, "chunks");
        root_span.pb_set_length(total as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        {
            root_span.pb_set_style(&style.progress_chars("=>-"));
        }
        root_span.pb_set_message("Processing station chunks...");
        let _enter = root_span.enter();

        let chunk_style = crate::utils::get_style_task();
        let env = &self.env;

        let mut results = Vec::with_capacity(total);

        // The calling thread only collects results, jobs run on the pool.
        pool.in_place_scope(|s| {
            let (sender, receiver) =
                channel::<(usize, anyhow::Result<ChunkOutput>, Instant, Duration)>();

            for (index, chunk) in chunks.iter().enumerate() {
                let sender = sender.clone();
                let chunk_style = chunk_style.clone();
                let parent = root_span.clone();

                s.spawn(move |_| {
                    let span = tracing::span!(parent: &parent, Level::INFO, "chunk", chunk = index);
                    if let Some(style) = &chunk_style {
                        span.pb_set_style(style);
                    }
                    span.pb_set_message(&format!("Chunk {index} ({} stations)", chunk.len()));
                    let _enter = span.enter();

                    let start = Instant::now();
                    let output = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        execute_chunk(plan, sources, env, index, chunk)
                    })) {
                        Ok(result) => result,
                        Err(panic) => {
                            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                                format!("Task panicked: {s}")
                            } else if let Some(s) = panic.downcast_ref::<String>() {
                                format!("Task panicked: {s}")
                            } else {
                                String::from("Task panicked with unknown payload")
                            };
                            Err(anyhow::anyhow!(msg))
                        }
                    };

                    // The receiver outlives the scope.
                    let _ = sender.send((index, output, start, start.elapsed()));
                });
            }
            drop(sender);

            while results.len() < total {
                let Ok(message) = receiver.recv() else { break };
                results.push(message);
                root_span.pb_inc(1);
            }
        });

        results.sort_by_key(|(index, ..)| *index);

        let mut outputs = Vec::with_capacity(total);
        let mut executions = Vec::with_capacity(total);
        for (index, output, start, duration) in results {
            let output = output.map_err(|cause| chunk_error(index, &chunks[index], cause))?;
            executions.push(ChunkExecution {
                index,
                stations: chunks[index].len(),
                start,
                duration,
            });
            outputs.push(output);
        }

        if outputs.len() != total {
            return Err(ParamError::Chunk(ChunkExecutionError {
                chunk: outputs.len(),
                stations: 0,
                first: String::new(),
                last: String::new(),
                cause: anyhow::anyhow!("Worker exited without reporting a result"),
            }));
        }

        Ok((outputs, executions))
    }

    /// Folds the chunk outputs into one dataset per task, in plan order,
    /// completes deferred tasks and writes tables built from scratch to the
    /// configured stores.
    fn merge(
        &self,
        plan: &Plan,
        sources: &[Source],
        outputs: Vec<ChunkOutput>,
        stations: &[String],
        diagnostics: &mut Diagnostics,
    ) -> Result<HashMap<&'static str, Dynamic>, ParamError> {
        let mut columns: Vec<Vec<Dynamic>> = vec![Vec::with_capacity(outputs.len()); plan.len()];
        for output in outputs {
            for (slot, data) in output.data.into_iter().enumerate() {
                if let Some(data) = data {
                    columns[slot].push(data);
                }
            }
        }

        let mut merged = HashMap::with_capacity(plan.len());

        for ((task, source), parts) in plan.tasks.iter().zip(sources).zip(columns) {
            let descriptor = task.descriptor();
            let name = descriptor.name;
            let span = tracing::span!(Level::INFO, "merge", task = name);
            let _enter = span.enter();
            let ctx = TaskContext::new(&self.env, name, stations);
            let wrap = |cause: anyhow::Error| ParamError::Task {
                task: name.to_string(),
                cause,
            };

            let start = Instant::now();
            let data = match (descriptor.execution, source) {
                (Execution::Deferred, Source::Scratch) => {
                    let partial = task.merge(parts).map_err(wrap)?;
                    task.finalize(&ctx, partial).map_err(wrap)?
                }
                (Execution::Deferred, source) => task.load(&ctx, *source)?,
                (Execution::PerChunk, _) => task.merge(parts).map_err(wrap)?,
            };
            // Only merged tables are written, so no two workers share a file
            // or table. A failing task leaves the tables before it in place.
            if *source == Source::Scratch {
                task.persist(&self.env, &data).map_err(wrap)?;
            }
            *diagnostics.task_times.entry(name).or_default() += start.elapsed();

            tracing::debug!(task = name, rows = task.rows(&data), "Merged");
            merged.insert(name, data);
        }

        Ok(merged)
    }
}

fn chunk_error(index: usize, chunk: &[String], cause: anyhow::Error) -> ParamError {
    ParamError::Chunk(ChunkExecutionError {
        chunk: index,
        stations: chunk.len(),
        first: chunk.first().cloned().unwrap_or_default(),
        last: chunk.last().cloned().unwrap_or_default(),
        cause,
    })
}

/// Runs the whole plan for one chunk of stations.
///
/// Per-chunk tasks are computed or loaded and made available to the tasks
/// after them. Deferred tasks built from scratch contribute their partial
/// table. Deferred tasks with a stored table are skipped here and loaded once
/// after the merge.
fn execute_chunk(
    plan: &Plan,
    sources: &[Source],
    env: &Environment,
    index: usize,
    stations: &[String],
) -> anyhow::Result<ChunkOutput> {
    let mut inputs = Inputs::default();
    let mut data = Vec::with_capacity(plan.len());
    let mut times = Vec::with_capacity(plan.len());

    for (task, source) in plan.tasks.iter().zip(sources) {
        let descriptor = task.descriptor();
        let name = descriptor.name;

        if descriptor.execution == Execution::Deferred && *source != Source::Scratch {
            data.push(None);
            continue;
        }

        let span = tracing::span!(Level::DEBUG, "task", name, chunk = index);
        let _enter = span.enter();
        let ctx = TaskContext::new(env, name, stations);

        let start = Instant::now();
        let output = match source {
            Source::Scratch => task.compute(&ctx, &inputs),
            source => task.load(&ctx, *source).map_err(anyhow::Error::from),
        }
        .map_err(|err| err.context(format!("Task '{name}' ({source:?})")))?;
        times.push((name, start.elapsed()));

        tracing::debug!(task = name, rows = task.rows(&output), "Done");

        if descriptor.parallel_safe() {
            inputs.insert(name, output.clone());
        }
        data.push(Some(output));
    }

    Ok(ChunkOutput { data, times })
}
