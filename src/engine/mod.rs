mod diagnostics;
mod runner;

use std::sync::Arc;

use crate::core::{Dynamic, Environment, Inputs, Source, TaskConfig, TaskContext};
use crate::data::{Dataset, Record};
use crate::emit::RunOutput;
use crate::error::MaterializeError;
use crate::registry::{Execution, TaskDescriptor};

pub use diagnostics::{ChunkExecution, Diagnostics};
pub use runner::{Engine, Merged};

/// A task whose table is built independently for every chunk of stations.
///
/// `setup` sees only the stations of its chunk, and the outputs of all chunks
/// are concatenated afterwards. Rows belonging to different stations must
/// therefore never depend on each other.
pub trait Parameterizer: Send + Sync + 'static {
    type Record: Record;

    fn descriptor(&self) -> TaskDescriptor;

    /// Computes the table for `ctx.stations` from the prerequisite outputs.
    fn setup(&self, ctx: &TaskContext<'_>, inputs: &Inputs) -> anyhow::Result<Dataset<Self::Record>>;

    /// Derives namelist entries and diagnostics from the merged table.
    fn run(&self, _ctx: &TaskContext<'_>, _data: &Dataset<Self::Record>) -> anyhow::Result<RunOutput> {
        Ok(RunOutput::default())
    }

    /// Where the table comes from for this run.
    fn source(&self, config: &TaskConfig, default: Source) -> Source {
        config.source.unwrap_or(default)
    }
}

/// A task that can only be computed once all chunks are done.
///
/// Each chunk contributes a partial table, typically sums over a station,
/// and `finalize` reduces the concatenated partials to the final table.
pub trait Pooled: Send + Sync + 'static {
    type Partial: Record;
    type Record: Record;

    fn descriptor(&self) -> TaskDescriptor;

    fn partial(&self, ctx: &TaskContext<'_>, inputs: &Inputs) -> anyhow::Result<Dataset<Self::Partial>>;

    fn finalize(
        &self,
        ctx: &TaskContext<'_>,
        partial: &Dataset<Self::Partial>,
    ) -> anyhow::Result<Dataset<Self::Record>>;

    fn run(&self, _ctx: &TaskContext<'_>, _data: &Dataset<Self::Record>) -> anyhow::Result<RunOutput> {
        Ok(RunOutput::default())
    }

    fn source(&self, config: &TaskConfig, default: Source) -> Source {
        config.source.unwrap_or(default)
    }
}

/// Object safe view of a registered task used by the coordinator.
pub(crate) trait Task: Send + Sync {
    fn descriptor(&self) -> &TaskDescriptor;

    fn source(&self, env: &Environment) -> Source;

    /// Computes the chunk output: the table for single tasks, the partial
    /// for deferred ones.
    fn compute(&self, ctx: &TaskContext<'_>, inputs: &Inputs) -> anyhow::Result<Dynamic>;

    /// Reads the stored table, restricted to the context stations.
    fn load(&self, ctx: &TaskContext<'_>, source: Source) -> Result<Dynamic, MaterializeError>;

    /// Concatenates chunk outputs in chunk order.
    fn merge(&self, parts: Vec<Dynamic>) -> anyhow::Result<Dynamic>;

    /// Turns merged partials into the final table. Identity for single tasks.
    fn finalize(&self, ctx: &TaskContext<'_>, merged: Dynamic) -> anyhow::Result<Dynamic>;

    /// Writes the final table to the configured stores.
    fn persist(&self, env: &Environment, data: &Dynamic) -> anyhow::Result<()>;

    fn run(&self, ctx: &TaskContext<'_>, data: &Dynamic) -> anyhow::Result<RunOutput>;

    fn rows(&self, data: &Dynamic) -> usize;
}

fn downcast<'a, R: Record>(name: &str, data: &'a Dynamic) -> anyhow::Result<&'a Dataset<R>> {
    data.downcast_ref::<Dataset<R>>().ok_or_else(|| {
        anyhow::anyhow!(
            "Output of '{name}' is not a dataset of {}",
            std::any::type_name::<R>()
        )
    })
}

fn concat<R: Record>(name: &str, parts: Vec<Dynamic>) -> anyhow::Result<Dataset<R>> {
    let mut datasets = Vec::with_capacity(parts.len());
    for part in parts {
        let part = Arc::downcast::<Dataset<R>>(part).map_err(|_| {
            anyhow::anyhow!(
                "Chunk output of '{name}' is not a dataset of {}",
                std::any::type_name::<R>()
            )
        })?;
        datasets.push(Arc::try_unwrap(part).unwrap_or_else(|shared| (*shared).clone()));
    }
    Ok(Dataset::concat(datasets))
}

pub(crate) struct Single<T> {
    task: T,
    descriptor: TaskDescriptor,
}

impl<T: Parameterizer> Single<T> {
    pub(crate) fn new(task: T) -> Self {
        let mut descriptor = task.descriptor();
        descriptor.execution = Execution::PerChunk;
        Self { task, descriptor }
    }
}

impl<T: Parameterizer> Task for Single<T> {
    fn descriptor(&self) -> &TaskDescriptor {
        &self.descriptor
    }

    fn source(&self, env: &Environment) -> Source {
        self.task.source(env.config(self.descriptor.name), env.source)
    }

    fn compute(&self, ctx: &TaskContext<'_>, inputs: &Inputs) -> anyhow::Result<Dynamic> {
        Ok(Arc::new(self.task.setup(ctx, inputs)?))
    }

    fn load(&self, ctx: &TaskContext<'_>, source: Source) -> Result<Dynamic, MaterializeError> {
        Ok(Arc::new(crate::source::load::<T::Record>(
            &self.descriptor,
            ctx,
            source,
        )?))
    }

    fn merge(&self, parts: Vec<Dynamic>) -> anyhow::Result<Dynamic> {
        Ok(Arc::new(concat::<T::Record>(self.descriptor.name, parts)?))
    }

    fn finalize(&self, _ctx: &TaskContext<'_>, merged: Dynamic) -> anyhow::Result<Dynamic> {
        Ok(merged)
    }

    fn persist(&self, env: &Environment, data: &Dynamic) -> anyhow::Result<()> {
        let data = downcast::<T::Record>(self.descriptor.name, data)?;
        Ok(crate::source::persist(&self.descriptor, env, data)?)
    }

    fn run(&self, ctx: &TaskContext<'_>, data: &Dynamic) -> anyhow::Result<RunOutput> {
        self.task
            .run(ctx, downcast::<T::Record>(self.descriptor.name, data)?)
    }

    fn rows(&self, data: &Dynamic) -> usize {
        data.downcast_ref::<Dataset<T::Record>>()
            .map_or(0, Dataset::len)
    }
}

pub(crate) struct Deferred<T> {
    task: T,
    descriptor: TaskDescriptor,
}

impl<T: Pooled> Deferred<T> {
    pub(crate) fn new(task: T) -> Self {
        let mut descriptor = task.descriptor();
        descriptor.execution = Execution::Deferred;
        Self { task, descriptor }
    }
}

impl<T: Pooled> Task for Deferred<T> {
    fn descriptor(&self) -> &TaskDescriptor {
        &self.descriptor
    }

    fn source(&self, env: &Environment) -> Source {
        self.task.source(env.config(self.descriptor.name), env.source)
    }

    fn compute(&self, ctx: &TaskContext<'_>, inputs: &Inputs) -> anyhow::Result<Dynamic> {
        Ok(Arc::new(self.task.partial(ctx, inputs)?))
    }

    fn load(&self, ctx: &TaskContext<'_>, source: Source) -> Result<Dynamic, MaterializeError> {
        Ok(Arc::new(crate::source::load::<T::Record>(
            &self.descriptor,
            ctx,
            source,
        )?))
    }

    fn merge(&self, parts: Vec<Dynamic>) -> anyhow::Result<Dynamic> {
        Ok(Arc::new(concat::<T::Partial>(self.descriptor.name, parts)?))
    }

    fn finalize(&self, ctx: &TaskContext<'_>, merged: Dynamic) -> anyhow::Result<Dynamic> {
        let partial = downcast::<T::Partial>(self.descriptor.name, &merged)?;
        Ok(Arc::new(self.task.finalize(ctx, partial)?))
    }

    fn persist(&self, env: &Environment, data: &Dynamic) -> anyhow::Result<()> {
        let data = downcast::<T::Record>(self.descriptor.name, data)?;
        Ok(crate::source::persist(&self.descriptor, env, data)?)
    }

    fn run(&self, ctx: &TaskContext<'_>, data: &Dynamic) -> anyhow::Result<RunOutput> {
        self.task
            .run(ctx, downcast::<T::Record>(self.descriptor.name, data)?)
    }

    fn rows(&self, data: &Dynamic) -> usize {
        data.downcast_ref::<Dataset<T::Record>>()
            .map_or(0, Dataset::len)
    }
}
