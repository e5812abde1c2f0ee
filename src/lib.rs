//! Parameterization of a stochastic weather generator from station records.
//!
//! Tasks are registered in a [`Registry`], resolved into a [`Plan`] and
//! executed by the [`Engine`] over chunks of stations. Every task output is
//! a [`Dataset`] that is built from scratch, read from a CSV cache or read
//! from a SQLite table. Tasks with a run step turn their merged dataset into
//! namelist parameters collected in a [`RunResult`].
#![forbid(unsafe_code)]

mod core;
pub mod data;
mod emit;
mod engine;
mod error;
mod registry;
pub mod source;
pub mod stats;
pub mod tasks;
mod utils;

pub use crate::core::{ArgsType, DatabaseConfig, Environment, Inputs, Policy, Source, TaskConfig, TaskContext};
pub use crate::data::{Dataset, Record, SqlType, Value};
pub use crate::emit::{NAMELIST_SECTION, RunOutput, RunResult};
pub use crate::engine::{ChunkExecution, Diagnostics, Engine, Merged, Parameterizer, Pooled};
pub use crate::error::*;
pub use crate::registry::{Execution, Plan, Registry, TaskDescriptor};
pub use crate::tasks::standard_registry;
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
