//! Collection of run step results into the weather generator namelist.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::core::{Environment, TaskContext};
use crate::engine::Merged;
use crate::error::{EmitError, ParamError};

/// Namelist section all parameter tasks write into.
pub const NAMELIST_SECTION: &str = "weathergen_ctl";

/// What a single run step contributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunOutput {
    /// Section name to key/value entries.
    pub namelist: BTreeMap<String, Map<String, Value>>,
    /// Free form diagnostics, such as fit quality.
    pub info: Value,
}

impl RunOutput {
    /// Adds a key to the [`NAMELIST_SECTION`].
    pub fn param(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.param_in(NAMELIST_SECTION, key, value)
    }

    pub fn param_in(
        mut self,
        section: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.namelist
            .entry(section.into())
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    pub fn info(mut self, info: Value) -> Self {
        self.info = info;
        self
    }
}

/// The combined result of all run steps of a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunResult {
    pub namelist: BTreeMap<String, Map<String, Value>>,
    /// Run step info keyed by task name.
    pub info: BTreeMap<String, Value>,
    #[serde(skip)]
    owners: BTreeMap<(String, String), &'static str>,
}

impl RunResult {
    /// Folds the output of `task` in. A key already set by an earlier task to
    /// a different value is rejected.
    pub fn absorb(&mut self, task: &'static str, output: RunOutput) -> Result<(), EmitError> {
        for (section, entries) in output.namelist {
            let target = self.namelist.entry(section.clone()).or_default();
            for (key, value) in entries {
                let owner = (section.clone(), key.clone());
                match target.get(&key) {
                    Some(existing) if *existing != value => {
                        return Err(EmitError::ConflictingKey {
                            section,
                            key,
                            first: self.owners.get(&owner).copied().unwrap_or_default().to_string(),
                            second: task.to_string(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        target.insert(key, value);
                        self.owners.insert(owner, task);
                    }
                }
            }
        }

        if !output.info.is_null() {
            self.info.insert(task.to_string(), output.info);
        }
        Ok(())
    }
}

/// Harvests the merged tables in plan order. Tasks with a run step
/// contribute namelist entries and info.
pub(crate) fn emit(merged: &Merged, env: &Environment, stations: &[String]) -> Result<RunResult, ParamError> {
    let mut result = RunResult::default();

    for task in &merged.plan().tasks {
        let descriptor = task.descriptor();
        let name = descriptor.name;
        let Some(data) = merged.raw(name) else {
            continue;
        };
        let wrap = |cause: anyhow::Error| ParamError::Task {
            task: name.to_string(),
            cause,
        };

        if descriptor.has_run_step {
            let ctx = TaskContext::new(env, name, stations);
            let output = task.run(&ctx, data).map_err(wrap)?;
            tracing::debug!(task = name, "Run step done");
            result.absorb(name, output)?;
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_absorb_merges_sections() {
        let mut result = RunResult::default();
        result
            .absorb(
                "prcp",
                RunOutput::default()
                    .param("thresh", 15.0)
                    .info(json!({"slope": 1.2})),
            )
            .unwrap();
        result
            .absorb("temp", RunOutput::default().param("tmin_w1", 0.5))
            .unwrap();
        // same value again is fine
        result
            .absorb("other", RunOutput::default().param("thresh", 15.0))
            .unwrap();

        let section = &result.namelist[NAMELIST_SECTION];
        assert_eq!(section.len(), 2);
        assert_eq!(result.info["prcp"]["slope"], 1.2);
        assert!(!result.info.contains_key("temp"));
    }

    #[test]
    fn test_absorb_conflict() {
        let mut result = RunResult::default();
        result
            .absorb("prcp", RunOutput::default().param("thresh", 15.0))
            .unwrap();

        let err = result
            .absorb("late", RunOutput::default().param("thresh", 10.0))
            .unwrap_err();
        assert_eq!(
            err,
            EmitError::ConflictingKey {
                section: NAMELIST_SECTION.into(),
                key: "thresh".into(),
                first: "prcp".into(),
                second: "late".into(),
            }
        );
    }

    #[test]
    fn test_nan_becomes_null() {
        let output = RunOutput::default().param("g_scale_coeff", f64::NAN);
        assert!(output.namelist[NAMELIST_SECTION]["g_scale_coeff"].is_null());
    }
}
