//! Materialization of task tables from the cache file or the relational store.

pub mod db;
pub mod eecra;
pub mod file;
pub mod ghcn;

use crate::core::{Environment, Source, TaskContext};
use crate::data::{Dataset, Record};
use crate::error::MaterializeError;
use crate::registry::TaskDescriptor;

/// Reads the stored table of a task, keeping the rows of `ctx.stations`.
///
/// Fails when the store has no such table, or when none of the requested
/// stations are present and the task does not allow empty results.
pub(crate) fn load<R: Record>(
    descriptor: &TaskDescriptor,
    ctx: &TaskContext<'_>,
    source: Source,
) -> Result<Dataset<R>, MaterializeError> {
    let missing = |location: String| MaterializeError::MissingDataSource {
        task: descriptor.name.to_string(),
        location,
    };

    let (data, location) = match source {
        Source::File => {
            let path = ctx.env.param_path(&descriptor.file_name);
            if !path.is_file() {
                return Err(missing(path.to_string()));
            }
            (file::read_csv::<R>(&path)?, path.to_string())
        }
        Source::Database => {
            let config = ctx
                .env
                .database
                .as_ref()
                .ok_or_else(|| missing("an unconfigured database".into()))?;
            let location = format!("{}#{}", config.path, descriptor.table_name);
            let conn = db::open(&config.path)?;
            if !db::table_exists(&conn, &descriptor.table_name)? {
                return Err(missing(location));
            }
            (db::read_table::<R>(&conn, &descriptor.table_name)?, location)
        }
        Source::Scratch => unreachable!("scratch tables are computed, not loaded"),
    };

    let data = data.filter_stations(ctx.stations);
    if data.is_empty() && !ctx.stations.is_empty() && !descriptor.allow_empty {
        return Err(MaterializeError::MissingStations {
            task: descriptor.name.to_string(),
            requested: ctx.stations.len(),
            location,
        });
    }

    tracing::debug!(task = descriptor.name, rows = data.len(), "Loaded from {location}");
    Ok(data)
}

/// Writes a table to the cache file and the relational store, as configured.
pub(crate) fn persist<R: Record>(
    descriptor: &TaskDescriptor,
    env: &Environment,
    data: &Dataset<R>,
) -> Result<(), MaterializeError> {
    let config = env.config(descriptor.name);

    if config.to_csv() {
        let path = env.param_path(&descriptor.file_name);
        file::write_csv(&path, data)?;
        tracing::info!(task = descriptor.name, "Wrote {} rows to {path}", data.len());
    }

    if config.to_db() {
        let Some(database) = env.database.as_ref() else {
            return Err(MaterializeError::MissingDataSource {
                task: descriptor.name.to_string(),
                location: "an unconfigured database".into(),
            });
        };
        let mut conn = db::open(&database.path)?;
        db::write_table(&mut conn, &descriptor.table_name, data)?;
        tracing::info!(
            task = descriptor.name,
            "Wrote {} rows to table {}",
            data.len(),
            descriptor.table_name
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use camino::Utf8Path;
    use proptest::prelude::*;

    use super::*;
    use crate::core::TaskConfig;
    use crate::data::SqlType;

    crate::record! {
        struct Row {
            index: [id],
            station: id,
            id: String => SqlType::Text,
            value: f64 => SqlType::Real,
        }
    }

    fn rows() -> Dataset<Row> {
        Dataset::new(vec![
            Row { id: "A".into(), value: 1.0 },
            Row { id: "B".into(), value: 2.0 },
        ])
    }

    fn stations(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_persist_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let config = TaskConfig {
            to_csv: Some(true),
            to_db: Some(true),
            ..Default::default()
        };
        let env = Environment::new(root.join("params"), root.join("data"))
            .with_database(root.join("store.sqlite"))
            .with_task("rows", config)
            .unwrap();
        let descriptor = TaskDescriptor::new("rows").file("rows_file.csv");

        persist(&descriptor, &env, &rows()).unwrap();
        assert!(root.join("params/rows_file.csv").is_file());

        let wanted = stations(&["B", "C"]);
        let ctx = TaskContext::new(&env, "rows", &wanted);
        for source in [Source::File, Source::Database] {
            let data: Dataset<Row> = load(&descriptor, &ctx, source).unwrap();
            assert_eq!(data.len(), 1);
            assert_eq!(data.rows()[0].id, "B");
        }
    }

    crate::record! {
        struct Step {
            index: [id, step],
            station: id,
            id: String => SqlType::Text,
            step: u32 => SqlType::Integer,
            value: f64 => SqlType::Real,
        }
    }

    fn value() -> impl Strategy<Value = f64> {
        prop_oneof![Just(f64::NAN), Just(0.0), -1e9..1e9f64]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_stored_tables_read_back_unchanged(
            cells in proptest::collection::btree_map((0..5usize, 0..40u32), value(), 0..60),
            wanted in proptest::collection::btree_set(0..5usize, 0..5),
        ) {
            let data: Dataset<Step> = cells
                .iter()
                .map(|(&(id, step), &value)| Step { id: format!("ST{id}"), step, value })
                .collect();

            let dir = tempfile::tempdir().unwrap();
            let root = Utf8Path::from_path(dir.path()).unwrap();
            let config = TaskConfig {
                to_csv: Some(true),
                to_db: Some(true),
                ..Default::default()
            };
            let env = Environment::new(root, root)
                .with_database(root.join("store.sqlite"))
                .with_task("steps", config)
                .unwrap();
            let descriptor = TaskDescriptor::new("steps").allow_empty();
            persist(&descriptor, &env, &data).unwrap();

            let all: Vec<String> = (0..5).map(|i| format!("ST{i}")).collect();
            let some: Vec<String> = wanted.iter().map(|i| format!("ST{i}")).collect();
            for source in [Source::File, Source::Database] {
                let ctx = TaskContext::new(&env, "steps", &all);
                let back: Dataset<Step> = load(&descriptor, &ctx, source).unwrap();
                prop_assert!(back.equivalent(&data), "{source:?}");

                let ctx = TaskContext::new(&env, "steps", &some);
                let back: Dataset<Step> = load(&descriptor, &ctx, source).unwrap();
                prop_assert!(back.equivalent(&data.clone().filter_stations(&some)), "{source:?}");
            }
        }
    }

    #[test]
    fn test_missing_source_and_stations() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let env = Environment::new(root, root)
            .with_task("rows", TaskConfig { to_csv: Some(true), ..Default::default() })
            .unwrap();
        let descriptor = TaskDescriptor::new("rows");
        let wanted = stations(&["Z"]);
        let ctx = TaskContext::new(&env, "rows", &wanted);

        let err = load::<Row>(&descriptor, &ctx, Source::File).unwrap_err();
        assert!(matches!(err, MaterializeError::MissingDataSource { .. }));
        let err = load::<Row>(&descriptor, &ctx, Source::Database).unwrap_err();
        assert!(matches!(err, MaterializeError::MissingDataSource { .. }));

        persist(&descriptor, &env, &rows()).unwrap();
        let err = load::<Row>(&descriptor, &ctx, Source::File).unwrap_err();
        assert!(matches!(err, MaterializeError::MissingStations { requested: 1, .. }));

        let lenient = TaskDescriptor::new("rows").allow_empty();
        assert!(load::<Row>(&lenient, &ctx, Source::File).unwrap().is_empty());
    }
}
