//! Delimited file cache of task results.

use std::fs;

use camino::Utf8Path;

use crate::data::{Dataset, Record, Value};
use crate::error::{DataError, MaterializeError};

/// Reads a cached task result. Columns are matched by header name, so the
/// column order of the file does not matter.
pub fn read_csv<R: Record>(path: &Utf8Path) -> Result<Dataset<R>, MaterializeError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    let positions = R::COLUMNS
        .iter()
        .map(|(name, _)| {
            headers
                .iter()
                .position(|header| header == *name)
                .ok_or(DataError::MissingColumn(*name))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let cells = R::COLUMNS
            .iter()
            .zip(&positions)
            .map(|((name, kind), &i)| kind.parse(*name, record.get(i).unwrap_or("")))
            .collect::<Result<Vec<Value>, _>>()?;
        rows.push(R::from_row(&cells)?);
    }

    Ok(Dataset::new(rows))
}

/// Rewrites the cache file with the given rows. Missing values are empty cells.
pub fn write_csv<R: Record>(path: &Utf8Path, data: &Dataset<R>) -> Result<(), MaterializeError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    let mut writer = csv::WriterBuilder::new().from_path(path)?;
    writer.write_record(R::COLUMNS.iter().map(|(name, _)| *name))?;

    for row in data {
        writer.write_record(row.to_row().iter().map(Value::to_string))?;
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SqlType;

    crate::record! {
        struct Row {
            index: [id, month],
            station: id,
            id: String => SqlType::Char(11),
            month: u32 => SqlType::SmallInt,
            value: f64 => SqlType::Real,
            complete: bool => SqlType::Boolean,
        }
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("rows.csv");

        let data = Dataset::new(vec![
            Row { id: "A".into(), month: 1, value: 0.1 + 0.2, complete: true },
            Row { id: "A".into(), month: 2, value: f64::NAN, complete: false },
            Row { id: "B".into(), month: 1, value: -1e-9, complete: true },
        ]);

        write_csv(&path, &data).unwrap();
        let back: Dataset<Row> = read_csv(&path).unwrap();

        assert!(data.equivalent(&back));
        assert_eq!(back.rows()[0].value, 0.1 + 0.2);
    }

    #[test]
    fn test_column_order_and_missing_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("rows.csv");

        fs::write(&path, "complete,value,month,id\nTrue,2.5,3,X\n").unwrap();
        let back: Dataset<Row> = read_csv(&path).unwrap();
        assert_eq!(back.rows()[0].month, 3);
        assert!(back.rows()[0].complete);

        fs::write(&path, "id,month\nX,3\n").unwrap();
        let err = read_csv::<Row>(&path).unwrap_err();
        assert!(matches!(err, MaterializeError::Data(DataError::MissingColumn("value"))));
    }
}
