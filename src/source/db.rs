//! Relational store of task results, backed by SQLite.

use camino::Utf8Path;
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{Connection, OptionalExtension, ToSql, params_from_iter};

use crate::data::{Dataset, Record, SqlType, Value};
use crate::error::MaterializeError;

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Int(v) => ToSqlOutput::Owned(SqlValue::Integer(*v)),
            Value::Real(v) => ToSqlOutput::Owned(SqlValue::Real(*v)),
            Value::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            Value::Bool(v) => ToSqlOutput::Owned(SqlValue::Integer(*v as i64)),
        })
    }
}

fn from_sql(kind: SqlType, value: ValueRef<'_>) -> Value {
    match (kind, value) {
        (_, ValueRef::Null) => Value::Null,
        (SqlType::Boolean, ValueRef::Integer(v)) => Value::Bool(v != 0),
        (SqlType::Real, ValueRef::Integer(v)) => Value::Real(v as f64),
        (_, ValueRef::Integer(v)) => Value::Int(v),
        (_, ValueRef::Real(v)) => Value::Real(v),
        (_, ValueRef::Text(v)) | (_, ValueRef::Blob(v)) => {
            Value::Text(String::from_utf8_lossy(v).into_owned())
        }
    }
}

pub fn open(path: &Utf8Path) -> Result<Connection, MaterializeError> {
    Ok(Connection::open(path)?)
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool, MaterializeError> {
    let found = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Reads a whole table. The caller checks [`table_exists`] first.
pub fn read_table<R: Record>(conn: &Connection, table: &str) -> Result<Dataset<R>, MaterializeError> {
    let columns: Vec<String> = R::COLUMNS
        .iter()
        .map(|(name, _)| format!("\"{name}\""))
        .collect();
    let sql = format!("SELECT {} FROM \"{table}\"", columns.join(", "));

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();

    while let Some(row) = rows.next()? {
        let mut cells = Vec::with_capacity(R::COLUMNS.len());
        for (i, (_, kind)) in R::COLUMNS.iter().enumerate() {
            cells.push(from_sql(*kind, row.get_ref(i)?));
        }
        out.push(R::from_row(&cells)?);
    }

    Ok(Dataset::new(out))
}

/// Replaces the table with the given rows inside one transaction.
pub fn write_table<R: Record>(
    conn: &mut Connection,
    table: &str,
    data: &Dataset<R>,
) -> Result<(), MaterializeError> {
    let columns: Vec<String> = R::COLUMNS
        .iter()
        .map(|(name, kind)| format!("\"{name}\" {}", kind.ddl()))
        .collect();
    let placeholders: Vec<String> = (1..=R::COLUMNS.len()).map(|i| format!("?{i}")).collect();

    let tx = conn.transaction()?;
    tx.execute(&format!("DROP TABLE IF EXISTS \"{table}\""), [])?;
    tx.execute(
        &format!(
            "CREATE TABLE \"{table}\" ({}, PRIMARY KEY ({}))",
            columns.join(", "),
            R::INDEX.join(", ")
        ),
        [],
    )?;

    {
        let mut insert = tx.prepare(&format!(
            "INSERT INTO \"{table}\" VALUES ({})",
            placeholders.join(", ")
        ))?;
        for row in data {
            insert.execute(params_from_iter(row.to_row()))?;
        }
    }

    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::record! {
        struct Row {
            index: [id, month],
            station: id,
            id: String => SqlType::Char(11),
            month: u32 => SqlType::SmallInt,
            value: f64 => SqlType::Real,
            wet: Option<bool> => SqlType::Boolean,
        }
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("params.sqlite");
        let mut conn = open(&path).unwrap();

        let data = Dataset::new(vec![
            Row { id: "A".into(), month: 1, value: 1.0 / 3.0, wet: Some(true) },
            Row { id: "A".into(), month: 2, value: f64::NAN, wet: None },
            Row { id: "B".into(), month: 1, value: 2.0, wet: Some(false) },
        ]);

        assert!(!table_exists(&conn, "rows").unwrap());
        write_table(&mut conn, "rows", &data).unwrap();
        assert!(table_exists(&conn, "rows").unwrap());

        let back: Dataset<Row> = read_table(&conn, "rows").unwrap();
        assert!(data.equivalent(&back));

        // replacing drops the previous content
        let subset = Dataset::new(data.rows()[..1].to_vec());
        write_table(&mut conn, "rows", &subset).unwrap();
        assert_eq!(read_table::<Row>(&conn, "rows").unwrap().len(), 1);
    }
}
