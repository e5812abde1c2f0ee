use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::{self, Display};

use crate::error::DataError;

/// A single dynamically typed cell, as read from or written to a store.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
    Bool(bool),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Real(_) => 3,
            Value::Text(_) => 4,
        }
    }

    /// Total order used for index keys. Reals compare with `total_cmp`.
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Real(a), Value::Real(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }

    /// Equality where two missing reals are the same value.
    pub fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Real(a), Value::Real(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::Null, Value::Real(x)) | (Value::Real(x), Value::Null) => x.is_nan(),
            (a, b) => a == b,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Int(v) => write!(f, "{v}"),
            Value::Real(v) if v.is_nan() => Ok(()),
            Value::Real(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
            Value::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// Column types as declared in the relational store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Real,
    Integer,
    SmallInt,
    BigInt,
    Char(u8),
    Text,
    Boolean,
}

impl SqlType {
    pub fn ddl(&self) -> String {
        match self {
            SqlType::Real => "REAL".into(),
            SqlType::Integer => "INTEGER".into(),
            SqlType::SmallInt => "SMALLINT".into(),
            SqlType::BigInt => "BIGINT".into(),
            SqlType::Char(n) => format!("CHAR({n})"),
            SqlType::Text => "TEXT".into(),
            SqlType::Boolean => "BOOLEAN".into(),
        }
    }

    /// Parses a raw text cell. An empty cell is always [`Value::Null`].
    pub fn parse(&self, column: &'static str, raw: &str) -> Result<Value, DataError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Value::Null);
        }

        let invalid = |what: &str| DataError::Cell {
            column,
            reason: format!("'{raw}' is not a valid {what}"),
        };

        match self {
            SqlType::Real => match raw {
                "nan" | "NaN" | "NA" => Ok(Value::Null),
                _ => raw.parse().map(Value::Real).map_err(|_| invalid("real")),
            },
            SqlType::Integer | SqlType::SmallInt | SqlType::BigInt => raw
                .parse::<i64>()
                .map(Value::Int)
                .or_else(|_| match raw.parse::<f64>() {
                    Ok(v) if v.fract() == 0.0 => Ok(Value::Int(v as i64)),
                    Ok(v) if v.is_nan() => Ok(Value::Null),
                    _ => Err(invalid("integer")),
                }),
            SqlType::Char(_) | SqlType::Text => Ok(Value::Text(raw.to_string())),
            SqlType::Boolean => match raw {
                "true" | "True" | "TRUE" | "1" | "t" => Ok(Value::Bool(true)),
                "false" | "False" | "FALSE" | "0" | "f" => Ok(Value::Bool(false)),
                _ => Err(invalid("boolean")),
            },
        }
    }
}

/// A field type that can be stored in a record column.
pub trait Cell: Sized {
    fn to_value(&self) -> Value;
    fn from_value(column: &'static str, value: Option<&Value>) -> Result<Self, DataError>;
}

fn unexpected(column: &'static str, value: Option<&Value>, wanted: &str) -> DataError {
    match value {
        None => DataError::MissingColumn(column),
        Some(value) => DataError::Cell {
            column,
            reason: format!("expected {wanted}, found {value:?}"),
        },
    }
}

impl Cell for f64 {
    fn to_value(&self) -> Value {
        if self.is_nan() {
            Value::Null
        } else {
            Value::Real(*self)
        }
    }

    fn from_value(column: &'static str, value: Option<&Value>) -> Result<Self, DataError> {
        match value {
            Some(Value::Null) => Ok(f64::NAN),
            Some(Value::Real(v)) => Ok(*v),
            Some(Value::Int(v)) => Ok(*v as f64),
            other => Err(unexpected(column, other, "a real")),
        }
    }
}

impl Cell for i64 {
    fn to_value(&self) -> Value {
        Value::Int(*self)
    }

    fn from_value(column: &'static str, value: Option<&Value>) -> Result<Self, DataError> {
        match value {
            Some(Value::Int(v)) => Ok(*v),
            Some(Value::Real(v)) if v.fract() == 0.0 => Ok(*v as i64),
            Some(Value::Bool(v)) => Ok(*v as i64),
            other => Err(unexpected(column, other, "an integer")),
        }
    }
}

macro_rules! impl_cell_int {
    ($($ty:ty),*) => {
        $(
            impl Cell for $ty {
                fn to_value(&self) -> Value {
                    Value::Int(*self as i64)
                }

                fn from_value(column: &'static str, value: Option<&Value>) -> Result<Self, DataError> {
                    let wide = i64::from_value(column, value)?;
                    <$ty>::try_from(wide).map_err(|_| DataError::Cell {
                        column,
                        reason: format!("{wide} is out of range"),
                    })
                }
            }
        )*
    };
}

impl_cell_int!(i32, u32);

impl Cell for bool {
    fn to_value(&self) -> Value {
        Value::Bool(*self)
    }

    fn from_value(column: &'static str, value: Option<&Value>) -> Result<Self, DataError> {
        match value {
            Some(Value::Bool(v)) => Ok(*v),
            Some(Value::Int(v)) => Ok(*v != 0),
            other => Err(unexpected(column, other, "a boolean")),
        }
    }
}

impl Cell for Option<bool> {
    fn to_value(&self) -> Value {
        self.map(Value::Bool).unwrap_or(Value::Null)
    }

    fn from_value(column: &'static str, value: Option<&Value>) -> Result<Self, DataError> {
        match value {
            Some(Value::Null) => Ok(None),
            other => bool::from_value(column, other).map(Some),
        }
    }
}

impl Cell for String {
    fn to_value(&self) -> Value {
        Value::Text(self.clone())
    }

    fn from_value(column: &'static str, value: Option<&Value>) -> Result<Self, DataError> {
        match value {
            Some(Value::Text(v)) => Ok(v.clone()),
            Some(Value::Null) => Ok(String::new()),
            Some(other) => Ok(other.to_string()),
            None => Err(DataError::MissingColumn(column)),
        }
    }
}

/// Ordered index key of a record, e.g. `(id, year, month, day)`.
#[derive(Debug, Clone)]
pub struct RowKey(pub Vec<Value>);

impl PartialEq for RowKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RowKey {}

impl PartialOrd for RowKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RowKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(&other.0) {
            match a.total_cmp(b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

impl Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(Value::to_string).collect();
        write!(f, "({})", parts.join(", "))
    }
}

/// A typed row of a task result.
///
/// Implementations are normally generated with [`record!`](crate::record),
/// which keeps the column list, the index and the station field in one place.
pub trait Record: Clone + Send + Sync + 'static {
    /// Column names with their store types, in storage order.
    const COLUMNS: &'static [(&'static str, SqlType)];
    /// Names of the columns forming the row key.
    const INDEX: &'static [&'static str];

    /// The station this row belongs to, if rows are per station.
    fn station(&self) -> Option<&str>;
    fn key(&self) -> RowKey;
    fn to_row(&self) -> Vec<Value>;
    /// Builds the record from cells given in [`Record::COLUMNS`] order.
    fn from_row(row: &[Value]) -> Result<Self, DataError>;
}

/// Declares a plain struct together with its [`Record`] implementation.
///
/// ```ignore
/// record! {
///     pub struct MonthMean {
///         index: [id, month],
///         station: id,
///         pub id: String => SqlType::Char(11),
///         pub month: u32 => SqlType::SmallInt,
///         pub tmin: f64 => SqlType::Real,
///     }
/// }
/// ```
///
/// Use `station: none` for rows that are not tied to a station.
#[macro_export]
macro_rules! record {
    (@station $self:ident none) => {
        None
    };
    (@station $self:ident $field:ident) => {
        Some($self.$field.as_str())
    };
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            index: [$($key:ident),* $(,)?],
            station: $station:ident,
            $( $(#[$fmeta:meta])* $fvis:vis $field:ident : $ty:ty => $sql:expr ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        $vis struct $name {
            $( $(#[$fmeta])* $fvis $field: $ty, )*
        }

        impl $crate::data::Record for $name {
            const COLUMNS: &'static [(&'static str, $crate::data::SqlType)] =
                &[$((stringify!($field), $sql)),*];
            const INDEX: &'static [&'static str] = &[$(stringify!($key)),*];

            fn station(&self) -> Option<&str> {
                $crate::record!(@station self $station)
            }

            fn key(&self) -> $crate::data::RowKey {
                $crate::data::RowKey(vec![$($crate::data::Cell::to_value(&self.$key)),*])
            }

            fn to_row(&self) -> Vec<$crate::data::Value> {
                vec![$($crate::data::Cell::to_value(&self.$field)),*]
            }

            fn from_row(
                row: &[$crate::data::Value],
            ) -> Result<Self, $crate::DataError> {
                let mut cells = row.iter();
                Ok(Self {
                    $( $field: $crate::data::Cell::from_value(stringify!($field), cells.next())?, )*
                })
            }
        }
    };
}

/// The output of one task: an ordered collection of typed rows.
#[derive(Debug, Clone)]
pub struct Dataset<R> {
    rows: Vec<R>,
}

impl<R> Default for Dataset<R> {
    fn default() -> Self {
        Self { rows: Vec::new() }
    }
}

impl<R> FromIterator<R> for Dataset<R> {
    fn from_iter<I: IntoIterator<Item = R>>(iter: I) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}

impl<R: Record> Dataset<R> {
    pub fn new(rows: Vec<R>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[R] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<R> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, R> {
        self.rows.iter()
    }

    /// Rows ordered by their index key.
    pub fn sorted(mut self) -> Self {
        self.rows.sort_by_key(|row| row.key());
        self
    }

    /// Keeps rows of the given stations. Rows without a station are kept.
    pub fn filter_stations(self, stations: &[String]) -> Self {
        let wanted: HashSet<&str> = stations.iter().map(String::as_str).collect();
        let rows = self
            .rows
            .into_iter()
            .filter(|row| row.station().is_none_or(|id| wanted.contains(id)))
            .collect();
        Self { rows }
    }

    /// Concatenates partial results in the given order.
    ///
    /// # Panics
    /// If two parts contain a row with the same index key. Chunks own
    /// disjoint station sets, so a duplicate means the partitioning is broken.
    pub fn concat(parts: impl IntoIterator<Item = Self>) -> Self {
        let mut seen = BTreeSet::new();
        let mut rows = Vec::new();

        for part in parts {
            let mut local = BTreeSet::new();
            for row in part.rows {
                let key = row.key();
                if seen.contains(&key) {
                    panic!("Duplicate row {key} while merging partial results");
                }
                local.insert(key);
                rows.push(row);
            }
            seen.extend(local);
        }

        Self { rows }
    }

    pub fn group_by<K, F>(&self, f: F) -> BTreeMap<K, Vec<&R>>
    where
        K: Ord,
        F: Fn(&R) -> K,
    {
        let mut groups: BTreeMap<K, Vec<&R>> = BTreeMap::new();
        for row in &self.rows {
            groups.entry(f(row)).or_default().push(row);
        }
        groups
    }

    /// Same rows with the same values regardless of order, NaN equal to NaN.
    pub fn equivalent(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }

        let mut a: Vec<_> = self.rows.iter().collect();
        let mut b: Vec<_> = other.rows.iter().collect();
        a.sort_by_key(|row| row.key());
        b.sort_by_key(|row| row.key());

        a.iter().zip(&b).all(|(x, y)| {
            x.to_row()
                .iter()
                .zip(y.to_row().iter())
                .all(|(u, v)| u.same(v))
        })
    }
}

impl<'a, R> IntoIterator for &'a Dataset<R> {
    type Item = &'a R;
    type IntoIter = std::slice::Iter<'a, R>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::record! {
        struct Obs {
            index: [id, day],
            station: id,
            id: String => SqlType::Text,
            day: u32 => SqlType::SmallInt,
            prcp: f64 => SqlType::Real,
            wet: Option<bool> => SqlType::Boolean,
        }
    }

    fn obs(id: &str, day: u32, prcp: f64) -> Obs {
        Obs {
            id: id.into(),
            day,
            prcp,
            wet: (!prcp.is_nan()).then_some(prcp > 0.0),
        }
    }

    #[test]
    fn test_record_row_conversion() {
        let row = obs("ST1", 3, f64::NAN);
        let cells = row.to_row();
        assert_eq!(cells[2], Value::Null);
        assert_eq!(cells[3], Value::Null);

        let back = Obs::from_row(&cells).unwrap();
        assert!(back.prcp.is_nan());
        assert_eq!(back.wet, None);
        assert_eq!(Obs::INDEX, &["id", "day"]);
        assert_eq!(back.station(), Some("ST1"));
    }

    #[test]
    fn test_from_row_reports_column() {
        let cells = vec![Value::Text("ST1".into()), Value::Text("x".into())];
        let err = Obs::from_row(&cells).unwrap_err();
        assert!(matches!(err, DataError::Cell { column: "day", .. }));

        let err = Obs::from_row(&cells[..1]).unwrap_err();
        assert_eq!(err, DataError::MissingColumn("day"));
    }

    #[test]
    fn test_parse_cells() {
        assert_eq!(SqlType::Real.parse("x", "").unwrap(), Value::Null);
        assert_eq!(SqlType::Integer.parse("x", "4.0").unwrap(), Value::Int(4));
        assert_eq!(SqlType::Boolean.parse("x", "True").unwrap(), Value::Bool(true));
        assert!(SqlType::Integer.parse("x", "4.5").is_err());
    }

    #[test]
    fn test_concat_keeps_order() {
        let a = Dataset::new(vec![obs("A", 1, 0.0), obs("A", 2, 1.0)]);
        let b = Dataset::new(vec![obs("B", 1, 0.5)]);
        let merged = Dataset::concat([a, b]);

        let ids: Vec<_> = merged.iter().map(|r| (r.id.as_str(), r.day)).collect();
        assert_eq!(ids, vec![("A", 1), ("A", 2), ("B", 1)]);
    }

    #[test]
    #[should_panic(expected = "Duplicate row")]
    fn test_concat_rejects_duplicates() {
        let a = Dataset::new(vec![obs("A", 1, 0.0)]);
        let b = Dataset::new(vec![obs("A", 1, 2.0)]);
        Dataset::concat([a, b]);
    }

    #[test]
    fn test_filter_and_equivalent() {
        let data = Dataset::new(vec![obs("A", 1, f64::NAN), obs("B", 1, 1.0)]);
        let only_a = data.clone().filter_stations(&["A".to_string()]);
        assert_eq!(only_a.len(), 1);

        let shuffled = Dataset::new(vec![obs("B", 1, 1.0), obs("A", 1, f64::NAN)]);
        assert!(data.equivalent(&shuffled));
        assert!(!data.equivalent(&only_a));
    }
}
