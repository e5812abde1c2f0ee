//! Readers for the extracted EECRA synoptic cloud reports.
//!
//! Reports live in one CSV file per station (`eecra/stations/<station_id>.csv`)
//! with at least the columns `year, month, day, hour, station_id, ww, N, AT,
//! WS`. Header names are matched case-insensitively. The optional
//! `eecra_ghcn_map.csv` relates GHCN ids (`id`) to EECRA stations
//! (`station_id`).

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};

use crate::data::SqlType;
use crate::error::{DataError, MaterializeError};

crate::record! {
    /// One synoptic report.
    pub struct HourlyCloud {
        index: [id, year, month, day, hour],
        station: id,
        pub id: String => SqlType::Text,
        pub station_id: i64 => SqlType::Integer,
        pub year: i32 => SqlType::SmallInt,
        pub month: u32 => SqlType::SmallInt,
        pub day: u32 => SqlType::SmallInt,
        pub hour: u32 => SqlType::SmallInt,
        /// Present weather code.
        pub ww: f64 => SqlType::Real,
        /// Total cloud cover in octas.
        pub n: f64 => SqlType::Real,
        /// Air temperature in degrees C.
        pub at: f64 => SqlType::Real,
        /// Wind speed in m/s.
        pub ws: f64 => SqlType::Real,
    }
}

pub fn station_file(data_dir: &Utf8Path, station_id: &str) -> Utf8PathBuf {
    data_dir.join("eecra").join("stations").join(format!("{station_id}.csv"))
}

fn open(path: &Utf8Path, task: &str) -> Result<csv::Reader<std::fs::File>, MaterializeError> {
    if !path.is_file() {
        return Err(MaterializeError::MissingDataSource {
            task: task.to_string(),
            location: path.to_string(),
        });
    }
    Ok(csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)?)
}

fn positions<const N: usize>(
    headers: &csv::StringRecord,
    names: [&'static str; N],
) -> Result<[usize; N], DataError> {
    let mut out = [0; N];
    for (slot, name) in out.iter_mut().zip(names) {
        *slot = headers
            .iter()
            .position(|header| header.eq_ignore_ascii_case(name))
            .ok_or(DataError::MissingColumn(name))?;
    }
    Ok(out)
}

fn real(record: &csv::StringRecord, at: usize, column: &'static str) -> Result<f64, DataError> {
    match SqlType::Real.parse(column, record.get(at).unwrap_or(""))? {
        crate::data::Value::Real(v) => Ok(v),
        _ => Ok(f64::NAN),
    }
}

fn int<T: TryFrom<i64>>(record: &csv::StringRecord, at: usize, column: &'static str) -> Result<T, DataError> {
    let invalid = || DataError::Cell {
        column,
        reason: format!("'{}' is not a valid integer", record.get(at).unwrap_or("")),
    };
    match SqlType::Integer.parse(column, record.get(at).unwrap_or(""))? {
        crate::data::Value::Int(v) => T::try_from(v).map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

/// Reads a station file. Rows get `id` as their station, or their own
/// `station_id` when `id` is `None`.
pub fn read_station(path: &Utf8Path, id: Option<&str>) -> Result<Vec<HourlyCloud>, MaterializeError> {
    let mut reader = open(path, "hourly_cloud")?;
    let [year, month, day, hour, station_id, ww, n, at, ws] = positions(
        reader.headers()?,
        ["year", "month", "day", "hour", "station_id", "ww", "N", "AT", "WS"],
    )?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let station: i64 = int(&record, station_id, "station_id")?;
        rows.push(HourlyCloud {
            id: id.map_or_else(|| station.to_string(), str::to_string),
            station_id: station,
            year: int(&record, year, "year")?,
            month: int(&record, month, "month")?,
            day: int(&record, day, "day")?,
            hour: int(&record, hour, "hour")?,
            ww: real(&record, ww, "ww")?,
            n: real(&record, n, "N")?,
            at: real(&record, at, "AT")?,
            ws: real(&record, ws, "WS")?,
        });
    }

    Ok(rows)
}

/// Reads the GHCN id to EECRA station mapping. Ids without a station are
/// skipped.
pub fn read_ghcn_map(data_dir: &Utf8Path) -> Result<BTreeMap<String, i64>, MaterializeError> {
    let path = data_dir.join("eecra_ghcn_map.csv");
    let mut reader = open(&path, "hourly_cloud")?;
    let [id, station_id] = positions(reader.headers()?, ["id", "station_id"])?;

    let mut map = BTreeMap::new();
    for record in reader.records() {
        let record = record?;
        let key = record.get(id).unwrap_or("").to_string();
        let station = real(&record, station_id, "station_id")?;
        if !key.is_empty() && station.is_finite() {
            map.insert(key, station as i64);
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_station_and_map() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();

        let path = station_file(root, "10010");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            "year,month,day,hour,station_id,IB,ww,N,AT,WS\n\
             1990,1,1,0,10010,0,61,8,-1.5,3.0\n\
             1990,1,1,6,10010,0,,4,,2.0\n",
        )
        .unwrap();
        std::fs::write(
            root.join("eecra_ghcn_map.csv"),
            "id,station_id\nNOR00000001,10010\nNOR00000002,\n",
        )
        .unwrap();

        let rows = read_station(&path, Some("NOR00000001")).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "NOR00000001");
        assert_eq!(rows[0].ww, 61.0);
        assert!(rows[1].ww.is_nan());
        assert!(rows[1].at.is_nan());

        let rows = read_station(&path, None).unwrap();
        assert_eq!(rows[1].id, "10010");

        let map = read_ghcn_map(root).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["NOR00000001"], 10010);
    }

    #[test]
    fn test_missing_station_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let err = read_station(&station_file(root, "1"), None).unwrap_err();
        assert!(matches!(err, MaterializeError::MissingDataSource { .. }));
    }
}
