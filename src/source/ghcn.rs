//! Reader for GHCN-Daily station files (`<id>.dly`).
//!
//! Each line holds one month of one element: the station id, year, month and
//! element name, followed by 31 day slots of a 5 character value and three
//! single character flags. Values are in tenths of mm or tenths of degrees C,
//! `-9999` marks a missing day.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};

use camino::Utf8Path;
use chrono::NaiveDate;

use crate::data::SqlType;
use crate::error::{DataError, MaterializeError};

crate::record! {
    /// Daily precipitation and temperature extremes of one station.
    pub struct GhcnDay {
        index: [id, year, month, day],
        station: id,
        pub id: String => SqlType::Char(11),
        pub year: i32 => SqlType::SmallInt,
        pub month: u32 => SqlType::SmallInt,
        pub day: u32 => SqlType::SmallInt,
        pub prcp: f64 => SqlType::Real,
        pub prcp_m: String => SqlType::Char(1),
        pub prcp_q: String => SqlType::Char(1),
        pub prcp_s: String => SqlType::Char(1),
        pub tmax: f64 => SqlType::Real,
        pub tmax_m: String => SqlType::Char(1),
        pub tmax_q: String => SqlType::Char(1),
        pub tmax_s: String => SqlType::Char(1),
        pub tmin: f64 => SqlType::Real,
        pub tmin_m: String => SqlType::Char(1),
        pub tmin_q: String => SqlType::Char(1),
        pub tmin_s: String => SqlType::Char(1),
    }
}

impl GhcnDay {
    fn empty(id: &str, year: i32, month: u32, day: u32) -> Self {
        Self {
            id: id.to_string(),
            year,
            month,
            day,
            prcp: f64::NAN,
            prcp_m: String::new(),
            prcp_q: String::new(),
            prcp_s: String::new(),
            tmax: f64::NAN,
            tmax_m: String::new(),
            tmax_q: String::new(),
            tmax_s: String::new(),
            tmin: f64::NAN,
            tmin_m: String::new(),
            tmin_q: String::new(),
            tmin_s: String::new(),
        }
    }

    fn slot(&mut self, element: Element) -> (&mut f64, [&mut String; 3]) {
        match element {
            Element::Prcp => (
                &mut self.prcp,
                [&mut self.prcp_m, &mut self.prcp_q, &mut self.prcp_s],
            ),
            Element::Tmax => (
                &mut self.tmax,
                [&mut self.tmax_m, &mut self.tmax_q, &mut self.tmax_s],
            ),
            Element::Tmin => (
                &mut self.tmin,
                [&mut self.tmin_m, &mut self.tmin_q, &mut self.tmin_s],
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Element {
    Prcp,
    Tmax,
    Tmin,
}

const MISSING: i32 = -9999;

fn field<'a>(line: &'a str, from: usize, to: usize, column: &'static str) -> Result<&'a str, DataError> {
    line.get(from..to).ok_or_else(|| DataError::Cell {
        column,
        reason: format!("line of {} bytes is too short", line.len()),
    })
}

fn number<T: std::str::FromStr>(raw: &str, column: &'static str) -> Result<T, DataError> {
    raw.trim().parse().map_err(|_| DataError::Cell {
        column,
        reason: format!("'{raw}' is not a number"),
    })
}

/// Parses the lines of one station file. Days where none of the three
/// elements has a value are dropped, as are slots past the end of the month.
pub fn parse_dly(reader: impl BufRead) -> Result<Vec<GhcnDay>, MaterializeError> {
    let mut days: BTreeMap<(String, i32, u32, u32), GhcnDay> = BTreeMap::new();

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let element = match field(&line, 17, 21, "element")? {
            "PRCP" => Element::Prcp,
            "TMAX" => Element::Tmax,
            "TMIN" => Element::Tmin,
            _ => continue,
        };
        let id = field(&line, 0, 11, "id")?.trim();
        let year: i32 = number(field(&line, 11, 15, "year")?, "year")?;
        let month: u32 = number(field(&line, 15, 17, "month")?, "month")?;

        for day in 1..=31u32 {
            let start = 21 + 8 * (day as usize - 1);
            let Some(raw) = line.get(start..start + 5) else {
                break;
            };
            let value: i32 = number(raw, "value")?;
            if value == MISSING || NaiveDate::from_ymd_opt(year, month, day).is_none() {
                continue;
            }

            let row = days
                .entry((id.to_string(), year, month, day))
                .or_insert_with(|| GhcnDay::empty(id, year, month, day));
            let (target, flags) = row.slot(element);
            *target = value as f64 / 10.0;
            for (i, flag) in flags.into_iter().enumerate() {
                *flag = line
                    .get(start + 5 + i..start + 6 + i)
                    .unwrap_or("")
                    .trim()
                    .to_string();
            }
        }
    }

    Ok(days.into_values().collect())
}

/// Reads `<dir>/<station>.dly`.
pub fn read_station(dir: &Utf8Path, station: &str) -> Result<Vec<GhcnDay>, MaterializeError> {
    let path = dir.join(format!("{station}.dly"));
    let file = File::open(&path).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => MaterializeError::MissingDataSource {
            task: "day".into(),
            location: path.to_string(),
        },
        _ => err.into(),
    })?;
    parse_dly(BufReader::new(file))
}

#[cfg(test)]
pub(crate) mod testing {
    /// Formats one `.dly` line. `values` are in tenths, `None` is missing.
    pub(crate) fn dly_line(id: &str, year: i32, month: u32, element: &str, values: &[Option<i32>]) -> String {
        let mut line = format!("{id:<11}{year:04}{month:02}{element}");
        for day in 0..31 {
            match values.get(day).copied().flatten() {
                Some(v) => line.push_str(&format!("{v:>5}  S")),
                None => line.push_str("-9999   "),
            }
        }
        line
    }
}
