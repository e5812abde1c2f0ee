//! The parameterization tasks of the weather generator.
//!
//! Task names and their prerequisites:
//!
//! ```text
//! day ─┬─ month ─┬─ cmonth
//!      │         └─ yearly_cmonth
//!      ├─ cday ─────┬─ prcp, markov, temp
//!      └─ yearly_cday   └───────────────────┐
//! hourly_cloud ─ daily_cloud ─ monthly_cloud ─ ... ─ yearly_cdaily_cloud ─ corr
//! ```

pub mod cloud;
pub mod corr;
pub mod ghcn;
pub mod markov;
pub mod prcp;
pub mod temp;

use chrono::{Datelike, NaiveDate};
use serde_json::{Value, json};

use crate::registry::Registry;
use crate::stats::Regression;

/// Number of days in `month` of `year`, 0 for an invalid month.
pub(crate) fn days_in_month(year: i32, month: u32) -> u32 {
    let Some(first) = NaiveDate::from_ymd_opt(year, month, 1) else {
        return 0;
    };
    let next = match month {
        12 => NaiveDate::from_ymd_opt(year + 1, 1, 1),
        _ => NaiveDate::from_ymd_opt(year, month + 1, 1),
    };
    next.map_or(0, |next| (next - first).num_days() as u32)
}

/// Day of the year continuous over years, for detecting consecutive days.
pub(crate) fn day_number(year: i32, month: u32, day: u32) -> Option<i32> {
    NaiveDate::from_ymd_opt(year, month, day).map(|date| date.num_days_from_ce())
}

pub(crate) fn round4(value: f64) -> f64 {
    (value * 1e4).round() / 1e4
}

pub(crate) fn regression_info(fit: &Regression) -> Value {
    json!({
        "rsquared": fit.rsquared,
        "slope": fit.slope,
        "intercept": fit.intercept,
    })
}

/// All tasks of the crate, registered in dependency friendly order.
pub fn standard_registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register(ghcn::Day)
        .register(ghcn::Month)
        .register(ghcn::CompleteMonth)
        .register(ghcn::YearlyCompleteMonth)
        .register(ghcn::CompleteDay)
        .register(ghcn::YearlyCompleteDay)
        .register(prcp::PrcpDistribution)
        .register(markov::MarkovChain)
        .register(temp::Temperature)
        .register(cloud::Hourly)
        .register(cloud::Daily)
        .register(cloud::Monthly)
        .register(cloud::CompleteMonthly)
        .register(cloud::YearlyCompleteMonthly)
        .register(cloud::CompleteDaily)
        .register(cloud::YearlyCompleteDaily)
        .register(cloud::Cloud)
        .register_pooled(corr::CrossCorrelation);
    registry
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;

    use camino::Utf8Path;
    use chrono::{Datelike, NaiveDate};

    use crate::source::ghcn::GhcnDay;
    use crate::source::ghcn::testing::dly_line;

    /// Every calendar day of `years` years starting at `start_year`, with
    /// `prcp(date, index)` as precipitation, tmin 0 and tmax 10.
    pub(crate) fn synthetic_days(
        id: &str,
        start_year: i32,
        years: i32,
        prcp: impl Fn(NaiveDate, usize) -> f64,
    ) -> Vec<GhcnDay> {
        let Some(first) = NaiveDate::from_ymd_opt(start_year, 1, 1) else {
            return Vec::new();
        };
        first
            .iter_days()
            .take_while(|date| date.year() < start_year + years)
            .enumerate()
            .map(|(i, date)| GhcnDay {
                id: id.to_string(),
                year: date.year(),
                month: date.month(),
                day: date.day(),
                prcp: prcp(date, i),
                prcp_m: String::new(),
                prcp_q: String::new(),
                prcp_s: String::new(),
                tmax: 10.0,
                tmax_m: String::new(),
                tmax_q: String::new(),
                tmax_s: String::new(),
                tmin: 0.0,
                tmin_m: String::new(),
                tmin_q: String::new(),
                tmin_s: String::new(),
            })
            .collect()
    }

    fn tenths(value: f64) -> Option<i32> {
        (!value.is_nan()).then(|| (value * 10.0).round() as i32)
    }

    /// Writes `<dir>/<id>.dly` for the days of one station.
    pub(crate) fn write_dly(dir: &Utf8Path, days: &[GhcnDay]) {
        let Some(id) = days.first().map(|d| d.id.clone()) else {
            return;
        };
        let mut months: BTreeMap<(i32, u32), Vec<&GhcnDay>> = BTreeMap::new();
        for d in days {
            months.entry((d.year, d.month)).or_default().push(d);
        }

        let mut lines = Vec::new();
        for ((year, month), days) in months {
            for element in ["PRCP", "TMAX", "TMIN"] {
                let mut values = vec![None; 31];
                for d in &days {
                    let value = match element {
                        "PRCP" => d.prcp,
                        "TMAX" => d.tmax,
                        _ => d.tmin,
                    };
                    values[d.day as usize - 1] = tenths(value);
                }
                lines.push(dly_line(&id, year, month, element, &values));
            }
        }

        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(format!("{id}.dly")), lines.join("\n")).unwrap();
    }
}
