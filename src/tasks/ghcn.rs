//! Daily GHCN records and the monthly summaries derived from them.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::{Inputs, TaskContext};
use crate::data::{Dataset, SqlType};
use crate::engine::Parameterizer;
use crate::registry::TaskDescriptor;
use crate::source::ghcn::{self, GhcnDay};
use crate::stats::nanmean;

use super::days_in_month;

crate::record! {
    /// Monthly summary of a station.
    pub struct GhcnMonth {
        index: [id, year, month],
        station: id,
        pub id: String => SqlType::Char(11),
        pub year: i32 => SqlType::SmallInt,
        pub month: u32 => SqlType::SmallInt,
        pub tmin: f64 => SqlType::Real,
        pub tmax: f64 => SqlType::Real,
        pub trange: f64 => SqlType::Real,
        pub prcp: f64 => SqlType::Real,
        pub tmin_abs: f64 => SqlType::Real,
        pub tmax_abs: f64 => SqlType::Real,
        pub prcpmax: f64 => SqlType::Real,
        pub tmin_complete: bool => SqlType::Boolean,
        pub tmax_complete: bool => SqlType::Boolean,
        pub prcp_complete: bool => SqlType::Boolean,
        /// Number of days with positive precipitation.
        pub wet_day: i64 => SqlType::Integer,
        pub tmin_complete_year: bool => SqlType::Boolean,
        pub tmax_complete_year: bool => SqlType::Boolean,
        pub prcp_complete_year: bool => SqlType::Boolean,
    }
}

impl GhcnMonth {
    pub fn complete(&self) -> bool {
        self.prcp_complete && self.tmin_complete && self.tmax_complete
    }

    pub fn complete_year(&self) -> bool {
        self.prcp_complete_year && self.tmin_complete_year && self.tmax_complete_year
    }
}

fn finite(values: impl Iterator<Item = f64>) -> Vec<f64> {
    values.filter(|v| !v.is_nan()).collect()
}

fn summarize(key: &(String, i32, u32), days: &[&GhcnDay]) -> GhcnMonth {
    let (id, year, month) = key;
    let n = days_in_month(*year, *month) as usize;

    let tmin = finite(days.iter().map(|d| d.tmin));
    let tmax = finite(days.iter().map(|d| d.tmax));
    let prcp = finite(days.iter().map(|d| d.prcp));

    GhcnMonth {
        id: id.clone(),
        year: *year,
        month: *month,
        tmin: nanmean(tmin.iter().copied()),
        tmax: nanmean(tmax.iter().copied()),
        trange: nanmean(days.iter().map(|d| d.tmax - d.tmin)),
        prcp: prcp.iter().sum(),
        tmin_abs: tmin.iter().copied().reduce(f64::min).unwrap_or(f64::NAN),
        tmax_abs: tmax.iter().copied().reduce(f64::max).unwrap_or(f64::NAN),
        prcpmax: prcp.iter().copied().reduce(f64::max).unwrap_or(f64::NAN),
        tmin_complete: tmin.len() == n,
        tmax_complete: tmax.len() == n,
        prcp_complete: prcp.len() == n,
        wet_day: prcp.iter().filter(|v| **v > 0.0).count() as i64,
        tmin_complete_year: false,
        tmax_complete_year: false,
        prcp_complete_year: false,
    }
}

/// Computes the monthly summaries including the per year completeness.
pub fn monthly_summary(days: &Dataset<GhcnDay>) -> Dataset<GhcnMonth> {
    let mut months: Vec<GhcnMonth> = days
        .group_by(|d| (d.id.clone(), d.year, d.month))
        .iter()
        .map(|(key, group)| summarize(key, group))
        .collect();

    let mut years: BTreeMap<(String, i32), [usize; 3]> = BTreeMap::new();
    for m in &months {
        let counts = years.entry((m.id.clone(), m.year)).or_default();
        counts[0] += m.tmin_complete as usize;
        counts[1] += m.tmax_complete as usize;
        counts[2] += m.prcp_complete as usize;
    }

    for m in &mut months {
        let counts = years[&(m.id.clone(), m.year)];
        m.tmin_complete_year = counts[0] == 12;
        m.tmax_complete_year = counts[1] == 12;
        m.prcp_complete_year = counts[2] == 12;
    }

    Dataset::new(months)
}

/// Days of `days` whose month is in `months`.
fn days_in(days: &Dataset<GhcnDay>, months: BTreeSet<(&str, i32, u32)>) -> Dataset<GhcnDay> {
    days.iter()
        .filter(|d| months.contains(&(d.id.as_str(), d.year, d.month)))
        .cloned()
        .collect()
}

pub struct Day;

impl Parameterizer for Day {
    type Record = GhcnDay;

    fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor::new("day")
            .summary("Read in the daily GHCN data")
            .file("ghcn_daily.csv")
            .table("ghcn_daily")
    }

    fn setup(&self, ctx: &TaskContext<'_>, _: &Inputs) -> anyhow::Result<Dataset<GhcnDay>> {
        let dir = ctx.env.data_path("ghcn/ghcnd_all");
        tracing::debug!("Reading daily data of {} stations from {dir}", ctx.stations.len());

        let mut rows = Vec::new();
        for station in ctx.stations {
            rows.extend(ghcn::read_station(&dir, station)?);
        }
        Ok(Dataset::new(rows))
    }
}

pub struct Month;

impl Parameterizer for Month {
    type Record = GhcnMonth;

    fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor::new("month")
            .summary("Calculate monthly means from the daily GHCN data")
            .requires(["day"])
            .file("ghcn_monthly.csv")
            .table("ghcn_monthly")
    }

    fn setup(&self, _: &TaskContext<'_>, inputs: &Inputs) -> anyhow::Result<Dataset<GhcnMonth>> {
        Ok(monthly_summary(inputs.get("day")?))
    }
}

pub struct CompleteMonth;

impl Parameterizer for CompleteMonth {
    type Record = GhcnMonth;

    fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor::new("cmonth")
            .summary("Extract the complete months from the monthly data")
            .requires(["month"])
            .file("complete_ghcn_monthly.csv")
            .table("complete_ghcn_monthly")
    }

    fn setup(&self, _: &TaskContext<'_>, inputs: &Inputs) -> anyhow::Result<Dataset<GhcnMonth>> {
        let months: &Dataset<GhcnMonth> = inputs.get("month")?;
        Ok(months.iter().filter(|m| m.complete()).cloned().collect())
    }
}

pub struct YearlyCompleteMonth;

impl Parameterizer for YearlyCompleteMonth {
    type Record = GhcnMonth;

    fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor::new("yearly_cmonth")
            .summary("Extract the complete months from the monthly data in complete years")
            .requires(["month"])
            .file("yearly_complete_ghcn_monthly.csv")
            .table("yearly_complete_ghcn_monthly")
    }

    fn setup(&self, _: &TaskContext<'_>, inputs: &Inputs) -> anyhow::Result<Dataset<GhcnMonth>> {
        let months: &Dataset<GhcnMonth> = inputs.get("month")?;
        Ok(months.iter().filter(|m| m.complete_year()).cloned().collect())
    }
}

pub struct CompleteDay;

impl Parameterizer for CompleteDay {
    type Record = GhcnDay;

    fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor::new("cday")
            .summary("Get the days of the complete months")
            .requires(["day", "month"])
            .file("complete_ghcn_daily.csv")
            .table("complete_ghcn_daily")
    }

    fn setup(&self, _: &TaskContext<'_>, inputs: &Inputs) -> anyhow::Result<Dataset<GhcnDay>> {
        let months: &Dataset<GhcnMonth> = inputs.get("month")?;
        let complete = months
            .iter()
            .filter(|m| m.complete())
            .map(|m| (m.id.as_str(), m.year, m.month))
            .collect();
        Ok(days_in(inputs.get("day")?, complete))
    }
}

pub struct YearlyCompleteDay;

impl Parameterizer for YearlyCompleteDay {
    type Record = GhcnDay;

    fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor::new("yearly_cday")
            .summary("Get the days of the complete months in complete years")
            .requires(["day", "month"])
            .file("yearly_complete_ghcn_daily.csv")
            .table("yearly_complete_ghcn_daily")
    }

    fn setup(&self, _: &TaskContext<'_>, inputs: &Inputs) -> anyhow::Result<Dataset<GhcnDay>> {
        let months: &Dataset<GhcnMonth> = inputs.get("month")?;
        let complete = months
            .iter()
            .filter(|m| m.complete_year())
            .map(|m| (m.id.as_str(), m.year, m.month))
            .collect();
        Ok(days_in(inputs.get("day")?, complete))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::testing::synthetic_days;

    #[test]
    fn test_monthly_summary() {
        // one full year, March misses a temperature value
        let mut days = synthetic_days("ST1", 2001, 1, |_, _| 0.0);
        for d in days.iter_mut() {
            d.prcp = if d.day % 2 == 0 { 2.0 } else { 0.0 };
            d.tmin = 1.0;
            d.tmax = 5.0;
        }
        if let Some(d) = days.iter_mut().find(|d| d.month == 3 && d.day == 7) {
            d.tmin = f64::NAN;
        }
        let months = monthly_summary(&Dataset::new(days));

        assert_eq!(months.len(), 12);
        let feb = &months.rows()[1];
        assert_eq!(feb.wet_day, 14);
        assert_eq!(feb.prcp, 28.0);
        assert_eq!(feb.trange, 4.0);
        assert_eq!((feb.tmin_abs, feb.tmax_abs, feb.prcpmax), (1.0, 5.0, 2.0));
        assert!(feb.complete());

        let march = &months.rows()[2];
        assert!(!march.tmin_complete);
        assert!(march.tmax_complete);

        assert!(months.iter().all(|m| !m.tmin_complete_year));
        assert!(months.iter().all(|m| m.tmax_complete_year && m.prcp_complete_year));
    }

    #[test]
    fn test_incomplete_month() {
        let days: Vec<GhcnDay> = synthetic_days("ST1", 2001, 1, |_, _| 1.0)
            .into_iter()
            .filter(|d| !(d.month == 4 && d.day == 30))
            .collect();
        let months = monthly_summary(&Dataset::new(days));
        let april = &months.rows()[3];
        assert!(!april.prcp_complete);
        assert!(!april.complete());
        assert!(!april.prcp_complete_year);
    }
}
