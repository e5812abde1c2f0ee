//! Cloud fraction on wet and dry days from synoptic reports.
//!
//! Hourly reports are reduced to days, the days to months. Months are
//! complete when every day has a report, years when all twelve months are.
//! The `cloud` task finally relates the mean cloud fraction on wet and dry
//! days to the overall mean with two single parameter curves.

use std::collections::{BTreeMap, BTreeSet};

use camino::Utf8Path;
use serde_json::{Map, Value, json};

use crate::core::{ArgsType, Inputs, Source, TaskConfig, TaskContext};
use crate::data::{Dataset, SqlType};
use crate::emit::RunOutput;
use crate::engine::Parameterizer;
use crate::registry::TaskDescriptor;
use crate::source::eecra::{self, HourlyCloud};
use crate::stats::{CurveFit, curve_fit, nanmean, nanstd};

use super::days_in_month;

crate::record! {
    pub struct DailyCloud {
        index: [id, year, month, day],
        station: id,
        pub id: String => SqlType::Text,
        pub year: i32 => SqlType::SmallInt,
        pub month: u32 => SqlType::SmallInt,
        pub day: u32 => SqlType::SmallInt,
        /// 1 if any report of the day mentions precipitation.
        pub wet_day: i64 => SqlType::SmallInt,
        pub tmin: f64 => SqlType::Real,
        pub tmax: f64 => SqlType::Real,
        /// Mean cloud fraction between 0 and 1.
        pub mean_cloud: f64 => SqlType::Real,
        pub wind: f64 => SqlType::Real,
    }
}

crate::record! {
    pub struct MonthlyCloud {
        index: [id, year, month],
        station: id,
        pub id: String => SqlType::Text,
        pub year: i32 => SqlType::SmallInt,
        pub month: u32 => SqlType::SmallInt,
        pub wet_day: i64 => SqlType::SmallInt,
        pub mean_cloud_wet: f64 => SqlType::Real,
        pub mean_cloud_dry: f64 => SqlType::Real,
        pub mean_cloud: f64 => SqlType::Real,
        pub sd_cloud_wet: f64 => SqlType::Real,
        pub sd_cloud_dry: f64 => SqlType::Real,
        pub sd_cloud: f64 => SqlType::Real,
        pub wet_day_complete: bool => SqlType::Boolean,
        pub tmin_complete: bool => SqlType::Boolean,
        pub tmax_complete: bool => SqlType::Boolean,
        pub mean_cloud_complete: bool => SqlType::Boolean,
    }
}

impl MonthlyCloud {
    /// Complete in the variables the cloud statistics depend on.
    pub fn cloud_complete(&self) -> bool {
        self.wet_day_complete && self.mean_cloud_complete
    }

    pub fn complete(&self) -> bool {
        self.cloud_complete() && self.tmin_complete && self.tmax_complete
    }
}

crate::record! {
    /// Multi year means of the complete months of a station.
    pub struct CloudRow {
        index: [id, month],
        station: id,
        pub id: String => SqlType::Text,
        pub month: u32 => SqlType::SmallInt,
        pub wet_day: f64 => SqlType::Real,
        pub mean_cloud_wet: f64 => SqlType::Real,
        pub mean_cloud_dry: f64 => SqlType::Real,
        pub mean_cloud: f64 => SqlType::Real,
        pub sd_cloud_wet: f64 => SqlType::Real,
        pub sd_cloud_dry: f64 => SqlType::Real,
        pub sd_cloud: f64 => SqlType::Real,
    }
}

/// Present weather codes of precipitation at the station.
fn precipitating(ww: f64) -> bool {
    (50.0..=75.0).contains(&ww) || ww == 77.0 || ww == 79.0 || (80.0..=99.0).contains(&ww)
}

/// Tasks that accept raw file paths as stations can not be loaded from a
/// store, their rows are not keyed by the given stations.
fn files_source(config: &TaskConfig, default: Source) -> Source {
    match config.args_type() {
        ArgsType::Files => Source::Scratch,
        _ => config.source.unwrap_or(default),
    }
}

pub fn daily(hourly: &Dataset<HourlyCloud>) -> Dataset<DailyCloud> {
    hourly
        .group_by(|h| (h.id.clone(), h.year, h.month, h.day))
        .into_iter()
        .map(|((id, year, month, day), reports)| {
            let at = reports.iter().map(|h| h.at).filter(|v| !v.is_nan());
            DailyCloud {
                id,
                year,
                month,
                day,
                wet_day: reports.iter().any(|h| precipitating(h.ww)) as i64,
                tmin: at.clone().reduce(f64::min).unwrap_or(f64::NAN),
                tmax: at.reduce(f64::max).unwrap_or(f64::NAN),
                mean_cloud: nanmean(reports.iter().map(|h| h.n)) / 8.0,
                wind: nanmean(reports.iter().map(|h| h.ws)),
            }
        })
        .collect()
}

/// Monthly statistics of months with more than one day.
pub fn monthly(days: &Dataset<DailyCloud>) -> Dataset<MonthlyCloud> {
    days.group_by(|d| (d.id.clone(), d.year, d.month))
        .into_iter()
        .filter(|(_, days)| days.len() > 1)
        .map(|((id, year, month), days)| {
            let ndays = days_in_month(year, month) as usize;
            let observed = |f: fn(&DailyCloud) -> f64| days.iter().filter(|d| !f(d).is_nan()).count() == ndays;
            let cloud = |wet: Option<bool>| {
                days.iter()
                    .filter(move |d| wet.is_none_or(|wet| (d.wet_day != 0) == wet))
                    .map(|d| d.mean_cloud)
            };

            MonthlyCloud {
                id,
                year,
                month,
                wet_day: days.iter().map(|d| d.wet_day).sum(),
                mean_cloud_wet: nanmean(cloud(Some(true))),
                mean_cloud_dry: nanmean(cloud(Some(false))),
                mean_cloud: nanmean(cloud(None)),
                sd_cloud_wet: nanstd(cloud(Some(true)), 1),
                sd_cloud_dry: nanstd(cloud(Some(false)), 1),
                sd_cloud: nanstd(cloud(None), 1),
                wet_day_complete: days.len() == ndays,
                tmin_complete: observed(|d| d.tmin),
                tmax_complete: observed(|d| d.tmax),
                mean_cloud_complete: observed(|d| d.mean_cloud),
            }
        })
        .collect()
}

/// `(id, year)` pairs with twelve months passing `keep`.
fn complete_years<'a>(
    months: impl Iterator<Item = &'a MonthlyCloud>,
    keep: impl Fn(&MonthlyCloud) -> bool,
) -> BTreeSet<(String, i32)> {
    let mut counts: BTreeMap<(String, i32), usize> = BTreeMap::new();
    for m in months.filter(|m| keep(m)) {
        *counts.entry((m.id.clone(), m.year)).or_default() += 1;
    }
    counts
        .into_iter()
        .filter(|(_, n)| *n == 12)
        .map(|(key, _)| key)
        .collect()
}

pub struct Hourly;

impl Parameterizer for Hourly {
    type Record = HourlyCloud;

    fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor::new("hourly_cloud")
            .summary("Hourly cloud data")
            .file("hourly_cloud.csv")
            .table("hourly_cloud")
    }

    fn setup(&self, ctx: &TaskContext<'_>, _: &Inputs) -> anyhow::Result<Dataset<HourlyCloud>> {
        let data_dir = &ctx.env.data_dir;
        let mut rows = Vec::new();

        match ctx.config.args_type() {
            ArgsType::Files => {
                for path in ctx.stations {
                    rows.extend(eecra::read_station(Utf8Path::new(path), None)?);
                }
            }
            ArgsType::Eecra => {
                for station in ctx.stations {
                    rows.extend(eecra::read_station(&eecra::station_file(data_dir, station), None)?);
                }
            }
            ArgsType::Ghcn => {
                let map = eecra::read_ghcn_map(data_dir)?;
                let mapped: Vec<(&String, i64)> = ctx
                    .stations
                    .iter()
                    .filter_map(|id| map.get(id).map(|station| (id, *station)))
                    .collect();
                tracing::debug!(
                    "Using {} cloud stations in the {} given stations",
                    mapped.len(),
                    ctx.stations.len()
                );
                for (id, station) in mapped {
                    let path = eecra::station_file(data_dir, &station.to_string());
                    rows.extend(eecra::read_station(&path, Some(id))?);
                }
            }
        }

        Ok(Dataset::new(rows))
    }

    fn source(&self, config: &TaskConfig, default: Source) -> Source {
        files_source(config, default)
    }
}

pub struct Daily;

impl Parameterizer for Daily {
    type Record = DailyCloud;

    fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor::new("daily_cloud")
            .summary("Calculate the daily cloud values from hourly cloud data")
            .requires(["hourly_cloud"])
            .file("daily_cloud.csv")
            .table("daily_cloud")
    }

    fn setup(&self, _: &TaskContext<'_>, inputs: &Inputs) -> anyhow::Result<Dataset<DailyCloud>> {
        Ok(daily(inputs.get("hourly_cloud")?))
    }

    fn source(&self, config: &TaskConfig, default: Source) -> Source {
        files_source(config, default)
    }
}

pub struct Monthly;

impl Parameterizer for Monthly {
    type Record = MonthlyCloud;

    fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor::new("monthly_cloud")
            .summary("Calculate the monthly cloud values from daily cloud data")
            .requires(["daily_cloud"])
            .file("monthly_cloud.csv")
            .table("monthly_cloud")
    }

    fn setup(&self, _: &TaskContext<'_>, inputs: &Inputs) -> anyhow::Result<Dataset<MonthlyCloud>> {
        Ok(monthly(inputs.get("daily_cloud")?))
    }

    fn source(&self, config: &TaskConfig, default: Source) -> Source {
        files_source(config, default)
    }
}

pub struct CompleteMonthly;

impl Parameterizer for CompleteMonthly {
    type Record = MonthlyCloud;

    fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor::new("cmonthly_cloud")
            .summary("Extract the months with complete cloud data")
            .requires(["monthly_cloud"])
            .file("complete_monthly_cloud.csv")
            .table("complete_monthly_cloud")
    }

    fn setup(&self, _: &TaskContext<'_>, inputs: &Inputs) -> anyhow::Result<Dataset<MonthlyCloud>> {
        let months: &Dataset<MonthlyCloud> = inputs.get("monthly_cloud")?;
        Ok(months.iter().filter(|m| m.cloud_complete()).cloned().collect())
    }

    fn source(&self, config: &TaskConfig, default: Source) -> Source {
        files_source(config, default)
    }
}

pub struct YearlyCompleteMonthly;

impl Parameterizer for YearlyCompleteMonthly {
    type Record = MonthlyCloud;

    fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor::new("yearly_cmonthly_cloud")
            .summary("Extract the months with complete cloud data in complete years")
            .requires(["cmonthly_cloud"])
            .file("yearly_complete_monthly_cloud.csv")
            .table("yearly_complete_monthly_cloud")
    }

    fn setup(&self, _: &TaskContext<'_>, inputs: &Inputs) -> anyhow::Result<Dataset<MonthlyCloud>> {
        let months: &Dataset<MonthlyCloud> = inputs.get("cmonthly_cloud")?;
        let years = complete_years(months.iter(), MonthlyCloud::cloud_complete);
        Ok(months
            .iter()
            .filter(|m| years.contains(&(m.id.clone(), m.year)))
            .cloned()
            .collect())
    }
}

pub struct CompleteDaily;

impl Parameterizer for CompleteDaily {
    type Record = DailyCloud;

    fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor::new("cdaily_cloud")
            .summary("Get the days of the complete daily cloud months")
            .requires(["daily_cloud", "monthly_cloud"])
            .file("complete_daily_cloud.csv")
            .table("complete_daily_cloud")
    }

    fn setup(&self, _: &TaskContext<'_>, inputs: &Inputs) -> anyhow::Result<Dataset<DailyCloud>> {
        let months: &Dataset<MonthlyCloud> = inputs.get("monthly_cloud")?;
        let complete: BTreeSet<(&str, i32, u32)> = months
            .iter()
            .filter(|m| m.complete())
            .map(|m| (m.id.as_str(), m.year, m.month))
            .collect();
        let days: &Dataset<DailyCloud> = inputs.get("daily_cloud")?;
        Ok(days
            .iter()
            .filter(|d| complete.contains(&(d.id.as_str(), d.year, d.month)))
            .cloned()
            .collect())
    }

    fn source(&self, config: &TaskConfig, default: Source) -> Source {
        files_source(config, default)
    }
}

pub struct YearlyCompleteDaily;

impl Parameterizer for YearlyCompleteDaily {
    type Record = DailyCloud;

    fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor::new("yearly_cdaily_cloud")
            .summary("Get the days of the complete daily cloud months in complete years")
            .requires(["cdaily_cloud", "yearly_cmonthly_cloud"])
            .file("yearly_complete_daily_cloud.csv")
            .table("yearly_complete_daily_cloud")
    }

    fn setup(&self, _: &TaskContext<'_>, inputs: &Inputs) -> anyhow::Result<Dataset<DailyCloud>> {
        let months: &Dataset<MonthlyCloud> = inputs.get("yearly_cmonthly_cloud")?;
        let years = complete_years(months.iter(), MonthlyCloud::complete);
        let days: &Dataset<DailyCloud> = inputs.get("cdaily_cloud")?;
        Ok(days
            .iter()
            .filter(|d| years.contains(&(d.id.clone(), d.year)))
            .cloned()
            .collect())
    }
}

/// Mean cloud on wet or dry days as a function of the overall mean.
pub fn cloud_func(x: f64, a: f64) -> f64 {
    (-a - 1.0) / (a * a * x - a * a - a) - 1.0 / a
}

/// Standard deviation of wet or dry cloud as a function of their mean.
pub fn cloud_sd_func(x: f64, a: f64) -> f64 {
    a * a * x * (1.0 - x)
}

type Column = fn(&CloudRow) -> f64;

/// Namelist key, variable, curve, independent and dependent column.
const FITS: [(&str, &str, fn(f64, f64) -> f64, Column, Column); 4] = [
    ("cldf_w", "mean_cloud_wet", cloud_func, |r| r.mean_cloud, |r| r.mean_cloud_wet),
    ("cldf_d", "mean_cloud_dry", cloud_func, |r| r.mean_cloud, |r| r.mean_cloud_dry),
    ("cldf_sd_w", "sd_cloud_wet", cloud_sd_func, |r| r.mean_cloud_wet, |r| r.sd_cloud_wet),
    ("cldf_sd_d", "sd_cloud_dry", cloud_sd_func, |r| r.mean_cloud_dry, |r| r.sd_cloud_dry),
];

pub struct Cloud;

impl Parameterizer for Cloud {
    type Record = CloudRow;

    fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor::new("cloud")
            .summary("Parameterize the cloud data")
            .requires(["cmonthly_cloud"])
            .file("cloud_correlation.csv")
            .table("cloud_correlation")
            .with_run_step()
    }

    fn setup(&self, _: &TaskContext<'_>, inputs: &Inputs) -> anyhow::Result<Dataset<CloudRow>> {
        let months: &Dataset<MonthlyCloud> = inputs.get("cmonthly_cloud")?;
        Ok(months
            .group_by(|m| (m.id.clone(), m.month))
            .into_iter()
            .map(|((id, month), months)| {
                let mean = |f: fn(&MonthlyCloud) -> f64| nanmean(months.iter().map(|m| f(m)));
                CloudRow {
                    id,
                    month,
                    wet_day: nanmean(months.iter().map(|m| m.wet_day as f64)),
                    mean_cloud_wet: mean(|m| m.mean_cloud_wet),
                    mean_cloud_dry: mean(|m| m.mean_cloud_dry),
                    mean_cloud: mean(|m| m.mean_cloud),
                    sd_cloud_wet: mean(|m| m.sd_cloud_wet),
                    sd_cloud_dry: mean(|m| m.sd_cloud_dry),
                    sd_cloud: mean(|m| m.sd_cloud),
                }
            })
            .collect())
    }

    fn run(&self, _: &TaskContext<'_>, data: &Dataset<CloudRow>) -> anyhow::Result<RunOutput> {
        let mut output = RunOutput::default();
        let mut info = Map::new();

        for (key, name, curve, x, y) in FITS {
            let xs: Vec<f64> = data.iter().map(x).collect();
            let ys: Vec<f64> = data.iter().map(y).collect();
            let fit = curve_fit(curve, &xs, &ys, 1.0).unwrap_or_else(|err| {
                tracing::warn!(task = "cloud", "Couldn't fit {name}: {err}");
                CurveFit {
                    a: f64::NAN,
                    a_err: f64::NAN,
                }
            });
            output = output.param(key, fit.a);
            info.insert(name.to_string(), json!({"a": fit.a, "a_err": fit.a_err}));
        }

        Ok(output.info(Value::Object(info)))
    }
}
