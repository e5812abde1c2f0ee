//! Temperature statistics on wet and dry days.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::core::{Inputs, TaskContext};
use crate::data::{Dataset, SqlType};
use crate::emit::RunOutput;
use crate::engine::Parameterizer;
use crate::registry::TaskDescriptor;
use crate::source::ghcn::GhcnDay;
use crate::stats::{Regression, linregress, nanmean, nanstd};

use super::regression_info;

crate::record! {
    /// Multi year means of the monthly temperature statistics of a station.
    ///
    /// Standard deviations are population deviations within a month.
    pub struct TempRow {
        index: [id, month],
        station: id,
        pub id: String => SqlType::Char(11),
        pub month: u32 => SqlType::SmallInt,
        pub tmin_wet: f64 => SqlType::Real,
        pub tminstddev_wet: f64 => SqlType::Real,
        pub tmax_wet: f64 => SqlType::Real,
        pub tmaxstddev_wet: f64 => SqlType::Real,
        pub trange_wet: f64 => SqlType::Real,
        pub trangestddev_wet: f64 => SqlType::Real,
        pub tmin_dry: f64 => SqlType::Real,
        pub tminstddev_dry: f64 => SqlType::Real,
        pub tmax_dry: f64 => SqlType::Real,
        pub tmaxstddev_dry: f64 => SqlType::Real,
        pub trange_dry: f64 => SqlType::Real,
        pub trangestddev_dry: f64 => SqlType::Real,
        pub tmin: f64 => SqlType::Real,
        pub tminstddev: f64 => SqlType::Real,
        pub tmax: f64 => SqlType::Real,
        pub tmaxstddev: f64 => SqlType::Real,
        pub trange: f64 => SqlType::Real,
        pub trangestddev: f64 => SqlType::Real,
        /// Mean of the daily mean temperature `(tmin + tmax) / 2`.
        pub t: f64 => SqlType::Real,
        pub tstddev: f64 => SqlType::Real,
        /// Mean precipitation on wet days.
        pub prcp_wet: f64 => SqlType::Real,
        /// Gamma shape from the moment approximation.
        pub alpha: f64 => SqlType::Real,
        pub beta: f64 => SqlType::Real,
    }
}

const N_STATS: usize = 23;

fn moments(values: impl Iterator<Item = f64> + Clone) -> [f64; 2] {
    [nanmean(values.clone()), nanstd(values, 0)]
}

/// Gamma parameters from the arithmetic and geometric mean of the wet days.
///
/// Undefined when both means agree, i.e. all wet days have the same amount.
fn gamma_moments(wet: &[f64]) -> [f64; 3] {
    let am = nanmean(wet.iter().copied());
    // ln(am / gm) without the round trip through exp
    let ratio = am.ln() - nanmean(wet.iter().map(|v| v.ln()));
    if !(ratio > 1e-12) {
        return [am, f64::NAN, f64::NAN];
    }
    let alpha = 0.5000876 / ratio + 0.16488552 - 0.0544274 * ratio;
    [am, alpha, am / alpha]
}

/// Statistics of one station month of one year in [`TempRow`] column order.
fn year_stats(days: &[&GhcnDay]) -> [f64; N_STATS] {
    let mut stats = [f64::NAN; N_STATS];
    let states: [fn(&GhcnDay) -> bool; 3] = [|d| d.prcp > 0.0, |d| d.prcp == 0.0, |_| true];

    for (s, state) in states.iter().enumerate() {
        let selected = days.iter().filter(|d| state(d));
        let [tmin, tmax, trange] = [
            moments(selected.clone().map(|d| d.tmin)),
            moments(selected.clone().map(|d| d.tmax)),
            moments(selected.map(|d| d.tmax - d.tmin)),
        ];
        stats[s * 6..(s + 1) * 6].copy_from_slice(&[tmin, tmax, trange].concat());
    }

    let [t, tstddev] = moments(days.iter().map(|d| (d.tmin + d.tmax) / 2.0));
    let wet: Vec<f64> = days.iter().map(|d| d.prcp).filter(|v| *v > 0.0).collect();
    let [am, alpha, beta] = gamma_moments(&wet);
    stats[18..].copy_from_slice(&[t, tstddev, am, alpha, beta]);
    stats
}

fn row(id: String, month: u32, stats: [f64; N_STATS]) -> TempRow {
    let [
        tmin_wet,
        tminstddev_wet,
        tmax_wet,
        tmaxstddev_wet,
        trange_wet,
        trangestddev_wet,
        tmin_dry,
        tminstddev_dry,
        tmax_dry,
        tmaxstddev_dry,
        trange_dry,
        trangestddev_dry,
        tmin,
        tminstddev,
        tmax,
        tmaxstddev,
        trange,
        trangestddev,
        t,
        tstddev,
        prcp_wet,
        alpha,
        beta,
    ] = stats;
    TempRow {
        id,
        month,
        tmin_wet,
        tminstddev_wet,
        tmax_wet,
        tmaxstddev_wet,
        trange_wet,
        trangestddev_wet,
        tmin_dry,
        tminstddev_dry,
        tmax_dry,
        tmaxstddev_dry,
        trange_dry,
        trangestddev_dry,
        tmin,
        tminstddev,
        tmax,
        tmaxstddev,
        trange,
        trangestddev,
        t,
        tstddev,
        prcp_wet,
        alpha,
        beta,
    }
}

/// Per station month statistics, averaged over the years ignoring NaN.
pub fn temperature_statistics(days: &Dataset<GhcnDay>) -> Dataset<TempRow> {
    let mut months: BTreeMap<(String, u32), Vec<[f64; N_STATS]>> = BTreeMap::new();
    for ((id, month, _), group) in days.group_by(|d| (d.id.clone(), d.month, d.year)) {
        months.entry((id, month)).or_default().push(year_stats(&group));
    }

    months
        .into_iter()
        .map(|((id, month), years)| {
            let mut mean = [f64::NAN; N_STATS];
            for (i, slot) in mean.iter_mut().enumerate() {
                *slot = nanmean(years.iter().map(|stats| stats[i]));
            }
            row(id, month, mean)
        })
        .collect()
}

type Column = fn(&TempRow) -> f64;

/// Namelist prefix, dependent variable name, dependent and independent column.
const FITS: [(&str, &str, Column, Column); 8] = [
    ("tmin_w", "tmin_wet", |r| r.tmin_wet, |r| r.tmin),
    ("tmin_d", "tmin_dry", |r| r.tmin_dry, |r| r.tmin),
    ("tmin_sd_w", "tminstddev_wet", |r| r.tminstddev_wet, |r| r.tmin_wet),
    ("tmin_sd_d", "tminstddev_dry", |r| r.tminstddev_dry, |r| r.tmin_dry),
    ("tmax_w", "tmax_wet", |r| r.tmax_wet, |r| r.tmax),
    ("tmax_d", "tmax_dry", |r| r.tmax_dry, |r| r.tmax),
    ("tmax_sd_w", "tmaxstddev_wet", |r| r.tmaxstddev_wet, |r| r.tmax_wet),
    ("tmax_sd_d", "tmaxstddev_dry", |r| r.tmaxstddev_dry, |r| r.tmax_dry),
];

pub struct Temperature;

impl Parameterizer for Temperature {
    type Record = TempRow;

    fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor::new("temp")
            .summary("Calculate the temperature parameters")
            .requires(["cday"])
            .file("temperature.csv")
            .table("temperature")
            .with_run_step()
    }

    fn setup(&self, _: &TaskContext<'_>, inputs: &Inputs) -> anyhow::Result<Dataset<TempRow>> {
        Ok(temperature_statistics(inputs.get("cday")?))
    }

    fn run(&self, _: &TaskContext<'_>, data: &Dataset<TempRow>) -> anyhow::Result<RunOutput> {
        let mut output = RunOutput::default();
        let mut info = Map::new();

        for (prefix, name, y, x) in FITS {
            let xs: Vec<f64> = data.iter().map(x).collect();
            let ys: Vec<f64> = data.iter().map(y).collect();
            let fit = linregress(&xs, &ys).unwrap_or_else(|err| {
                tracing::warn!(task = "temp", "Couldn't fit {name}: {err}");
                Regression::NAN
            });
            output = output
                .param(format!("{prefix}1"), fit.intercept)
                .param(format!("{prefix}2"), fit.slope);
            info.insert(name.to_string(), regression_info(&fit));
        }

        Ok(output.info(Value::Object(info)))
    }
}
