//! Hybrid Gamma and generalized Pareto distribution of daily precipitation.
//!
//! The body of the wet day amounts follows a Gamma distribution, amounts above
//! a threshold follow a generalized Pareto distribution. The Pareto scale is
//! tied to the Gamma fit through `pscale = (1 - F(thresh)) / f(thresh)`,
//! which makes the hybrid density continuous at the threshold.

use serde_json::json;

use crate::core::{Inputs, TaskContext};
use crate::data::{Dataset, SqlType};
use crate::emit::RunOutput;
use crate::engine::Parameterizer;
use crate::registry::TaskDescriptor;
use crate::source::ghcn::GhcnDay;
use crate::stats::special::{gamma_cdf, gamma_pdf};
use crate::stats::{fit_gamma, fit_gpd, linregress_through, nanmean, nanmedian, nanstd};
use crate::utils::dump_group;

use super::round4;

crate::record! {
    /// Distribution parameters of one station, calendar month and threshold.
    pub struct PrcpRow {
        index: [id, month, thresh],
        station: id,
        pub id: String => SqlType::Char(11),
        pub month: u32 => SqlType::SmallInt,
        pub thresh: f64 => SqlType::Real,
        /// Observed (non-missing) days of the station month. The count is
        /// the same on every threshold row and is not multiplied by the
        /// number of thresholds.
        pub n: i64 => SqlType::Integer,
        /// Wet days used for the Gamma fit.
        pub ngamma: i64 => SqlType::Integer,
        pub mean_wet: f64 => SqlType::Real,
        /// Days at or above the threshold, NaN without a Gamma fit.
        pub ngp: f64 => SqlType::Real,
        pub gshape: f64 => SqlType::Real,
        pub gscale: f64 => SqlType::Real,
        pub pshape: f64 => SqlType::Real,
        pub pscale: f64 => SqlType::Real,
        pub pscale_orig: f64 => SqlType::Real,
    }
}

/// Samples needed for either fit.
const MIN_SAMPLES: usize = 10;

/// Samples above the threshold needed for a row to enter the mean GP shape.
const MIN_GP_SHAPE_SAMPLES: f64 = 100.0;

fn failed(task: &str, id: &str, month: u32, what: &str, err: impl std::fmt::Display, days: &[&GhcnDay]) {
    let group = format!("{id}/{month}");
    let data: Dataset<GhcnDay> = days.iter().map(|d| (*d).clone()).collect();
    match dump_group(task, &group, &data) {
        Some(path) => tracing::error!(task, group, "{what} fit failed: {err}. Data dumped to {path}"),
        None => tracing::error!(task, group, "{what} fit failed: {err}"),
    }
}

/// Fits the hybrid distribution for one station month and every threshold.
fn fit_month(id: &str, month: u32, days: &[&GhcnDay], thresholds: &[f64]) -> Vec<PrcpRow> {
    let n = days.iter().filter(|d| !d.prcp.is_nan()).count() as i64;
    let wet: Vec<f64> = days.iter().map(|d| d.prcp).filter(|v| *v > 0.0).collect();

    let gamma = if wet.len() > MIN_SAMPLES {
        match fit_gamma(&wet) {
            Ok(fit) => Some(fit),
            Err(err) => {
                failed("prcp", id, month, "Gamma", err, days);
                None
            }
        }
    } else {
        None
    };

    thresholds
        .iter()
        .map(|&thresh| {
            let mut row = PrcpRow {
                id: id.to_string(),
                month,
                thresh,
                n,
                ngamma: wet.len() as i64,
                mean_wet: nanmean(wet.iter().copied()),
                ngp: f64::NAN,
                gshape: f64::NAN,
                gscale: f64::NAN,
                pshape: f64::NAN,
                pscale: f64::NAN,
                pscale_orig: f64::NAN,
            };
            let Some(gamma) = gamma else {
                return row;
            };
            row.gshape = gamma.shape;
            row.gscale = gamma.scale;

            let tail: Vec<f64> = wet.iter().copied().filter(|v| *v >= thresh).collect();
            row.ngp = tail.len() as f64;
            if tail.len() > MIN_SAMPLES {
                match fit_gpd(&tail, thresh) {
                    Ok(gp) => {
                        row.pshape = gp.shape;
                        row.pscale_orig = gp.scale;
                        row.pscale = (1.0 - gamma_cdf(thresh, gamma.shape, gamma.scale))
                            / gamma_pdf(thresh, gamma.shape, gamma.scale);
                    }
                    Err(err) => failed("prcp", id, month, "Pareto", err, days),
                }
            }
            row
        })
        .collect()
}

/// Distribution parameters of every station month of the complete days.
pub fn distribution(days: &Dataset<GhcnDay>, thresholds: &[f64]) -> Dataset<PrcpRow> {
    days.group_by(|d| (d.id.clone(), d.month))
        .into_iter()
        .flat_map(|((id, month), group)| fit_month(&id, month, &group, thresholds))
        .collect()
}

pub struct PrcpDistribution;

impl Parameterizer for PrcpDistribution {
    type Record = PrcpRow;

    fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor::new("prcp")
            .summary("Calculate the precipitation parameters")
            .requires(["cday"])
            .file("prcp.csv")
            .table("prcp")
            .with_run_step()
    }

    fn setup(&self, ctx: &TaskContext<'_>, inputs: &Inputs) -> anyhow::Result<Dataset<PrcpRow>> {
        let thresholds = ctx.config.thresholds();
        tracing::debug!("Fitting precipitation at thresholds {thresholds:?}");
        Ok(distribution(inputs.get("cday")?, &thresholds))
    }

    fn run(&self, ctx: &TaskContext<'_>, data: &Dataset<PrcpRow>) -> anyhow::Result<RunOutput> {
        let thresh = ctx.config.thresh();
        let rows: Vec<&PrcpRow> = data.iter().filter(|r| r.thresh == thresh).collect();

        let mean_wet: Vec<f64> = rows.iter().map(|r| r.mean_wet).collect();
        let gscale: Vec<f64> = rows.iter().map(|r| r.gscale).collect();
        let (slope, intercept, rsquared) = match linregress_through(&mean_wet, &gscale, 0.0, 0.0) {
            Ok(fit) => (fit.slope, fit.intercept, fit.rsquared),
            Err(err) => {
                tracing::warn!(task = "prcp", "Couldn't relate the gamma scale to the wet day mean: {err}");
                (f64::NAN, f64::NAN, f64::NAN)
            }
        };

        let shapes: Vec<f64> = rows
            .iter()
            .filter(|r| r.ngp > MIN_GP_SHAPE_SAMPLES)
            .map(|r| r.pshape)
            .collect();
        let gp_shape = nanmean(shapes.iter().copied());

        Ok(RunOutput::default()
            .param("g_scale_coeff", slope)
            .param("thresh", thresh)
            .param("gp_shape", round4(gp_shape))
            .info(json!({
                "rsquared": round4(rsquared),
                "slope": round4(slope),
                "intercept": round4(intercept),
                "gpshape_mean": round4(gp_shape),
                "gpshape_median": round4(nanmedian(shapes.iter().copied())),
                "gpshape_std": round4(nanstd(shapes.iter().copied(), 1)),
            })))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Datelike;

    use super::*;
    use crate::stats::testing::gamma_sample;
    use crate::tasks::testing::synthetic_days;

    #[test]
    fn test_few_wet_days_give_nan() {
        // 10 wet days in every month
        let days = synthetic_days("ST1", 2000, 1, |date, _| if date.day() <= 10 { 20.0 } else { 0.0 });
        let rows = distribution(&Dataset::new(days), &[5.0, 15.0]);

        assert_eq!(rows.len(), 24);
        let jan = &rows.rows()[0];
        assert_eq!((jan.n, jan.ngamma), (31, 10));
        assert_eq!(jan.mean_wet, 20.0);
        for row in &rows {
            assert!(row.gshape.is_nan() && row.gscale.is_nan());
            assert!(row.ngp.is_nan() && row.pshape.is_nan() && row.pscale.is_nan());
        }
    }

    #[test]
    fn test_recovers_gamma_and_tail() {
        let sample = gamma_sample(0.9, 8.0, 3000, 7);
        let days: Vec<GhcnDay> = synthetic_days("ST1", 1900, 100, |_, _| 0.0)
            .into_iter()
            .filter(|d| d.month == 1)
            .zip(sample)
            .map(|(mut d, prcp)| {
                d.prcp = prcp;
                d
            })
            .collect();
        let rows = distribution(&Dataset::new(days), &[15.0]);

        assert_eq!(rows.len(), 1);
        let row = &rows.rows()[0];
        assert!((row.gshape - 0.9).abs() / 0.9 < 0.1, "shape {}", row.gshape);
        assert!((row.gscale - 8.0).abs() / 8.0 < 0.1, "scale {}", row.gscale);
        assert!(row.ngp > 10.0);
        assert!(row.pscale_orig > 0.0);
        let expected = (1.0 - gamma_cdf(15.0, row.gshape, row.gscale)) / gamma_pdf(15.0, row.gshape, row.gscale);
        assert_eq!(row.pscale, expected);
    }
}
