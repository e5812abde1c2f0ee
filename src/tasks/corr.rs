//! Lag 0 and lag 1 cross correlation of minimum and maximum temperature and
//! cloud fraction, and the first order autoregressive model built on them.
//!
//! The correlations need the whole population of stations, so the task is
//! pooled: every chunk sums up the moments of its stations, and the
//! correlation matrices are formed once from the sums of all chunks.

use std::collections::{BTreeMap, HashMap};

use serde_json::json;

use crate::core::{Inputs, TaskContext};
use crate::data::{Dataset, SqlType};
use crate::emit::RunOutput;
use crate::engine::Pooled;
use crate::error::SingularCovarianceError;
use crate::registry::TaskDescriptor;
use crate::source::ghcn::GhcnDay;
use crate::stats::linalg::{Matrix3, cholesky, inverse, mul, sub, transpose};

use super::cloud::DailyCloud;
use super::day_number;

/// The modelled variables, in matrix order.
pub const VARIABLES: [&str; 3] = ["tmin", "tmax", "mean_cloud"];

crate::record! {
    /// One summed moment of a station.
    pub struct CorrStat {
        index: [id, stat],
        station: id,
        pub id: String => SqlType::Text,
        pub stat: String => SqlType::Text,
        pub value: f64 => SqlType::Real,
    }
}

crate::record! {
    /// Row `variable` of the lag 0 (`tmin`, ...) and lag 1 (`tmin1`, ...)
    /// correlation matrices. The row is the lagged variable: column `x1`
    /// holds `corr(x(t), variable(t - 1))`.
    pub struct CorrRow {
        index: [variable],
        station: none,
        pub variable: String => SqlType::Text,
        pub tmin: f64 => SqlType::Real,
        pub tmax: f64 => SqlType::Real,
        pub mean_cloud: f64 => SqlType::Real,
        pub tmin1: f64 => SqlType::Real,
        pub tmax1: f64 => SqlType::Real,
        pub mean_cloud1: f64 => SqlType::Real,
    }
}

/// Sums over pairs `(x, y)` of observation vectors, `y` lagging `x`.
#[derive(Debug, Default, Clone, PartialEq)]
struct Moments {
    n: f64,
    sx: [f64; 3],
    sy: [f64; 3],
    sxx: [f64; 3],
    syy: [f64; 3],
    sxy: Matrix3,
}

impl Moments {
    fn add(&mut self, x: &[f64; 3], y: &[f64; 3]) {
        self.n += 1.0;
        for i in 0..3 {
            self.sx[i] += x[i];
            self.sy[i] += y[i];
            self.sxx[i] += x[i] * x[i];
            self.syy[i] += y[i] * y[i];
            for j in 0..3 {
                self.sxy[i][j] += x[i] * y[j];
            }
        }
    }

    /// Pearson correlation of `x[i]` and `y[j]`.
    fn corr(&self, i: usize, j: usize) -> f64 {
        if self.n == 0.0 {
            return f64::NAN;
        }
        let (mx, my) = (self.sx[i] / self.n, self.sy[j] / self.n);
        let cov = self.sxy[i][j] / self.n - mx * my;
        let vx = self.sxx[i] / self.n - mx * mx;
        let vy = self.syy[j] / self.n - my * my;
        cov / (vx * vy).sqrt()
    }

    fn matrix(&self) -> Matrix3 {
        let mut m = [[0.0; 3]; 3];
        for (i, row) in m.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = self.corr(i, j);
            }
        }
        m
    }

    fn names(lag: usize) -> Vec<String> {
        let mut names = vec![format!("lag{lag}:n")];
        for kind in ["x", "y", "xx", "yy"] {
            names.extend(VARIABLES.map(|var| format!("lag{lag}:{kind}:{var}")));
        }
        for a in VARIABLES {
            names.extend(VARIABLES.map(|b| format!("lag{lag}:xy:{a}:{b}")));
        }
        names
    }

    fn values(&self) -> Vec<f64> {
        let mut values = vec![self.n];
        for part in [self.sx, self.sy, self.sxx, self.syy] {
            values.extend(part);
        }
        values.extend(self.sxy.iter().flatten());
        values
    }

    fn from_values(values: &[f64]) -> Self {
        let mut it = values.iter().copied();
        let mut next = || it.next().unwrap_or(0.0);
        let mut m = Moments {
            n: next(),
            ..Default::default()
        };
        for part in [&mut m.sx, &mut m.sy, &mut m.sxx, &mut m.syy] {
            part.iter_mut().for_each(|v| *v = next());
        }
        m.sxy.iter_mut().flatten().for_each(|v| *v = next());
        m
    }
}

/// Lag 0 and lag 1 moments of one station.
fn station_moments(series: &[(i32, [f64; 3])]) -> [Moments; 2] {
    let mut lag0 = Moments::default();
    let mut lag1 = Moments::default();
    for (k, (day, values)) in series.iter().enumerate() {
        lag0.add(values, values);
        if let Some((prev_day, prev)) = k.checked_sub(1).map(|p| &series[p]) {
            if day - prev_day == 1 {
                lag1.add(values, prev);
            }
        }
    }
    [lag0, lag1]
}

/// Joins the temperatures with the cloud fraction of the same station and
/// day, dropping days with a missing value.
fn joined(days: &Dataset<GhcnDay>, cloud: &Dataset<DailyCloud>) -> BTreeMap<String, Vec<(i32, [f64; 3])>> {
    let cloud: HashMap<(&str, i32, u32, u32), f64> = cloud
        .iter()
        .map(|c| ((c.id.as_str(), c.year, c.month, c.day), c.mean_cloud))
        .collect();

    let mut series: BTreeMap<String, Vec<(i32, [f64; 3])>> = BTreeMap::new();
    for d in days {
        let Some(&mean_cloud) = cloud.get(&(d.id.as_str(), d.year, d.month, d.day)) else {
            continue;
        };
        let values = [d.tmin, d.tmax, mean_cloud];
        if values.iter().any(|v| v.is_nan()) {
            continue;
        }
        if let Some(day) = day_number(d.year, d.month, d.day) {
            series.entry(d.id.clone()).or_default().push((day, values));
        }
    }
    for values in series.values_mut() {
        values.sort_by_key(|(day, _)| *day);
    }
    series
}

pub fn partial_moments(days: &Dataset<GhcnDay>, cloud: &Dataset<DailyCloud>) -> Dataset<CorrStat> {
    let mut rows = Vec::new();
    for (id, series) in joined(days, cloud) {
        for (lag, moments) in station_moments(&series).iter().enumerate() {
            for (stat, value) in Moments::names(lag).into_iter().zip(moments.values()) {
                rows.push(CorrStat {
                    id: id.clone(),
                    stat,
                    value,
                });
            }
        }
    }
    Dataset::new(rows)
}

/// Correlation matrices from the moments of all stations.
///
/// The lag 1 moments pair the current day with the day before, so their
/// matrix is transposed to put the lagged variable in the row.
pub fn correlations(partial: &Dataset<CorrStat>) -> Dataset<CorrRow> {
    let mut totals: HashMap<&str, f64> = HashMap::new();
    for row in partial {
        *totals.entry(row.stat.as_str()).or_default() += row.value;
    }
    let [m0, m1] = [0, 1].map(|lag| {
        let values: Vec<f64> = Moments::names(lag)
            .iter()
            .map(|name| totals.get(name.as_str()).copied().unwrap_or(0.0))
            .collect();
        Moments::from_values(&values).matrix()
    });
    let m1 = transpose(&m1);

    VARIABLES
        .iter()
        .enumerate()
        .map(|(i, variable)| CorrRow {
            variable: variable.to_string(),
            tmin: m0[i][0],
            tmax: m0[i][1],
            mean_cloud: m0[i][2],
            tmin1: m1[i][0],
            tmax1: m1[i][1],
            mean_cloud1: m1[i][2],
        })
        .collect()
}

/// Coefficient matrix `A` and the upper triangular factor `B` of the
/// innovation covariance, `B^T B = M0 - A M1^T`.
pub fn autoregression(m0: &Matrix3, m1: &Matrix3) -> Result<(Matrix3, Matrix3), SingularCovarianceError> {
    let singular = |matrix| SingularCovarianceError {
        task: "corr".into(),
        matrix,
    };
    let m0i = inverse(m0).ok_or_else(|| singular("M0"))?;
    let a = mul(m1, &m0i);
    let innovation = sub(m0, &mul(&a, &transpose(m1)));
    let lower = cholesky(&innovation).ok_or_else(|| singular("the innovation covariance"))?;
    Ok((a, transpose(&lower)))
}

pub struct CrossCorrelation;

impl Pooled for CrossCorrelation {
    type Partial = CorrStat;
    type Record = CorrRow;

    fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor::new("corr")
            .summary("Cross correlation between temperature and cloudiness")
            .requires(["cday", "yearly_cdaily_cloud"])
            .file("cross_correlation.csv")
            .table("cross_correlation")
            .with_run_step()
    }

    fn partial(&self, _: &TaskContext<'_>, inputs: &Inputs) -> anyhow::Result<Dataset<CorrStat>> {
        Ok(partial_moments(
            inputs.get("cday")?,
            inputs.get("yearly_cdaily_cloud")?,
        ))
    }

    fn finalize(&self, _: &TaskContext<'_>, partial: &Dataset<CorrStat>) -> anyhow::Result<Dataset<CorrRow>> {
        tracing::debug!("Correlating the moments of {} stations", {
            let mut ids: Vec<&str> = partial.iter().map(|r| r.id.as_str()).collect();
            ids.dedup();
            ids.len()
        });
        Ok(correlations(partial))
    }

    fn run(&self, _: &TaskContext<'_>, data: &Dataset<CorrRow>) -> anyhow::Result<RunOutput> {
        let mut m0 = [[f64::NAN; 3]; 3];
        let mut m1 = [[f64::NAN; 3]; 3];
        for (i, variable) in VARIABLES.iter().enumerate() {
            let row = data
                .iter()
                .find(|r| r.variable == *variable)
                .ok_or_else(|| anyhow::anyhow!("No correlations of '{variable}'"))?;
            m0[i] = [row.tmin, row.tmax, row.mean_cloud];
            m1[i] = [row.tmin1, row.tmax1, row.mean_cloud1];
        }

        let (a, b) = autoregression(&m0, &m1)?;
        Ok(RunOutput::default()
            .param("a", json!(a))
            .param("b", json!(b))
            .info(json!({"M0": m0, "M1": m1})))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::core::Environment;
    use crate::stats::testing::normal;
    use crate::tasks::testing::synthetic_days;

    /// Daily temperatures and cloud of one station. `phi` is the lag 1
    /// autocorrelation of tmin.
    fn station(id: &str, years: i32, phi: f64, seed: u64) -> (Vec<GhcnDay>, Vec<DailyCloud>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut days = synthetic_days(id, 1980, years, |_, _| 0.0);
        let mut cloud = Vec::with_capacity(days.len());
        let mut tmin = 0.0;
        for d in days.iter_mut() {
            tmin = phi * tmin + normal(&mut rng);
            d.tmin = tmin;
            d.tmax = tmin + 0.5 * normal(&mut rng) + 8.0;
            cloud.push(DailyCloud {
                id: d.id.clone(),
                year: d.year,
                month: d.month,
                day: d.day,
                wet_day: 0,
                tmin: f64::NAN,
                tmax: f64::NAN,
                mean_cloud: 0.5 + 0.1 * normal(&mut rng),
                wind: f64::NAN,
            });
        }
        (days, cloud)
    }

    fn ctx_run(data: &Dataset<CorrRow>) -> anyhow::Result<RunOutput> {
        let env = Environment::default();
        let stations: Vec<String> = Vec::new();
        let ctx = TaskContext::new(&env, "corr", &stations);
        CrossCorrelation.run(&ctx, data)
    }

    fn matrices(rows: &Dataset<CorrRow>) -> (Matrix3, Matrix3) {
        let r = rows.rows();
        let m0 = [0, 1, 2].map(|i| [r[i].tmin, r[i].tmax, r[i].mean_cloud]);
        let m1 = [0, 1, 2].map(|i| [r[i].tmin1, r[i].tmax1, r[i].mean_cloud1]);
        (m0, m1)
    }

    #[test]
    fn test_iid_data_has_no_memory() {
        let (days, cloud) = station("ST1", 20, 0.0, 1);
        let partial = partial_moments(&Dataset::new(days), &Dataset::new(cloud));
        let rows = correlations(&partial);
        let (m0, m1) = matrices(&rows);

        assert!((m0[0][0] - 1.0).abs() < 1e-9);
        assert!(m0[0][1] > 0.8);
        assert!(m0[0][2].abs() < 0.05);

        let (a, b) = autoregression(&m0, &m1).unwrap();
        for value in a.iter().flatten() {
            assert!(value.abs() < 0.1, "{a:?}");
        }

        // B^T B reproduces the innovation covariance
        let innovation = sub(&m0, &mul(&a, &transpose(&m1)));
        let product = mul(&transpose(&b), &b);
        for i in 0..3 {
            assert_eq!(b[i][..i].iter().filter(|v| **v != 0.0).count(), 0);
            for j in 0..3 {
                assert!((product[i][j] - innovation[i][j]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_autoregressive_tmin() {
        let (days, cloud) = station("ST1", 20, 0.8, 2);
        let rows = correlations(&partial_moments(&Dataset::new(days), &Dataset::new(cloud)));
        let (m0, m1) = matrices(&rows);

        assert!((m1[0][0] - 0.8).abs() < 0.05);
        let (a, _) = autoregression(&m0, &m1).unwrap();
        assert!((a[0][0] - 0.8).abs() < 0.1, "{a:?}");
    }

    #[test]
    fn test_lagged_variable_is_the_row() {
        // tmin follows the cloud fraction of the day before, nothing else
        // carries memory
        let mut rng = StdRng::seed_from_u64(6);
        let (mut days, mut cloud) = station("ST1", 20, 0.0, 6);
        let mut prev_cloud = 0.5;
        for (d, c) in days.iter_mut().zip(cloud.iter_mut()) {
            d.tmin = 8.0 * (prev_cloud - 0.5) + 0.6 * normal(&mut rng);
            d.tmax = d.tmin + 0.5 * normal(&mut rng) + 8.0;
            prev_cloud = c.mean_cloud;
        }
        let rows = correlations(&partial_moments(&Dataset::new(days), &Dataset::new(cloud)));

        let cloud_row = rows.iter().find(|r| r.variable == "mean_cloud").unwrap();
        let tmin_row = rows.iter().find(|r| r.variable == "tmin").unwrap();
        assert!((cloud_row.tmin1 - 0.8).abs() < 0.05, "{cloud_row:?}");
        assert!(tmin_row.mean_cloud1.abs() < 0.05, "{tmin_row:?}");

        let (m0, m1) = matrices(&rows);
        assert!((m1[2][0] - 0.8).abs() < 0.05);
        let (a, _) = autoregression(&m0, &m1).unwrap();
        assert!((a[2][0] - 0.8).abs() < 0.1, "{a:?}");
        assert!(a[0][2].abs() < 0.1, "{a:?}");
        assert!(a[2][1].abs() < 0.1, "{a:?}");
    }

    #[test]
    fn test_pooled_over_chunks() {
        let (days_a, cloud_a) = station("A", 3, 0.5, 3);
        let (days_b, cloud_b) = station("B", 3, 0.5, 4);

        let whole = partial_moments(
            &Dataset::new([days_a.clone(), days_b.clone()].concat()),
            &Dataset::new([cloud_a.clone(), cloud_b.clone()].concat()),
        );
        let chunked = Dataset::concat([
            partial_moments(&Dataset::new(days_a), &Dataset::new(cloud_a)),
            partial_moments(&Dataset::new(days_b), &Dataset::new(cloud_b)),
        ]);
        assert!(whole.equivalent(&chunked));
        assert_eq!(whole.len(), 2 * 2 * 22);
    }

    #[test]
    fn test_gaps_break_lag_pairs() {
        let series = [(10, [1.0, 2.0, 3.0]), (11, [2.0, 3.0, 4.0]), (13, [3.0, 4.0, 5.0])];
        let [lag0, lag1] = station_moments(&series);
        assert_eq!(lag0.n, 3.0);
        assert_eq!(lag1.n, 1.0);
        assert_eq!(lag1.sx, [2.0, 3.0, 4.0]);
        assert_eq!(lag1.sy, [1.0, 2.0, 3.0]);
        assert_eq!(Moments::from_values(&lag1.values()), lag1);
    }

    #[test]
    fn test_partial_and_finalize() {
        let (days, cloud) = station("ST1", 2, 0.3, 5);
        let mut inputs = Inputs::default();
        inputs.insert("cday", Arc::new(Dataset::new(days)));
        inputs.insert("yearly_cdaily_cloud", Arc::new(Dataset::new(cloud)));

        let env = Environment::default();
        let stations = vec!["ST1".to_string()];
        let ctx = TaskContext::new(&env, "corr", &stations);
        let partial = CrossCorrelation.partial(&ctx, &inputs).unwrap();
        let rows = CrossCorrelation.finalize(&ctx, &partial).unwrap();

        assert_eq!(rows.len(), 3);
        let output = ctx_run(&rows).unwrap();
        let section = &output.namelist[crate::emit::NAMELIST_SECTION];
        assert_eq!(section["a"].as_array().unwrap().len(), 3);
        assert_eq!(section["b"][2].as_array().unwrap().len(), 3);
        assert!((output.info["M0"][0][0].as_f64().unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_singular_covariance_is_fatal() {
        // tmin and tmax perfectly correlated
        let row = |variable: &str, m0: [f64; 3]| CorrRow {
            variable: variable.into(),
            tmin: m0[0],
            tmax: m0[1],
            mean_cloud: m0[2],
            tmin1: 0.0,
            tmax1: 0.0,
            mean_cloud1: 0.0,
        };
        let rows = Dataset::new(vec![
            row("tmin", [1.0, 1.0, 0.0]),
            row("tmax", [1.0, 1.0, 0.0]),
            row("mean_cloud", [0.0, 0.0, 1.0]),
        ]);

        let err = ctx_run(&rows).unwrap_err();
        let err = err.downcast_ref::<SingularCovarianceError>().unwrap();
        assert_eq!(err.matrix, "M0");
    }
}
