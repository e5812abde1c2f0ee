//! Numerical kernels used by the estimation tasks.

mod gamma;
pub mod linalg;
mod pareto;
mod regress;
pub mod special;

use thiserror::Error;

pub use gamma::{GammaFit, fit_gamma};
pub use pareto::{GpdFit, fit_gpd};
pub use regress::{CurveFit, Regression, curve_fit, linregress, linregress_through};

/// A fit that could not be carried out for one group of samples.
///
/// These are recovered by the tasks: the group gets NaN parameters.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FitError {
    #[error("not enough samples ({0})")]
    TooFewSamples(usize),

    #[error("{0}")]
    Domain(&'static str),

    #[error("degenerate sample: {0}")]
    Degenerate(&'static str),

    #[error("did not converge: {0}")]
    NotConverged(&'static str),
}

/// Mean of the finite values, NaN when there are none.
pub fn nanmean(values: impl IntoIterator<Item = f64>) -> f64 {
    let (sum, n) = values
        .into_iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    if n == 0 { f64::NAN } else { sum / n as f64 }
}

/// Standard deviation of the finite values with `ddof` degrees of freedom removed.
pub fn nanstd(values: impl IntoIterator<Item = f64>, ddof: usize) -> f64 {
    let values: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
    if values.len() <= ddof {
        return f64::NAN;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    (ss / (values.len() - ddof) as f64).sqrt()
}

pub fn nanmedian(values: impl IntoIterator<Item = f64>) -> f64 {
    let mut values: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return f64::NAN;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nan_aware_moments() {
        let values = [1.0, f64::NAN, 3.0];
        assert_eq!(nanmean(values), 2.0);
        assert_eq!(nanstd(values, 0), 1.0);
        assert_eq!(nanstd(values, 1), 2f64.sqrt());
        assert!(nanmean([f64::NAN]).is_nan());
        assert!(nanstd([1.0], 1).is_nan());
        assert_eq!(nanmedian([4.0, 1.0, f64::NAN, 2.0, 3.0]), 2.5);
    }
}
