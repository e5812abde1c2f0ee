use serde::Serialize;

use super::FitError;

/// Result of a straight line fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Regression {
    pub slope: f64,
    pub intercept: f64,
    pub rsquared: f64,
}

impl Regression {
    /// Placeholder for a fit that could not be made.
    pub const NAN: Self = Self {
        slope: f64::NAN,
        intercept: f64::NAN,
        rsquared: f64::NAN,
    };
}

/// Pairs where both values are finite.
fn finite_pairs(x: &[f64], y: &[f64]) -> Vec<(f64, f64)> {
    x.iter()
        .zip(y)
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .map(|(a, b)| (*a, *b))
        .collect()
}

/// Centered coefficient of determination `1 - SSR / SST`.
fn rsquared(pairs: &[(f64, f64)], slope: f64, intercept: f64) -> f64 {
    let n = pairs.len() as f64;
    let mean_y = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let (ssr, sst) = pairs.iter().fold((0.0, 0.0), |(ssr, sst), (x, y)| {
        let r = y - (intercept + slope * x);
        (ssr + r * r, sst + (y - mean_y).powi(2))
    });
    1.0 - ssr / sst
}

/// Ordinary least squares. Non finite pairs are ignored.
pub fn linregress(x: &[f64], y: &[f64]) -> Result<Regression, FitError> {
    let pairs = finite_pairs(x, y);
    if pairs.len() < 2 {
        return Err(FitError::TooFewSamples(pairs.len()));
    }

    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let (sxy, sxx) = pairs.iter().fold((0.0, 0.0), |(sxy, sxx), (x, y)| {
        (sxy + (x - mean_x) * (y - mean_y), sxx + (x - mean_x).powi(2))
    });

    if sxx == 0.0 {
        return Err(FitError::Degenerate("constant regressor"));
    }

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;

    Ok(Regression {
        slope,
        intercept,
        rsquared: rsquared(&pairs, slope, intercept),
    })
}

/// Least squares line forced through the point `(x0, y0)`.
pub fn linregress_through(x: &[f64], y: &[f64], x0: f64, y0: f64) -> Result<Regression, FitError> {
    let pairs = finite_pairs(x, y);
    if pairs.is_empty() {
        return Err(FitError::TooFewSamples(0));
    }

    let (sxy, sxx) = pairs.iter().fold((0.0, 0.0), |(sxy, sxx), (x, y)| {
        (sxy + (x - x0) * (y - y0), sxx + (x - x0).powi(2))
    });

    if sxx == 0.0 {
        return Err(FitError::Degenerate("all points at the fixed point"));
    }

    let slope = sxy / sxx;
    let intercept = y0 - slope * x0;

    Ok(Regression {
        slope,
        intercept,
        rsquared: rsquared(&pairs, slope, intercept),
    })
}

/// Single parameter of a nonlinear curve with its standard error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CurveFit {
    pub a: f64,
    pub a_err: f64,
}

/// Fits `y = f(x, a)` by damped Gauss-Newton steps starting from `a0`.
///
/// The standard error comes from the residual variance and the Jacobian at
/// the optimum, like a covariance estimate of a one-parameter least squares.
pub fn curve_fit<F>(f: F, x: &[f64], y: &[f64], a0: f64) -> Result<CurveFit, FitError>
where
    F: Fn(f64, f64) -> f64,
{
    let pairs = finite_pairs(x, y);
    if pairs.len() < 2 {
        return Err(FitError::TooFewSamples(pairs.len()));
    }

    let ssr = |a: f64| -> f64 {
        pairs
            .iter()
            .map(|(x, y)| (y - f(*x, a)).powi(2))
            .sum::<f64>()
    };

    let jacobian = |a: f64| -> Vec<f64> {
        let h = 1e-7 * a.abs().max(1.0);
        pairs
            .iter()
            .map(|(x, _)| (f(*x, a + h) - f(*x, a - h)) / (2.0 * h))
            .collect()
    };

    let mut a = a0;
    let mut current = ssr(a);
    let mut lambda = 1e-3;

    if !current.is_finite() {
        return Err(FitError::Domain("curve undefined at the starting point"));
    }

    for _ in 0..500 {
        let jac = jacobian(a);
        let jtj: f64 = jac.iter().map(|j| j * j).sum();
        let jtr: f64 = jac
            .iter()
            .zip(&pairs)
            .map(|(j, (x, y))| j * (y - f(*x, a)))
            .sum();

        if jtj == 0.0 || !jtj.is_finite() {
            return Err(FitError::Degenerate("flat curve"));
        }

        let step = jtr / (jtj * (1.0 + lambda));
        let candidate = a + step;
        let next = ssr(candidate);

        if next.is_finite() && next <= current {
            let converged = step.abs() <= 1e-12 * (1.0 + a.abs());
            a = candidate;
            current = next;
            lambda = (lambda / 10.0).max(1e-12);
            if converged {
                break;
            }
        } else {
            lambda *= 10.0;
            if lambda > 1e12 {
                break;
            }
        }
    }

    let jtj: f64 = jacobian(a).iter().map(|j| j * j).sum();
    let variance = current / (pairs.len() - 1) as f64;

    Ok(CurveFit {
        a,
        a_err: (variance / jtj).sqrt(),
    })
}
