use super::FitError;

/// Generalized Pareto parameters for a known threshold (location).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpdFit {
    pub shape: f64,
    pub scale: f64,
}

const GRID: usize = 200;

/// Profile log-likelihood per sample in terms of `theta = shape / scale`.
///
/// Returns `(loglik, shape, scale)`; shapes below -1 have an unbounded
/// likelihood and are excluded.
fn profile(excess: &[f64], theta: f64) -> (f64, f64, f64) {
    let n = excess.len() as f64;

    if theta.abs() < 1e-12 {
        let scale = excess.iter().sum::<f64>() / n;
        return (-scale.ln() - 1.0, 0.0, scale);
    }

    let mut acc = 0.0;
    for y in excess {
        let z = 1.0 + theta * y;
        if z <= 0.0 {
            return (f64::NEG_INFINITY, f64::NAN, f64::NAN);
        }
        acc += z.ln();
    }

    let shape = acc / n;
    let scale = shape / theta;
    if shape < -1.0 || !(scale > 0.0) {
        return (f64::NEG_INFINITY, shape, scale);
    }

    (-scale.ln() - shape - 1.0, shape, scale)
}

/// Maximum likelihood fit of a generalized Pareto distribution with location
/// `loc` to the samples `x >= loc`.
///
/// The two-parameter problem is reduced to a one-dimensional profile in
/// `theta`, searched on a grid and refined by golden section.
pub fn fit_gpd(samples: &[f64], loc: f64) -> Result<GpdFit, FitError> {
    if samples.len() < 2 {
        return Err(FitError::TooFewSamples(samples.len()));
    }

    let excess: Vec<f64> = samples.iter().map(|x| x - loc).collect();
    if excess.iter().any(|y| !y.is_finite() || *y < 0.0) {
        return Err(FitError::Domain("exceedances must lie above the threshold"));
    }

    let mean = excess.iter().sum::<f64>() / excess.len() as f64;
    let max = excess.iter().cloned().fold(0.0, f64::max);
    if !(mean > 0.0) {
        return Err(FitError::Degenerate("exceedances have no spread"));
    }

    let lower = -1.0 / max;
    let mut grid = Vec::with_capacity(2 * GRID + 1);
    for i in 1..GRID {
        grid.push(lower * (1.0 - i as f64 / GRID as f64).powi(2).mul_add(-1.0, 1.0));
    }
    grid.push(0.0);
    for i in 0..GRID {
        let exponent = -6.0 + 10.0 * i as f64 / (GRID - 1) as f64;
        grid.push(10f64.powf(exponent) / mean);
    }
    grid.sort_by(f64::total_cmp);

    let values: Vec<f64> = grid.iter().map(|t| profile(&excess, *t).0).collect();
    let best = values
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .ok_or(FitError::NotConverged("pareto profile"))?;

    let mut a = grid[best.saturating_sub(1)];
    let mut b = grid[(best + 1).min(grid.len() - 1)];

    // golden section on the bracket around the best grid point
    let ratio = (5f64.sqrt() - 1.0) / 2.0;
    let mut c = b - ratio * (b - a);
    let mut d = a + ratio * (b - a);
    let mut fc = profile(&excess, c).0;
    let mut fd = profile(&excess, d).0;
    for _ in 0..200 {
        if (b - a).abs() <= 1e-12 * (1.0 + a.abs() + b.abs()) {
            break;
        }
        if fc >= fd {
            b = d;
            d = c;
            fd = fc;
            c = b - ratio * (b - a);
            fc = profile(&excess, c).0;
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + ratio * (b - a);
            fd = profile(&excess, d).0;
        }
    }

    let refined = (a + b) / 2.0;
    let (ll, shape, scale) = profile(&excess, refined);
    let (ll_grid, shape_grid, scale_grid) = profile(&excess, grid[best]);

    let (shape, scale) = if ll >= ll_grid {
        (shape, scale)
    } else {
        (shape_grid, scale_grid)
    };

    if !shape.is_finite() || !scale.is_finite() {
        return Err(FitError::NotConverged("pareto parameters"));
    }

    Ok(GpdFit { shape, scale })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quantiles(shape: f64, scale: f64, n: usize) -> Vec<f64> {
        // stratified sample from the inverse distribution function
        (0..n)
            .map(|i| {
                let u = (i as f64 + 0.5) / n as f64;
                if shape == 0.0 {
                    -scale * (1.0 - u).ln()
                } else {
                    scale / shape * ((1.0 - u).powf(-shape) - 1.0)
                }
            })
            .collect()
    }

    #[test]
    fn test_recovers_heavy_tail() {
        let sample: Vec<f64> = quantiles(0.3, 4.0, 2000).iter().map(|y| y + 15.0).collect();
        let fit = fit_gpd(&sample, 15.0).unwrap();

        assert!((fit.shape - 0.3).abs() < 0.05, "{fit:?}");
        assert!((fit.scale - 4.0).abs() / 4.0 < 0.05, "{fit:?}");
    }

    #[test]
    fn test_recovers_bounded_tail() {
        let sample = quantiles(-0.2, 2.0, 2000);
        let fit = fit_gpd(&sample, 0.0).unwrap();

        assert!((fit.shape + 0.2).abs() < 0.05, "{fit:?}");
        assert!((fit.scale - 2.0).abs() / 2.0 < 0.05, "{fit:?}");
    }

    #[test]
    fn test_exponential_limit() {
        let sample = quantiles(0.0, 1.5, 2000);
        let fit = fit_gpd(&sample, 0.0).unwrap();

        assert!(fit.shape.abs() < 0.05, "{fit:?}");
        assert!((fit.scale - 1.5).abs() / 1.5 < 0.05, "{fit:?}");
    }

    #[test]
    fn test_rejects_values_below_threshold() {
        assert!(fit_gpd(&[1.0, 2.0, 3.0], 2.5).is_err());
    }
}
