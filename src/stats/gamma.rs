use super::FitError;
use super::special::{digamma, trigamma};

/// Maximum likelihood gamma parameters with the location fixed at 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GammaFit {
    pub shape: f64,
    pub scale: f64,
}

/// Fits a two-parameter gamma distribution to strictly positive samples.
///
/// Solves `ln k - psi(k) = ln(mean) - mean(ln x)` with Newton steps, starting
/// from the closed-form approximation of Minka.
pub fn fit_gamma(samples: &[f64]) -> Result<GammaFit, FitError> {
    if samples.len() < 2 {
        return Err(FitError::TooFewSamples(samples.len()));
    }
    if samples.iter().any(|x| !x.is_finite() || *x <= 0.0) {
        return Err(FitError::Domain("gamma samples must be finite and positive"));
    }

    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let mean_ln = samples.iter().map(|x| x.ln()).sum::<f64>() / n;
    let s = mean.ln() - mean_ln;

    if !(s > 1e-12) {
        return Err(FitError::Degenerate("samples have no spread"));
    }

    let mut k = (3.0 - s + ((s - 3.0).powi(2) + 24.0 * s).sqrt()) / (12.0 * s);

    for _ in 0..100 {
        let f = k.ln() - digamma(k) - s;
        let df = 1.0 / k - trigamma(k);
        let mut next = k - f / df;
        if !(next > 0.0) {
            next = k / 2.0;
        }
        let done = (next - k).abs() <= 1e-12 * k;
        k = next;
        if done {
            return Ok(GammaFit {
                shape: k,
                scale: mean / k,
            });
        }
    }

    Err(FitError::NotConverged("gamma shape"))
}
