//! Fixed size 3x3 matrix helpers for the autoregressive model.

pub type Matrix3 = [[f64; 3]; 3];

pub fn mul(a: &Matrix3, b: &Matrix3) -> Matrix3 {
    let mut out = [[0.0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            out[i][j] = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

pub fn transpose(a: &Matrix3) -> Matrix3 {
    let mut out = [[0.0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            out[j][i] = a[i][j];
        }
    }
    out
}

pub fn sub(a: &Matrix3, b: &Matrix3) -> Matrix3 {
    let mut out = *a;
    for i in 0..3 {
        for j in 0..3 {
            out[i][j] -= b[i][j];
        }
    }
    out
}

pub fn determinant(a: &Matrix3) -> f64 {
    a[0][0] * (a[1][1] * a[2][2] - a[1][2] * a[2][1])
        - a[0][1] * (a[1][0] * a[2][2] - a[1][2] * a[2][0])
        + a[0][2] * (a[1][0] * a[2][1] - a[1][1] * a[2][0])
}

/// Inverse by the adjugate, `None` when the matrix is (numerically) singular.
pub fn inverse(a: &Matrix3) -> Option<Matrix3> {
    let det = determinant(a);
    let norm = a.iter().flatten().map(|x| x.abs()).fold(0.0, f64::max);
    if !det.is_finite() || det.abs() <= 1e-12 * norm.powi(3).max(f64::MIN_POSITIVE) {
        return None;
    }

    let mut out = [[0.0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            let (r0, r1) = ((j + 1) % 3, (j + 2) % 3);
            let (c0, c1) = ((i + 1) % 3, (i + 2) % 3);
            out[i][j] = (a[r0][c0] * a[r1][c1] - a[r0][c1] * a[r1][c0]) / det;
        }
    }
    Some(out)
}

/// Lower triangular `L` with `L * L^T = a` for a positive semi-definite `a`.
///
/// Pivots within a relative `1e-12` of zero are clamped to zero, which needs
/// the rest of their column to vanish as well. `None` when `a` is not
/// positive semi-definite.
pub fn cholesky(a: &Matrix3) -> Option<Matrix3> {
    let scale = (0..3).map(|i| a[i][i].abs()).fold(0.0, f64::max);
    let eps = 1e-12 * scale.max(f64::MIN_POSITIVE);

    let mut l = [[0.0; 3]; 3];
    for j in 0..3 {
        let pivot = a[j][j] - (0..j).map(|k| l[j][k] * l[j][k]).sum::<f64>();
        if !(pivot >= -eps) {
            return None;
        }
        l[j][j] = pivot.max(0.0).sqrt();

        for i in j + 1..3 {
            let rest = a[i][j] - (0..j).map(|k| l[i][k] * l[j][k]).sum::<f64>();
            l[i][j] = if l[j][j] > eps.sqrt() {
                rest / l[j][j]
            } else if rest.abs() <= eps.sqrt() {
                0.0
            } else {
                return None;
            };
        }
    }
    Some(l)
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: Matrix3 = [[4.0, 2.0, 0.6], [2.0, 5.0, 1.0], [0.6, 1.0, 3.0]];

    fn assert_close(a: &Matrix3, b: &Matrix3) {
        for i in 0..3 {
            for j in 0..3 {
                assert!((a[i][j] - b[i][j]).abs() < 1e-12, "{a:?} != {b:?}");
            }
        }
    }

    #[test]
    fn test_inverse() {
        let inv = inverse(&M).unwrap();
        let identity = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        assert_close(&mul(&M, &inv), &identity);
        assert_close(&mul(&inv, &M), &identity);
    }

    #[test]
    fn test_singular() {
        let singular = [[1.0, 2.0, 3.0], [2.0, 4.0, 6.0], [0.0, 1.0, 1.0]];
        assert!(inverse(&singular).is_none());
        assert!(cholesky(&singular).is_none());
    }

    #[test]
    fn test_cholesky_semi_definite() {
        // rank 2: the third variable copies the first
        let a = [[1.0, 0.5, 1.0], [0.5, 1.0, 0.5], [1.0, 0.5, 1.0]];
        let l = cholesky(&a).unwrap();
        assert_close(&mul(&l, &transpose(&l)), &a);
        assert_eq!(l[2][2], 0.0);

        let zero = [[0.0; 3]; 3];
        assert_eq!(cholesky(&zero), Some(zero));

        let indefinite = [[1.0, 0.0, 0.0], [0.0, -1e-3, 0.0], [0.0, 0.0, 1.0]];
        assert!(cholesky(&indefinite).is_none());
    }

    #[test]
    fn test_cholesky() {
        let l = cholesky(&M).unwrap();
        assert_close(&mul(&l, &transpose(&l)), &M);
        assert_eq!(l[0][1], 0.0);
        assert_eq!(l[1][2], 0.0);
    }
}
