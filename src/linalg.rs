//! Dense linear algebra on `ndarray` storage.
//!
//! Arrays are stored with `ndarray` throughout the crate; factorizations are delegated to
//! `nalgebra`. Matrices handled here are small (state and action dimensions), so converting by
//! copying is cheaper than keeping two representations in sync.
use crate::error::LinalgError;
use nalgebra::{Cholesky, DMatrix};
use ndarray::{Array1, Array2, ArrayBase, ArrayView1, ArrayView2, Data, Ix2};

/// Copy a 2D array into a `nalgebra` matrix.
pub fn to_dmatrix<S: Data<Elem = f64>>(a: &ArrayBase<S, Ix2>) -> DMatrix<f64> {
    let (rows, cols) = a.dim();
    DMatrix::from_fn(rows, cols, |i, j| a[[i, j]])
}

/// Copy a `nalgebra` matrix into a 2D array.
pub fn from_dmatrix(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

/// Lower Cholesky factor `L` of a symmetric positive definite matrix, `A = L Lᵀ`.
///
/// Only the lower triangle of `a` is read.
///
/// # Errors
/// [`LinalgError::NotPositiveDefinite`] if the factorization breaks down,
/// including when `a` contains NaN.
pub fn cholesky<S: Data<Elem = f64>>(a: &ArrayBase<S, Ix2>) -> Result<Array2<f64>, LinalgError> {
    let (rows, cols) = a.dim();
    if rows != cols {
        return Err(LinalgError::NotSquare { rows, cols });
    }
    Cholesky::new(to_dmatrix(a))
        .map(|chol| from_dmatrix(&chol.l()))
        .ok_or(LinalgError::NotPositiveDefinite)
}

/// Solve `L Lᵀ X = B` given the lower Cholesky factor `L`.
///
/// Uses a forward then a backward triangular solve; the inverse of `L Lᵀ` is never formed.
pub fn cho_solve(
    chol: ArrayView2<f64>,
    rhs: ArrayView2<f64>,
) -> Result<Array2<f64>, LinalgError> {
    let l = to_dmatrix(&chol);
    let y = l
        .solve_lower_triangular(&to_dmatrix(&rhs))
        .ok_or(LinalgError::Singular)?;
    let x = l.tr_solve_lower_triangular(&y).ok_or(LinalgError::Singular)?;
    Ok(from_dmatrix(&x))
}

/// [`cho_solve`] for a single right hand side vector.
pub fn cho_solve_vec(
    chol: ArrayView2<f64>,
    rhs: ArrayView1<f64>,
) -> Result<Array1<f64>, LinalgError> {
    let column = rhs.view().insert_axis(ndarray::Axis(1));
    let x = cho_solve(chol, column)?;
    Ok(x.column(0).to_owned())
}

/// Inverse of `L Lᵀ` from its lower Cholesky factor.
pub fn cho_inverse(chol: ArrayView2<f64>) -> Result<Array2<f64>, LinalgError> {
    let n = chol.nrows();
    cho_solve(chol, Array2::eye(n).view())
}

/// Solve a general square system `A X = B` by LU decomposition.
///
/// # Errors
/// [`LinalgError::Singular`] if `A` is singular.
pub fn solve(a: ArrayView2<f64>, rhs: ArrayView2<f64>) -> Result<Array2<f64>, LinalgError> {
    let (rows, cols) = a.dim();
    if rows != cols {
        return Err(LinalgError::NotSquare { rows, cols });
    }
    to_dmatrix(&a)
        .lu()
        .solve(&to_dmatrix(&rhs))
        .map(|x| from_dmatrix(&x))
        .ok_or(LinalgError::Singular)
}

/// Log determinant of `L Lᵀ` from its Cholesky factor.
pub fn cho_logdet(chol: ArrayView2<f64>) -> f64 {
    2.0 * chol.diag().iter().map(|d| d.ln()).sum::<f64>()
}

/// Replace a square matrix by its symmetric part `(A + Aᵀ) / 2`.
pub fn symmetrize(a: &mut Array2<f64>) {
    let sym = (&*a + &a.t()) * 0.5;
    a.assign(&sym);
}

/// The outer product `a bᵀ`.
pub fn outer(a: ArrayView1<f64>, b: ArrayView1<f64>) -> Array2<f64> {
    Array2::from_shape_fn((a.len(), b.len()), |(i, j)| a[i] * b[j])
}

/// Whether any element is NaN.
pub fn has_nan<'a, I: IntoIterator<Item = &'a f64>>(values: I) -> bool {
    values.into_iter().any(|x| x.is_nan())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    fn assert_close(a: &Array2<f64>, b: &Array2<f64>, tol: f64) {
        assert_eq!(a.dim(), b.dim());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < tol, "{} != {}\n{:?}\n{:?}", x, y, a, b);
        }
    }

    #[test]
    fn cholesky_reconstructs() {
        let a = arr2(&[[4.0, 2.0, 0.4], [2.0, 5.0, 1.0], [0.4, 1.0, 3.0]]);
        let l = cholesky(&a).unwrap();
        assert_eq!(l[[0, 1]], 0.0);
        assert_close(&l.dot(&l.t()), &a, 1e-12);
    }

    #[test]
    fn cholesky_rejects_indefinite() {
        let a = arr2(&[[1.0, 2.0], [2.0, 1.0]]);
        assert_eq!(cholesky(&a), Err(LinalgError::NotPositiveDefinite));
    }

    #[test]
    fn cholesky_rejects_nan() {
        let a = arr2(&[[f64::NAN, 0.0], [0.0, 1.0]]);
        assert!(cholesky(&a).is_err());
    }

    #[test]
    fn cho_inverse_is_inverse() {
        let a = arr2(&[[2.0, 0.5], [0.5, 1.0]]);
        let l = cholesky(&a).unwrap();
        let inv = cho_inverse(l.view()).unwrap();
        assert_close(&a.dot(&inv), &Array2::eye(2), 1e-12);
    }

    #[test]
    fn cho_solve_vec_solves() {
        let a = arr2(&[[2.0, 0.5], [0.5, 1.0]]);
        let b = arr1(&[1.0, -1.0]);
        let l = cholesky(&a).unwrap();
        let x = cho_solve_vec(l.view(), b.view()).unwrap();
        let r = a.dot(&x) - &b;
        assert!(r.iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn solve_singular() {
        let a = arr2(&[[1.0, 2.0], [2.0, 4.0]]);
        let b = Array2::eye(2);
        assert_eq!(solve(a.view(), b.view()), Err(LinalgError::Singular));
    }

    #[test]
    fn logdet_matches_product() {
        let a = arr2(&[[4.0, 0.0], [0.0, 9.0]]);
        let l = cholesky(&a).unwrap();
        assert!((cho_logdet(l.view()) - 36.0_f64.ln()).abs() < 1e-12);
    }
}
