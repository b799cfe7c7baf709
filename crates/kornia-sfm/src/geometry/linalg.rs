//! Dense linear algebra glue between `glam` and `faer`.

use faer::prelude::SpSolver;
use glam::{DMat3, DVec3};

/// Error raised when a linear system cannot be solved.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum LinalgError {
    /// The system has no rows or no unknowns.
    #[error("Empty linear system")]
    Empty,
    /// The normal matrix is singular or the solution is not finite.
    #[error("Singular linear system ({dim} unknowns)")]
    Singular {
        /// Number of unknowns.
        dim: usize,
    },
}

/// Copy a `DMat3` into a 3x3 `faer` matrix.
pub fn mat3_to_faer(m: &DMat3) -> faer::Mat<f64> {
    faer::Mat::<f64>::from_fn(3, 3, |i, j| m.col(j)[i])
}

/// Copy the top-left 3x3 block of a `faer` matrix into a `DMat3`.
pub fn faer_to_mat3(m: faer::MatRef<'_, f64>) -> DMat3 {
    DMat3::from_cols(
        DVec3::new(m.read(0, 0), m.read(1, 0), m.read(2, 0)),
        DVec3::new(m.read(0, 1), m.read(1, 1), m.read(2, 1)),
        DVec3::new(m.read(0, 2), m.read(1, 2), m.read(2, 2)),
    )
}

/// Build a `DMat3` from a row-major array of 9 values.
pub fn mat3_from_rows(v: &[f64]) -> DMat3 {
    DMat3::from_cols(
        DVec3::new(v[0], v[3], v[6]),
        DVec3::new(v[1], v[4], v[7]),
        DVec3::new(v[2], v[5], v[8]),
    )
}

/// Right singular vector of the smallest singular value of `a` (n x m), unit norm.
///
/// Computed from the SVD of the m x m normal matrix so that under-determined inputs
/// (fewer rows than columns) are handled the same way.
pub fn null_vector(a: &faer::Mat<f64>) -> Option<Vec<f64>> {
    let m = a.ncols();
    if m == 0 || a.nrows() == 0 {
        return None;
    }
    let mut ata = faer::Mat::<f64>::zeros(m, m);
    for r in 0..a.nrows() {
        for i in 0..m {
            let ai = a.read(r, i);
            if ai == 0.0 {
                continue;
            }
            for j in i..m {
                let v = ata.read(i, j) + ai * a.read(r, j);
                ata.write(i, j, v);
            }
        }
    }
    for i in 0..m {
        for j in 0..i {
            ata.write(i, j, ata.read(j, i));
        }
    }
    null_vector_of_normal(&ata)
}

/// Null vector of a symmetric positive semi-definite matrix.
pub fn null_vector_of_normal(ata: &faer::Mat<f64>) -> Option<Vec<f64>> {
    let m = ata.ncols();
    let svd = ata.svd();
    let v = svd.v().col(m - 1);
    let out: Vec<f64> = (0..m).map(|i| v[i]).collect();
    if out.iter().all(|x| x.is_finite()) {
        Some(out)
    } else {
        None
    }
}

/// Accumulates weighted linear least-squares rows into normal equations.
///
/// Each row is a sparse list of `(unknown, coefficient)` pairs with a right hand side,
/// and contributes `w * a a^T` to the normal matrix and `w * a b` to the right hand side.
#[derive(Debug, Clone)]
pub struct LeastSquares {
    ata: faer::Mat<f64>,
    atb: Vec<f64>,
    num_rows: usize,
}

impl LeastSquares {
    /// Create an empty system with `dim` unknowns.
    pub fn new(dim: usize) -> Self {
        Self {
            ata: faer::Mat::<f64>::zeros(dim, dim),
            atb: vec![0.0; dim],
            num_rows: 0,
        }
    }

    /// Number of unknowns.
    pub fn dim(&self) -> usize {
        self.atb.len()
    }

    /// Number of rows added so far.
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// Add one weighted row.
    pub fn add_row(&mut self, coeffs: &[(usize, f64)], rhs: f64, weight: f64) {
        for &(i, ai) in coeffs {
            for &(j, aj) in coeffs {
                let v = self.ata.read(i, j) + weight * ai * aj;
                self.ata.write(i, j, v);
            }
            self.atb[i] += weight * ai * rhs;
        }
        self.num_rows += 1;
    }

    /// The accumulated normal matrix.
    pub fn normal_matrix(&self) -> &faer::Mat<f64> {
        &self.ata
    }

    /// Solve the normal equations with a partial pivoting LU.
    pub fn solve(&self) -> Result<Vec<f64>, LinalgError> {
        let n = self.dim();
        if n == 0 || self.num_rows == 0 {
            return Err(LinalgError::Empty);
        }
        let rhs = faer::Mat::<f64>::from_fn(n, 1, |i, _| self.atb[i]);
        let sol = self.ata.partial_piv_lu().solve(&rhs);
        let x: Vec<f64> = (0..n).map(|i| sol.read(i, 0)).collect();
        if x.iter().any(|v| !v.is_finite()) {
            return Err(LinalgError::Singular { dim: n });
        }

        // LU does not detect rank deficiency, check the residual
        let mut res_norm = 0.0;
        let mut rhs_norm = 0.0;
        for i in 0..n {
            let mut ax = 0.0;
            for (j, xj) in x.iter().enumerate() {
                ax += self.ata.read(i, j) * xj;
            }
            res_norm += (ax - self.atb[i]).powi(2);
            rhs_norm += self.atb[i].powi(2);
        }
        if res_norm.sqrt() > 1e-6 * (rhs_norm.sqrt() + 1.0) {
            return Err(LinalgError::Singular { dim: n });
        }
        Ok(x)
    }

    /// Unit-norm minimizer of the homogeneous system `A x = 0`.
    pub fn solve_homogeneous(&self) -> Result<Vec<f64>, LinalgError> {
        if self.dim() == 0 || self.num_rows == 0 {
            return Err(LinalgError::Empty);
        }
        null_vector_of_normal(&self.ata).ok_or(LinalgError::Singular { dim: self.dim() })
    }
}

/// Singular values of a 3x3 matrix, sorted in decreasing order.
pub fn singular_values3(m: &DMat3) -> DVec3 {
    let svd = mat3_to_faer(m).svd();
    let s = svd.s_diagonal();
    DVec3::new(s[0], s[1], s[2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mat3_conversions() {
        let m = mat3_from_rows(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 10.0]);
        assert_eq!(m.row(0), DVec3::new(1.0, 2.0, 3.0));
        let f = mat3_to_faer(&m);
        assert_eq!(f.read(0, 1), 2.0);
        assert_eq!(f.read(2, 2), 10.0);
        assert_eq!(faer_to_mat3(f.as_ref()), m);
    }

    #[test]
    fn test_least_squares_overdetermined() -> Result<(), LinalgError> {
        // x + y = 3, x - y = 1, 2x = 4
        let mut ls = LeastSquares::new(2);
        ls.add_row(&[(0, 1.0), (1, 1.0)], 3.0, 1.0);
        ls.add_row(&[(0, 1.0), (1, -1.0)], 1.0, 1.0);
        ls.add_row(&[(0, 2.0)], 4.0, 1.0);
        let x = ls.solve()?;
        assert_relative_eq!(x[0], 2.0, epsilon = 1e-10);
        assert_relative_eq!(x[1], 1.0, epsilon = 1e-10);
        assert_eq!(ls.num_rows(), 3);
        Ok(())
    }

    #[test]
    fn test_least_squares_singular() {
        let mut ls = LeastSquares::new(2);
        ls.add_row(&[(0, 1.0), (1, 1.0)], 1.0, 1.0);
        ls.add_row(&[(0, 2.0), (1, 2.0)], 3.0, 1.0);
        assert!(ls.solve().is_err());
        assert_eq!(LeastSquares::new(3).solve(), Err(LinalgError::Empty));
    }

    #[test]
    fn test_null_vector() {
        // rows orthogonal to (1, 1, 1)
        let a = faer::mat![[1.0, -1.0, 0.0], [0.0, 1.0, -1.0], [2.0, -1.0, -1.0f64]];
        let v = null_vector(&a).unwrap();
        let s = 1.0 / 3f64.sqrt();
        assert_relative_eq!(v[0].abs(), s, epsilon = 1e-9);
        assert_relative_eq!(v[0], v[1], epsilon = 1e-9);
        assert_relative_eq!(v[1], v[2], epsilon = 1e-9);
    }

    #[test]
    fn test_singular_values3() {
        let m = DMat3::from_diagonal(DVec3::new(1.0, 3.0, 2.0));
        let s = singular_values3(&m);
        assert_relative_eq!(s.x, 3.0, epsilon = 1e-12);
        assert_relative_eq!(s.y, 2.0, epsilon = 1e-12);
        assert_relative_eq!(s.z, 1.0, epsilon = 1e-12);
    }
}
