//! # Symmetric eigen-decomposition
//!
//! Cyclic Jacobi rotations on a dense symmetric matrix. Each rotation pivots on
//! the off-diagonal entry of largest magnitude and zeroes it exactly; the
//! rotations are accumulated into the eigenvector matrix.
//!
//! Reaching the rotation cap is not an error: the current diagonal and rotation
//! product are returned and [`SymmetricEigen::converged`] reports `false`.
//! When eigenvalues are tied, the eigenvectors returned for them are some
//! orthonormal basis of the shared eigenspace; which one is not specified.

use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayView2};

use crate::error::{DimRedError, Result};

/// Jacobi solver settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Jacobi {
    tolerance: f64,
    max_sweeps: usize,
}

impl Default for Jacobi {
    fn default() -> Self {
        Self {
            tolerance: 1e-10,
            max_sweeps: 100,
        }
    }
}

impl Jacobi {
    pub fn new(tolerance: f64, max_sweeps: usize) -> Self {
        Self {
            tolerance,
            max_sweeps,
        }
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn max_sweeps(&self) -> usize {
        self.max_sweeps
    }

    /// Decomposes a symmetric matrix. Eigenvalues come back unsorted, in the
    /// order of the diagonal; column `i` of the vectors belongs to value `i`.
    pub fn decompose(&self, matrix: ArrayView2<f64>) -> Result<SymmetricEigen> {
        let (n, m) = matrix.dim();
        if n != m {
            return Err(DimRedError::ShapeMismatch(format!(
                "eigen-decomposition needs a square matrix, got {}x{}",
                n, m
            )));
        }

        let mut a = matrix.to_owned();
        let mut v = Array2::<f64>::eye(n);

        if n < 2 {
            return Ok(SymmetricEigen {
                values: a.diag().to_owned(),
                vectors: v,
                converged: true,
                rotations: 0,
            });
        }

        // One sweep touches every off-diagonal pair once.
        let max_rotations = self.max_sweeps * n * (n - 1) / 2;
        let mut rotations = 0;
        let converged = loop {
            let (p, q, largest) = largest_off_diagonal(&a);
            if largest < self.tolerance {
                break true;
            }
            if rotations >= max_rotations {
                break false;
            }
            rotate(&mut a, &mut v, p, q);
            rotations += 1;
        };

        if converged {
            debug!("Jacobi converged on {}x{} after {} rotations", n, n, rotations);
        } else {
            warn!(
                "Jacobi hit the cap of {} rotations on a {}x{} matrix, returning approximation",
                max_rotations, n, n
            );
        }

        Ok(SymmetricEigen {
            values: a.diag().to_owned(),
            vectors: v,
            converged,
            rotations,
        })
    }
}

/// Output of [`Jacobi::decompose`].
#[derive(Debug, Clone)]
pub struct SymmetricEigen {
    values: Array1<f64>,
    vectors: Array2<f64>,
    converged: bool,
    rotations: usize,
}

impl SymmetricEigen {
    pub fn values(&self) -> &Array1<f64> {
        &self.values
    }

    /// Eigenvectors as columns.
    pub fn vectors(&self) -> &Array2<f64> {
        &self.vectors
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn rotations(&self) -> usize {
        self.rotations
    }

    pub fn into_parts(self) -> (Array1<f64>, Array2<f64>) {
        (self.values, self.vectors)
    }

    // V diag(values) V^T
    pub fn reconstruct(&self) -> Array2<f64> {
        let scaled = &self.vectors * &self.values;
        scaled.dot(&self.vectors.t())
    }
}

fn largest_off_diagonal(a: &Array2<f64>) -> (usize, usize, f64) {
    let n = a.nrows();
    let mut best = (0, 1, 0.0);
    for i in 0..n {
        for j in (i + 1)..n {
            let value = a[[i, j]].abs();
            if value > best.2 {
                best = (i, j, value);
            }
        }
    }
    best
}

fn rotate(a: &mut Array2<f64>, v: &mut Array2<f64>, p: usize, q: usize) {
    let n = a.nrows();
    let apq = a[[p, q]];
    let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * apq);
    let t = if theta.abs() > 1e150 {
        // theta^2 would overflow
        0.5 / theta
    } else {
        theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt())
    };
    let c = 1.0 / (t * t + 1.0).sqrt();
    let s = t * c;

    a[[p, p]] -= t * apq;
    a[[q, q]] += t * apq;
    a[[p, q]] = 0.0;
    a[[q, p]] = 0.0;

    for r in 0..n {
        if r == p || r == q {
            continue;
        }
        let arp = a[[r, p]];
        let arq = a[[r, q]];
        let new_rp = c * arp - s * arq;
        let new_rq = s * arp + c * arq;
        a[[r, p]] = new_rp;
        a[[p, r]] = new_rp;
        a[[r, q]] = new_rq;
        a[[q, r]] = new_rq;
    }

    for r in 0..n {
        let vrp = v[[r, p]];
        let vrq = v[[r, q]];
        v[[r, p]] = c * vrp - s * vrq;
        v[[r, q]] = s * vrp + c * vrq;
    }
}
