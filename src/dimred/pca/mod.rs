//! # Principal Component Analysis
//!
//! Dense PCA on a centered matrix: unbiased covariance, Jacobi
//! eigen-decomposition, components ranked by descending eigenvalue and scores
//! obtained by projecting the rows onto them.

use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView2, Axis};

use crate::eigen::Jacobi;
use crate::error::{DimRedError, Result};

pub(crate) const METHOD: &str = "pca";

/// Configured PCA run. Build with [`PcaBuilder`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pca {
    components: (usize, usize),
    solver: Jacobi,
}

impl Default for Pca {
    fn default() -> Self {
        PcaBuilder::new().build()
    }
}

impl Pca {
    /// Zero-based indices of the two components placed on the x and y axes.
    pub fn components(&self) -> (usize, usize) {
        self.components
    }

    pub fn solver(&self) -> &Jacobi {
        &self.solver
    }

    /// Fits all `p` components of a centered `n x p` matrix.
    ///
    /// # Returns
    /// - `Ok(PcaModel)`: ranked eigenpairs and scores for every row
    /// - `Err(InsufficientData)`: fewer than 2 rows or 2 columns
    pub fn fit(&self, x: ArrayView2<f64>) -> Result<PcaModel> {
        let (n_samples, n_features) = x.dim();
        if n_samples < 2 || n_features < 2 {
            return Err(DimRedError::insufficient(
                METHOD, 2, 2, n_samples, n_features,
            ));
        }

        let mut covariance = x.t().dot(&x);
        covariance /= (n_samples - 1) as f64;

        let eig = self.solver.decompose(covariance.view())?;
        let converged = eig.converged();
        let (raw_values, raw_vectors) = eig.into_parts();

        // Stable sort: tied eigenvalues keep their diagonal order.
        let mut order: Vec<usize> = (0..n_features).collect();
        order.sort_by(|&a, &b| {
            raw_values[b]
                .partial_cmp(&raw_values[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let eigenvalues: Array1<f64> = order.iter().map(|&i| raw_values[i]).collect();
        let mut loadings = raw_vectors.select(Axis(1), &order);
        flip_signs(&mut loadings);

        let scores = x.dot(&loadings);
        debug!(
            "PCA eigenvalues for {}x{} input: {:?}",
            n_samples, n_features, eigenvalues
        );

        Ok(PcaModel {
            eigenvalues,
            loadings,
            scores,
            converged,
        })
    }

    /// Fits and returns the two configured components as an `n x 2` layout.
    pub fn fit_transform(&self, x: ArrayView2<f64>) -> Result<(Array2<f64>, PcaSummary)> {
        let (first, second) = self.components;
        if first == second {
            return Err(DimRedError::InvalidParameter(format!(
                "PCA display components must differ, got ({}, {})",
                first, second
            )));
        }

        let model = self.fit(x)?;
        let n_features = model.eigenvalues.len();
        if first >= n_features || second >= n_features {
            return Err(DimRedError::InvalidParameter(format!(
                "PCA component ({}, {}) out of range for {} features",
                first, second, n_features
            )));
        }

        info!(
            "PCA on {}x{} showing PC{} vs PC{}",
            x.nrows(),
            n_features,
            first + 1,
            second + 1
        );

        let layout = model.project(first, second);
        Ok((layout, model.summary(self.components)))
    }
}

/// Builder for [`Pca`].
///
/// Defaults: components `(0, 1)`, Jacobi tolerance `1e-10`, 100 sweeps.
#[derive(Debug, Clone, Copy)]
pub struct PcaBuilder {
    components: (usize, usize),
    solver: Jacobi,
}

impl Default for PcaBuilder {
    fn default() -> Self {
        Self {
            components: (0, 1),
            solver: Jacobi::default(),
        }
    }
}

impl PcaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn components(mut self, first: usize, second: usize) -> Self {
        self.components = (first, second);
        self
    }

    pub fn solver(mut self, solver: Jacobi) -> Self {
        self.solver = solver;
        self
    }

    pub fn build(self) -> Pca {
        Pca {
            components: self.components,
            solver: self.solver,
        }
    }
}

/// Fitted components, ordered by descending eigenvalue.
#[derive(Debug, Clone)]
pub struct PcaModel {
    eigenvalues: Array1<f64>,
    loadings: Array2<f64>,
    scores: Array2<f64>,
    converged: bool,
}

impl PcaModel {
    /// Eigenvalues of the covariance matrix. Small negative values can appear on
    /// near-singular input.
    pub fn eigenvalues(&self) -> &Array1<f64> {
        &self.eigenvalues
    }

    /// Unit-length loading vectors, one column per component.
    pub fn loadings(&self) -> &Array2<f64> {
        &self.loadings
    }

    /// Projection of every fitted row onto every component (`n x p`).
    pub fn scores(&self) -> &Array2<f64> {
        &self.scores
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    /// Share of total variance per component, in the range `[0, 1]`.
    ///
    /// Negative eigenvalues count as zero. If no component carries variance
    /// every ratio is zero.
    pub fn explained_variance_ratio(&self) -> Array1<f64> {
        let clipped = self.eigenvalues.mapv(|v| v.max(0.0));
        let total = clipped.sum();
        if total > 0.0 {
            clipped / total
        } else {
            Array1::zeros(clipped.len())
        }
    }

    /// [`Self::explained_variance_ratio`] in percent.
    pub fn variance_explained(&self) -> Array1<f64> {
        self.explained_variance_ratio() * 100.0
    }

    pub fn cumulative_explained_variance_ratio(&self) -> Array1<f64> {
        let ratios = self.explained_variance_ratio();
        let mut sum = 0.0;
        ratios.mapv(|r| {
            sum += r;
            sum
        })
    }

    /// Projects centered rows onto the fitted components.
    pub fn transform(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        if x.ncols() != self.loadings.nrows() {
            return Err(DimRedError::ShapeMismatch(format!(
                "PCA fitted on {} features, got {}",
                self.loadings.nrows(),
                x.ncols()
            )));
        }
        Ok(x.dot(&self.loadings))
    }

    pub fn project(&self, first: usize, second: usize) -> Array2<f64> {
        self.scores.select(Axis(1), &[first, second])
    }

    pub fn summary(&self, components: (usize, usize)) -> PcaSummary {
        PcaSummary {
            components,
            eigenvalues: self.eigenvalues.to_vec(),
            variance_explained: self.variance_explained().to_vec(),
            loadings: self.loadings.clone(),
            low_confidence: !self.converged,
        }
    }
}

/// PCA metadata attached to an embedding: axis labels, scree data and the
/// loading vectors used for arrow overlays.
#[derive(Debug, Clone, PartialEq)]
pub struct PcaSummary {
    pub components: (usize, usize),
    pub eigenvalues: Vec<f64>,
    /// Percent of total variance per component, summing to 100 unless all
    /// eigenvalues are zero.
    pub variance_explained: Vec<f64>,
    pub loadings: Array2<f64>,
    /// Set when the eigensolver stopped at its rotation cap.
    pub low_confidence: bool,
}

// Makes the largest-magnitude entry of each loading vector positive so the
// orientation of the plot does not depend on the rotation sequence.
fn flip_signs(loadings: &mut Array2<f64>) {
    for mut column in loadings.columns_mut() {
        let mut pivot = 0.0_f64;
        for &v in column.iter() {
            if v.abs() > pivot.abs() {
                pivot = v;
            }
        }
        if pivot < 0.0 {
            column.mapv_inplace(|v| -v);
        }
    }
}
