//! # Simplified UMAP
//!
//! A single-threaded approximation of Uniform Manifold Approximation and
//! Projection, sized for interactive scatter plots of up to ~1000 rows:
//!
//! - exact k-nearest neighbours from the full distance matrix
//! - one σ per point, found by bisection so the neighbour memberships sum to
//!   `log2(k)`
//! - fuzzy union `w_ij + w_ji − w_ij·w_ji` to symmetrize, edges ≤ 0.01 dropped
//! - layout seeded from the first two principal components
//! - SGD with a fixed number of negative samples per point and epoch
//!
//! The `(a, b)` curve uses a closed-form fit in `min_dist` instead of the
//! least-squares fit of the full algorithm.

use log::{debug, info, trace};
use nalgebra_sparse::{CooMatrix, CsrMatrix, SparseEntry};
use ndarray::{Array1, Array2, ArrayView2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::dimred::pca::Pca;
use crate::error::{DimRedError, Result};
use crate::similarity::{k_nearest, pairwise_distances, Euclidean};
use crate::utils::CancelToken;

pub(crate) const METHOD: &str = "umap";

const MAX_SIGMA_STEPS: usize = 64;
const SIGMA_TOLERANCE: f64 = 1e-5;
const MIN_SIGMA: f64 = 1e-10;
const EDGE_THRESHOLD: f64 = 0.01;
const MAX_FORCE: f64 = 4.0;
const REPULSION_EPSILON: f64 = 0.001;
const CURVE_B: f64 = 0.7915;
const FALLBACK_INIT_SCALE: f64 = 1e-2;

/// Configured UMAP run. Build with [`UmapBuilder`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Umap {
    n_neighbors: usize,
    min_dist: f64,
    iterations: usize,
    learning_rate: f64,
    negative_samples: usize,
    random_seed: u64,
}

impl Default for Umap {
    fn default() -> Self {
        UmapBuilder::new().build()
    }
}

impl Umap {
    pub fn n_neighbors(&self) -> usize {
        self.n_neighbors
    }

    pub fn min_dist(&self) -> f64 {
        self.min_dist
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn negative_samples(&self) -> usize {
        self.negative_samples
    }

    pub fn random_seed(&self) -> u64 {
        self.random_seed
    }

    /// Neighbour count actually used for `n_samples` rows, within `[2, n−1]`.
    pub fn effective_neighbors(&self, n_samples: usize) -> usize {
        self.n_neighbors.min(n_samples.saturating_sub(1)).max(2)
    }

    /// `(a, b)` of the low-dimensional membership curve `1 / (1 + a·d^2b)`.
    pub fn curve_params(&self) -> (f64, f64) {
        let a = 1.929 / (1.0 + 0.0815 * self.min_dist.powf(1.8));
        (a, CURVE_B)
    }

    fn validate(&self) -> Result<()> {
        if !self.min_dist.is_finite() || self.min_dist < 0.0 {
            return Err(DimRedError::InvalidParameter(format!(
                "min_dist must be non-negative, got {}",
                self.min_dist
            )));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(DimRedError::InvalidParameter(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.iterations == 0 {
            return Err(DimRedError::InvalidParameter(
                "UMAP needs at least one epoch".to_string(),
            ));
        }
        Ok(())
    }

    /// Embeds a standardized `n x p` matrix with a generator seeded from
    /// `random_seed`.
    pub fn fit_transform(&self, x: ArrayView2<f64>) -> Result<(Array2<f64>, UmapSummary)> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.random_seed);
        self.fit_transform_with_rng(x, &mut rng, &CancelToken::new())
    }

    /// Embeds a standardized `n x p` matrix. `rng` drives the fallback
    /// initialisation and negative sampling; `cancel` is checked once per
    /// epoch.
    pub fn fit_transform_with_rng<R: Rng>(
        &self,
        x: ArrayView2<f64>,
        rng: &mut R,
        cancel: &CancelToken,
    ) -> Result<(Array2<f64>, UmapSummary)> {
        let (n_samples, n_features) = x.dim();
        if n_samples < 3 {
            return Err(DimRedError::insufficient(
                METHOD, 3, 1, n_samples, n_features,
            ));
        }
        self.validate()?;

        let k = self.effective_neighbors(n_samples);
        if k != self.n_neighbors {
            debug!(
                "UMAP n_neighbors {} clamped to {} for {} samples",
                self.n_neighbors, k, n_samples
            );
        }
        let (a, b) = self.curve_params();
        info!(
            "UMAP on {}x{}: k={}, min_dist={}, a={:.4}, b={}, {} epochs",
            n_samples, n_features, k, self.min_dist, a, b, self.iterations
        );

        let distances = pairwise_distances(x, &Euclidean);
        let neighbors = k_nearest(distances.view(), k);
        let directed = directed_memberships(&neighbors, n_samples);
        let graph = fuzzy_union(&directed)?;

        let edges: Vec<(usize, usize, f64)> = graph
            .triplet_iter()
            .filter(|&(i, j, _)| i < j)
            .map(|(i, j, &w)| (i, j, w))
            .collect();
        debug!("UMAP graph has {} edges", edges.len());

        let mut layout = initial_layout(x, rng);

        for epoch in 0..self.iterations {
            cancel.check()?;
            let alpha = self.learning_rate * (1.0 - epoch as f64 / self.iterations as f64);

            optimize_epoch(
                &mut layout,
                &graph,
                &edges,
                (a, b),
                alpha,
                self.negative_samples,
                rng,
            );

            if epoch % 50 == 0 {
                trace!("UMAP epoch {}/{}", epoch, self.iterations);
            }
        }

        info!("UMAP finished after {} epochs", self.iterations);
        Ok((
            layout,
            UmapSummary {
                effective_neighbors: k,
                a,
                b,
                edges: edges.len(),
            },
        ))
    }
}

/// Builder for [`Umap`].
///
/// Defaults: 15 neighbours, min_dist 0.1, 200 epochs, learning rate 1.0,
/// 5 negative samples, seed 42.
#[derive(Debug, Clone, Copy)]
pub struct UmapBuilder {
    n_neighbors: usize,
    min_dist: f64,
    iterations: usize,
    learning_rate: f64,
    negative_samples: usize,
    random_seed: u64,
}

impl Default for UmapBuilder {
    fn default() -> Self {
        Self {
            n_neighbors: 15,
            min_dist: 0.1,
            iterations: 200,
            learning_rate: 1.0,
            negative_samples: 5,
            random_seed: 42,
        }
    }
}

impl UmapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn n_neighbors(mut self, n_neighbors: usize) -> Self {
        self.n_neighbors = n_neighbors;
        self
    }

    pub fn min_dist(mut self, min_dist: f64) -> Self {
        self.min_dist = min_dist;
        self
    }

    pub fn iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Negative samples drawn per point and epoch.
    pub fn negative_samples(mut self, negative_samples: usize) -> Self {
        self.negative_samples = negative_samples;
        self
    }

    pub fn random_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    pub fn build(self) -> Umap {
        Umap {
            n_neighbors: self.n_neighbors,
            min_dist: self.min_dist,
            iterations: self.iterations,
            learning_rate: self.learning_rate,
            negative_samples: self.negative_samples,
            random_seed: self.random_seed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UmapSummary {
    pub effective_neighbors: usize,
    pub a: f64,
    pub b: f64,
    /// Undirected edges kept after pruning.
    pub edges: usize,
}

/// Scale σ such that `Σ exp(−max(0, d − ρ)/σ)` over the neighbours equals
/// `target`.
pub(crate) fn smooth_knn_sigma(neighbors: &[(usize, f64)], rho: f64, target: f64) -> f64 {
    let mut lo = 0.0;
    let mut hi = f64::INFINITY;
    let mut sigma = 1.0;

    for _ in 0..MAX_SIGMA_STEPS {
        let sum: f64 = neighbors
            .iter()
            .map(|&(_, d)| (-(d - rho).max(0.0) / sigma).exp())
            .sum();
        if (sum - target).abs() < SIGMA_TOLERANCE {
            break;
        }
        if sum > target {
            hi = sigma;
            sigma = (lo + hi) / 2.0;
        } else {
            lo = sigma;
            sigma = if hi.is_infinite() {
                sigma * 2.0
            } else {
                (lo + hi) / 2.0
            };
        }
    }

    sigma.max(MIN_SIGMA)
}

/// Dense `n x n` matrix of directed memberships `w_ij` from each point to its
/// neighbours; zero elsewhere.
pub(crate) fn directed_memberships(neighbors: &[Vec<(usize, f64)>], n: usize) -> Array2<f64> {
    let mut weights = Array2::zeros((n, n));
    for (i, row) in neighbors.iter().enumerate() {
        let Some(&(_, rho)) = row.first() else {
            continue;
        };
        let target = (row.len() as f64).log2();
        let sigma = smooth_knn_sigma(row, rho, target);
        for &(j, d) in row {
            weights[[i, j]] = (-(d - rho).max(0.0) / sigma).exp();
        }
    }
    weights
}

/// Symmetric graph from the probabilistic t-conorm of both directions, with
/// weights at or below the pruning threshold dropped.
pub(crate) fn fuzzy_union(directed: &Array2<f64>) -> Result<CsrMatrix<f64>> {
    let n = directed.nrows();
    let mut rows = Vec::new();
    let mut cols = Vec::new();
    let mut values = Vec::new();

    for i in 0..n {
        for j in (i + 1)..n {
            let w_ij = directed[[i, j]];
            let w_ji = directed[[j, i]];
            let w = w_ij + w_ji - w_ij * w_ji;
            if w > EDGE_THRESHOLD {
                rows.extend([i, j]);
                cols.extend([j, i]);
                values.extend([w, w]);
            }
        }
    }

    let coo = CooMatrix::try_from_triplets(n, n, rows, cols, values).map_err(|e| {
        DimRedError::ShapeMismatch(format!("failed to build UMAP graph: {}", e))
    })?;
    Ok(CsrMatrix::from(&coo))
}

fn is_edge(graph: &CsrMatrix<f64>, i: usize, j: usize) -> bool {
    matches!(graph.get_entry(i, j), Some(SparseEntry::NonZero(_)))
}

// A negative sample only repels when it is neither the point itself nor one
// of its graph neighbours.
fn repels(graph: &CsrMatrix<f64>, i: usize, j: usize) -> bool {
    j != i && !is_edge(graph, i, j)
}

/// Per-coordinate attractive step for `i` towards its neighbour, where
/// `(dx, dy) = y_i − y_j`. Coincident points do not attract.
fn attraction(dx: f64, dy: f64, a: f64, b: f64) -> (f64, f64) {
    let d2 = dx * dx + dy * dy;
    if d2 <= 0.0 {
        return (0.0, 0.0);
    }
    let coeff = -2.0 * a * b * d2.powf(b - 1.0) / (1.0 + a * d2.powf(b));
    (clip(coeff * dx), clip(coeff * dy))
}

/// Per-coordinate repulsive step for `i` away from a negative sample.
fn repulsion(dx: f64, dy: f64, a: f64, b: f64) -> (f64, f64) {
    let d2 = dx * dx + dy * dy;
    let coeff = 2.0 * b / ((REPULSION_EPSILON + d2) * (1.0 + a * d2.powf(b)));
    (clip(coeff * dx), clip(coeff * dy))
}

// One SGD pass: every undirected edge pulls both endpoints together, scaled by
// its weight, then every point draws `negative_samples` repelling partners.
fn optimize_epoch<R: Rng>(
    layout: &mut Array2<f64>,
    graph: &CsrMatrix<f64>,
    edges: &[(usize, usize, f64)],
    (a, b): (f64, f64),
    alpha: f64,
    negative_samples: usize,
    rng: &mut R,
) {
    let n = layout.nrows();

    for &(i, j, w) in edges {
        let dx = layout[[i, 0]] - layout[[j, 0]];
        let dy = layout[[i, 1]] - layout[[j, 1]];
        let (gx, gy) = attraction(dx, dy, a, b);
        let (gx, gy) = (gx * alpha * w, gy * alpha * w);
        layout[[i, 0]] += gx;
        layout[[i, 1]] += gy;
        layout[[j, 0]] -= gx;
        layout[[j, 1]] -= gy;
    }

    for i in 0..n {
        for _ in 0..negative_samples {
            let j = rng.random_range(0..n);
            if !repels(graph, i, j) {
                continue;
            }
            let dx = layout[[i, 0]] - layout[[j, 0]];
            let dy = layout[[i, 1]] - layout[[j, 1]];
            let (gx, gy) = repulsion(dx, dy, a, b);
            layout[[i, 0]] += gx * alpha;
            layout[[i, 1]] += gy * alpha;
        }
    }
}

/// First two principal components, each scaled to unit standard deviation.
/// An axis that PCA cannot provide (fewer than two features, or zero variance)
/// gets small random values instead.
pub(crate) fn initial_layout<R: Rng>(x: ArrayView2<f64>, rng: &mut R) -> Array2<f64> {
    let n = x.nrows();
    let model = Pca::default().fit(x).ok();
    let mut layout = Array2::zeros((n, 2));

    for axis in 0..2 {
        let scaled = model
            .as_ref()
            .and_then(|m| unit_variance(m.scores().column(axis).to_owned()));
        match scaled {
            Some(column) => layout.column_mut(axis).assign(&column),
            None => {
                debug!("UMAP axis {} initialised randomly", axis);
                layout
                    .column_mut(axis)
                    .mapv_inplace(|_| rng.random_range(-FALLBACK_INIT_SCALE..FALLBACK_INIT_SCALE));
            }
        }
    }

    layout
}

fn unit_variance(column: Array1<f64>) -> Option<Array1<f64>> {
    let mean = column.mean()?;
    let std = column.std(0.0);
    if std.is_finite() && std > 1e-12 {
        Some((column - mean) / std)
    } else {
        None
    }
}

#[inline]
fn clip(v: f64) -> f64 {
    v.clamp(-MAX_FORCE, MAX_FORCE)
}
