//! # t-distributed Stochastic Neighbor Embedding
//!
//! Exact (O(n²) per iteration) t-SNE into two dimensions:
//!
//! 1. squared Euclidean distances between all rows
//! 2. per-row Gaussian precision found by bisection so that the conditional
//!    distribution has entropy `ln(perplexity)`
//! 3. symmetrized joint affinities `(p_j|i + p_i|j) / 2n`
//! 4. gradient descent on the KL divergence with early exaggeration, momentum,
//!    adaptive gains, gradient norm clipping and a linearly decaying learning
//!    rate; the layout is re-centered after every step
//!
//! The only randomness is the initial layout, drawn from the caller's RNG, so a
//! fixed seed gives identical output.

use log::{debug, info, trace};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::{DimRedError, Result};
use crate::similarity::{pairwise_distances, SquaredEuclidean};
use crate::utils::{CancelToken, ZeroVec};

pub(crate) const METHOD: &str = "tsne";

const MAX_BISECTION_STEPS: usize = 50;
const ENTROPY_TOLERANCE: f64 = 1e-5;
const MIN_AFFINITY: f64 = 1e-12;
const EXAGGERATION: f64 = 4.0;
const MAX_EXAGGERATION_STEPS: usize = 100;
const MAX_GRADIENT_NORM: f64 = 5.0;
const MIN_GAIN: f64 = 0.01;
const MOMENTUM_SWITCH: usize = 250;
const INITIAL_MOMENTUM: f64 = 0.5;
const FINAL_MOMENTUM: f64 = 0.8;
const FINAL_LEARNING_RATE_FRACTION: f64 = 0.1;
const INIT_SCALE: f64 = 1e-4;

/// Configured t-SNE run. Build with [`TsneBuilder`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tsne {
    perplexity: f64,
    iterations: usize,
    learning_rate: f64,
    random_seed: u64,
}

impl Default for Tsne {
    fn default() -> Self {
        TsneBuilder::new().build()
    }
}

impl Tsne {
    pub fn perplexity(&self) -> f64 {
        self.perplexity
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn random_seed(&self) -> u64 {
        self.random_seed
    }

    /// Perplexity actually used for `n_samples` rows: at most `⌊(n−1)/3⌋`,
    /// never below 1.
    pub fn effective_perplexity(&self, n_samples: usize) -> f64 {
        let cap = (n_samples.saturating_sub(1) / 3) as f64;
        self.perplexity.min(cap).max(1.0)
    }

    fn validate(&self) -> Result<()> {
        if !self.perplexity.is_finite() || self.perplexity <= 0.0 {
            return Err(DimRedError::InvalidParameter(format!(
                "perplexity must be positive, got {}",
                self.perplexity
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
                "t-SNE needs at least one iteration".to_string(),
            ));
        }
        Ok(())
    }

    /// Embeds a standardized `n x p` matrix, seeding the layout from
    /// `random_seed`.
    pub fn fit_transform(&self, x: ArrayView2<f64>) -> Result<(Array2<f64>, TsneSummary)> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.random_seed);
        self.fit_transform_with_rng(x, &mut rng, &CancelToken::new())
    }

    /// Embeds a standardized `n x p` matrix using the given generator for the
    /// initial layout. `cancel` is checked before every iteration.
    ///
    /// # Returns
    /// - `Ok((layout, summary))`: `n x 2` coordinates centered on the origin
    /// - `Err(InsufficientData)`: fewer than 3 rows
    /// - `Err(Cancelled)`: the token was set before the run finished
    pub fn fit_transform_with_rng<R: Rng>(
        &self,
        x: ArrayView2<f64>,
        rng: &mut R,
        cancel: &CancelToken,
    ) -> Result<(Array2<f64>, TsneSummary)> {
        let (n_samples, n_features) = x.dim();
        if n_samples < 3 {
            return Err(DimRedError::insufficient(
                METHOD, 3, 1, n_samples, n_features,
            ));
        }
        self.validate()?;

        let perplexity = self.effective_perplexity(n_samples);
        if perplexity != self.perplexity {
            debug!(
                "t-SNE perplexity {} clamped to {} for {} samples",
                self.perplexity, perplexity, n_samples
            );
        }
        info!(
            "t-SNE on {}x{}: perplexity {}, {} iterations, learning rate {}",
            n_samples, n_features, perplexity, self.iterations, self.learning_rate
        );

        let distances = pairwise_distances(x, &SquaredEuclidean);
        let conditional = conditional_affinities(&distances, perplexity);
        let affinities = joint_affinities(&conditional);

        let mut layout =
            Array2::from_shape_fn((n_samples, 2), |_| rng.random_range(-INIT_SCALE..INIT_SCALE));

        let exaggeration_steps = (self.iterations / 10).min(MAX_EXAGGERATION_STEPS);
        let mut workspace = Workspace::new(n_samples);

        for iter in 0..self.iterations {
            cancel.check()?;

            let exaggeration = if iter < exaggeration_steps {
                EXAGGERATION
            } else {
                1.0
            };
            let momentum = momentum_at(iter);
            let learning_rate = decayed_learning_rate(self.learning_rate, iter, self.iterations);

            workspace.step(&affinities, &mut layout, exaggeration, momentum, learning_rate);

            if iter % 50 == 0 {
                trace!("t-SNE iteration {}/{}", iter, self.iterations);
            }
        }

        let kl_divergence = workspace.kl_divergence(&affinities, &layout);
        info!("t-SNE finished, KL divergence {:.5}", kl_divergence);

        Ok((
            layout,
            TsneSummary {
                effective_perplexity: perplexity,
                kl_divergence,
                iterations: self.iterations,
            },
        ))
    }
}

/// Builder for [`Tsne`].
///
/// Defaults: perplexity 30, 1000 iterations, learning rate 200, seed 42.
#[derive(Debug, Clone, Copy)]
pub struct TsneBuilder {
    perplexity: f64,
    iterations: usize,
    learning_rate: f64,
    random_seed: u64,
}

impl Default for TsneBuilder {
    fn default() -> Self {
        Self {
            perplexity: 30.0,
            iterations: 1000,
            learning_rate: 200.0,
            random_seed: 42,
        }
    }
}

impl TsneBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Target effective neighbourhood size. Values above `⌊(n−1)/3⌋` are
    /// clamped at run time.
    pub fn perplexity(mut self, perplexity: f64) -> Self {
        self.perplexity = perplexity;
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

    pub fn random_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    pub fn build(self) -> Tsne {
        Tsne {
            perplexity: self.perplexity,
            iterations: self.iterations,
            learning_rate: self.learning_rate,
            random_seed: self.random_seed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TsneSummary {
    pub effective_perplexity: f64,
    /// KL(P || Q) of the final layout, without exaggeration.
    pub kl_divergence: f64,
    pub iterations: usize,
}

/// Row-conditional Gaussian affinities `p_j|i`, each row calibrated to the
/// given perplexity. The diagonal is zero and every row sums to one.
pub(crate) fn conditional_affinities(distances: &Array2<f64>, perplexity: f64) -> Array2<f64> {
    let n = distances.nrows();
    let target = perplexity.ln();
    let tolerance = ENTROPY_TOLERANCE * target.abs().max(1.0);
    let mut p = Array2::zeros((n, n));
    let mut row_p: Vec<f64> = Vec::with_capacity(n);

    for i in 0..n {
        let row = distances.row(i);
        let d_min = (0..n)
            .filter(|&j| j != i)
            .map(|j| row[j])
            .fold(f64::INFINITY, f64::min);

        let mut beta = 1.0;
        let mut beta_lo = 0.0;
        let mut beta_hi = f64::INFINITY;
        for _ in 0..MAX_BISECTION_STEPS {
            let entropy = gaussian_row(row, i, d_min, beta, &mut row_p);
            let diff = entropy - target;
            if diff.abs() <= tolerance {
                break;
            }
            if diff > 0.0 {
                beta_lo = beta;
                beta = if beta_hi.is_infinite() {
                    beta * 2.0
                } else {
                    (beta + beta_hi) / 2.0
                };
            } else {
                beta_hi = beta;
                beta = (beta + beta_lo) / 2.0;
            }
        }

        gaussian_row(row, i, d_min, beta, &mut row_p);
        for (j, &v) in row_p.iter().enumerate() {
            p[[i, j]] = v;
        }
    }

    p
}

// Fills `out` with the normalized kernel for row `i` at precision `beta` and
// returns its Shannon entropy. Distances are shifted by the row minimum so the
// largest term is exp(0) and the sum never underflows.
fn gaussian_row(
    row: ArrayView1<f64>,
    i: usize,
    d_min: f64,
    beta: f64,
    out: &mut Vec<f64>,
) -> f64 {
    out.zero_len(row.len());
    let mut sum = 0.0;
    let mut weighted = 0.0;
    for (j, &d) in row.iter().enumerate() {
        if j == i {
            continue;
        }
        let shifted = d - d_min;
        let v = (-beta * shifted).exp();
        out[j] = v;
        sum += v;
        weighted += shifted * v;
    }
    for v in out.iter_mut() {
        *v /= sum;
    }
    sum.ln() + beta * weighted / sum
}

/// Symmetric joint affinities `(p_j|i + p_i|j) / 2n`, floored off the
/// diagonal.
pub(crate) fn joint_affinities(conditional: &Array2<f64>) -> Array2<f64> {
    let n = conditional.nrows();
    let scale = 2.0 * n as f64;
    Array2::from_shape_fn((n, n), |(i, j)| {
        if i == j {
            0.0
        } else {
            ((conditional[[i, j]] + conditional[[j, i]]) / scale).max(MIN_AFFINITY)
        }
    })
}

fn momentum_at(iter: usize) -> f64 {
    if iter < MOMENTUM_SWITCH {
        INITIAL_MOMENTUM
    } else {
        FINAL_MOMENTUM
    }
}

// Linear decay from `base` at the first iteration towards 10% of it.
fn decayed_learning_rate(base: f64, iter: usize, iterations: usize) -> f64 {
    let progress = iter as f64 / iterations as f64;
    base * (1.0 - (1.0 - FINAL_LEARNING_RATE_FRACTION) * progress)
}

// Rescales a per-point gradient whose norm exceeds MAX_GRADIENT_NORM.
fn clip_norm(gx: f64, gy: f64) -> (f64, f64) {
    let norm = (gx * gx + gy * gy).sqrt();
    if norm > MAX_GRADIENT_NORM {
        let scale = MAX_GRADIENT_NORM / norm;
        (gx * scale, gy * scale)
    } else {
        (gx, gy)
    }
}

/// Momentum update of one coordinate with an adaptive gain. Returns the new
/// `(velocity, gain)`; the coordinate moves by the returned velocity.
fn momentum_step(
    gradient: f64,
    velocity: f64,
    gain: f64,
    momentum: f64,
    learning_rate: f64,
) -> (f64, f64) {
    // A gradient pointing against the previous step grows the gain.
    let updated = if (gradient > 0.0) != (velocity > 0.0) {
        gain + 0.2
    } else {
        gain * 0.8
    };
    let gain = updated.max(MIN_GAIN);
    (momentum * velocity - learning_rate * gain * gradient, gain)
}

// Buffers reused across iterations.
struct Workspace {
    kernel: Array2<f64>,
    gradient: Array2<f64>,
    velocity: Array2<f64>,
    gains: Array2<f64>,
}

impl Workspace {
    fn new(n: usize) -> Self {
        Self {
            kernel: Array2::zeros((n, n)),
            gradient: Array2::zeros((n, 2)),
            velocity: Array2::zeros((n, 2)),
            gains: Array2::ones((n, 2)),
        }
    }

    // Student-t kernel 1 / (1 + |y_i - y_j|²); returns its sum over i != j.
    fn fill_kernel(&mut self, layout: &Array2<f64>) -> f64 {
        let n = layout.nrows();
        let mut sum = 0.0;
        for i in 0..n {
            self.kernel[[i, i]] = 0.0;
            for j in (i + 1)..n {
                let dx = layout[[i, 0]] - layout[[j, 0]];
                let dy = layout[[i, 1]] - layout[[j, 1]];
                let q = 1.0 / (1.0 + dx * dx + dy * dy);
                self.kernel[[i, j]] = q;
                self.kernel[[j, i]] = q;
                sum += 2.0 * q;
            }
        }
        sum.max(f64::MIN_POSITIVE)
    }

    fn step(
        &mut self,
        affinities: &Array2<f64>,
        layout: &mut Array2<f64>,
        exaggeration: f64,
        momentum: f64,
        learning_rate: f64,
    ) {
        let n = layout.nrows();
        let sum_q = self.fill_kernel(layout);

        for i in 0..n {
            let mut gx = 0.0;
            let mut gy = 0.0;
            for j in 0..n {
                if i == j {
                    continue;
                }
                let q = self.kernel[[i, j]];
                let mult = (exaggeration * affinities[[i, j]] - q / sum_q) * q;
                gx += mult * (layout[[i, 0]] - layout[[j, 0]]);
                gy += mult * (layout[[i, 1]] - layout[[j, 1]]);
            }
            let (gx, gy) = clip_norm(4.0 * gx, 4.0 * gy);
            self.gradient[[i, 0]] = gx;
            self.gradient[[i, 1]] = gy;
        }

        for ((g, v), (gain, y)) in self
            .gradient
            .iter()
            .zip(self.velocity.iter_mut())
            .zip(self.gains.iter_mut().zip(layout.iter_mut()))
        {
            let (velocity, updated_gain) = momentum_step(*g, *v, *gain, momentum, learning_rate);
            *v = velocity;
            *gain = updated_gain;
            *y += velocity;
        }

        if let Some(mean) = layout.mean_axis(Axis(0)) {
            *layout -= &mean;
        }
    }

    fn kl_divergence(&mut self, affinities: &Array2<f64>, layout: &Array2<f64>) -> f64 {
        let sum_q = self.fill_kernel(layout);
        let n = layout.nrows();
        let mut kl = 0.0;
        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                let p = affinities[[i, j]];
                let q = (self.kernel[[i, j]] / sum_q).max(MIN_AFFINITY);
                kl += p * (p / q).ln();
            }
        }
        kl
    }
}
