//! # Embedding entry point
//!
//! Ties the pieces together for a rendering layer: pick the visible rows,
//! preprocess them the way the chosen method expects, run the engine and
//! attach row indices and group labels to the resulting coordinates.
//!
//! [`embed`] is the plain synchronous call. [`Embedder`] adds the
//! single-entry cache and can move the call onto a worker thread.

use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{anyhow, Context};
use log::{debug, info};
use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::cache::{label_digest, CacheKey, EmbeddingCache, MatrixFingerprint, MethodKey};
use crate::dense::{DataMatrix, Preprocessing};
use crate::dimred::pca::{Pca, PcaSummary};
use crate::dimred::tsne::{Tsne, TsneSummary};
use crate::dimred::umap::{Umap, UmapSummary};
use crate::error::{DimRedError, Result};
use crate::utils::{CancelToken, GroupIdentifier};

/// Embedding method together with its parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Method {
    Pca(Pca),
    Tsne(Tsne),
    Umap(Umap),
}

impl Default for Method {
    fn default() -> Self {
        Method::Pca(Pca::default())
    }
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Method::Pca(_) => crate::dimred::pca::METHOD,
            Method::Tsne(_) => crate::dimred::tsne::METHOD,
            Method::Umap(_) => crate::dimred::umap::METHOD,
        }
    }

    pub fn preprocessing(&self) -> Preprocessing {
        match self {
            Method::Pca(_) => Preprocessing::Center,
            Method::Tsne(_) | Method::Umap(_) => Preprocessing::Standardize,
        }
    }

    pub fn cache_key(&self) -> MethodKey {
        match self {
            Method::Pca(pca) => MethodKey::Pca {
                components: pca.components(),
                tolerance: pca.solver().tolerance().to_bits(),
                max_sweeps: pca.solver().max_sweeps(),
            },
            Method::Tsne(tsne) => MethodKey::Tsne {
                perplexity: tsne.perplexity().to_bits(),
                iterations: tsne.iterations(),
                learning_rate: tsne.learning_rate().to_bits(),
                seed: tsne.random_seed(),
            },
            Method::Umap(umap) => MethodKey::Umap {
                n_neighbors: umap.n_neighbors(),
                min_dist: umap.min_dist().to_bits(),
                iterations: umap.iterations(),
                learning_rate: umap.learning_rate().to_bits(),
                negative_samples: umap.negative_samples(),
                seed: umap.random_seed(),
            },
        }
    }
}

/// Which rows take part in an embedding.
#[derive(Debug, Clone, PartialEq)]
pub enum Visibility<G: GroupIdentifier> {
    All,
    /// One flag per input row.
    Mask(Vec<bool>),
    /// Rows whose label is in the set.
    Groups(HashSet<G>),
}

impl<G: GroupIdentifier> Default for Visibility<G> {
    fn default() -> Self {
        Visibility::All
    }
}

impl<G: GroupIdentifier> Visibility<G> {
    /// Ascending indices of the visible rows.
    pub fn resolve(&self, groups: &[G]) -> Result<Vec<usize>> {
        match self {
            Visibility::All => Ok((0..groups.len()).collect()),
            Visibility::Mask(mask) => {
                if mask.len() != groups.len() {
                    return Err(DimRedError::ShapeMismatch(format!(
                        "visibility mask has {} entries for {} rows",
                        mask.len(),
                        groups.len()
                    )));
                }
                Ok(mask
                    .iter()
                    .enumerate()
                    .filter_map(|(i, &visible)| visible.then_some(i))
                    .collect())
            }
            Visibility::Groups(visible) => Ok(groups
                .iter()
                .enumerate()
                .filter_map(|(i, g)| visible.contains(g).then_some(i))
                .collect()),
        }
    }
}

/// Method-specific diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub enum EmbeddingMetadata {
    Pca(PcaSummary),
    Tsne(TsneSummary),
    Umap(UmapSummary),
}

/// Two-dimensional layout of the visible rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding<G> {
    /// `m x 2` coordinates, one row per visible input row.
    pub coords: Array2<f64>,
    /// Input row index of each output row.
    pub rows: Vec<usize>,
    /// Group label of each output row.
    pub groups: Vec<G>,
    pub metadata: EmbeddingMetadata,
}

impl<G> Embedding<G> {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn method(&self) -> &'static str {
        match self.metadata {
            EmbeddingMetadata::Pca(_) => crate::dimred::pca::METHOD,
            EmbeddingMetadata::Tsne(_) => crate::dimred::tsne::METHOD,
            EmbeddingMetadata::Umap(_) => crate::dimred::umap::METHOD,
        }
    }
}

/// Embeds the visible rows of `data` with `method`.
///
/// # Arguments
/// * `data` - `n x p` matrix, missing entries as `NaN`
/// * `groups` - one label per row
/// * `method` - engine and parameters
/// * `visibility` - rows to include
/// * `cancel` - checked between iterations of t-SNE and UMAP
///
/// # Returns
/// - `Ok(Embedding)`: coordinates for the visible rows, in input order
/// - `Err(ShapeMismatch)`: label or mask length differs from `n`
/// - `Err(EmptySelection)`: no row is visible
/// - `Err(InsufficientData)`: too few visible rows or columns for the method
pub fn embed<G: GroupIdentifier>(
    data: &DataMatrix,
    groups: &[G],
    method: &Method,
    visibility: &Visibility<G>,
    cancel: &CancelToken,
) -> Result<Embedding<G>> {
    let rows = visible_rows(data, groups, visibility)?;
    compute(data, groups, method, rows, cancel)
}

fn visible_rows<G: GroupIdentifier>(
    data: &DataMatrix,
    groups: &[G],
    visibility: &Visibility<G>,
) -> Result<Vec<usize>> {
    if groups.len() != data.nrows() {
        return Err(DimRedError::ShapeMismatch(format!(
            "{} group labels for {} rows",
            groups.len(),
            data.nrows()
        )));
    }
    let rows = visibility.resolve(groups)?;
    if rows.is_empty() {
        return Err(DimRedError::EmptySelection);
    }
    Ok(rows)
}

fn compute<G: GroupIdentifier>(
    data: &DataMatrix,
    groups: &[G],
    method: &Method,
    rows: Vec<usize>,
    cancel: &CancelToken,
) -> Result<Embedding<G>> {
    cancel.check()?;

    let x = data
        .select_rows(&rows)
        .preprocess(method.preprocessing());
    info!(
        "embedding {} of {} rows ({} features) with {}",
        rows.len(),
        data.nrows(),
        data.ncols(),
        method.name()
    );

    let (coords, metadata) = match method {
        Method::Pca(pca) => {
            let (coords, summary) = pca.fit_transform(x.view())?;
            (coords, EmbeddingMetadata::Pca(summary))
        }
        Method::Tsne(tsne) => {
            let mut rng = ChaCha8Rng::seed_from_u64(tsne.random_seed());
            let (coords, summary) = tsne.fit_transform_with_rng(x.view(), &mut rng, cancel)?;
            (coords, EmbeddingMetadata::Tsne(summary))
        }
        Method::Umap(umap) => {
            let mut rng = ChaCha8Rng::seed_from_u64(umap.random_seed());
            let (coords, summary) = umap.fit_transform_with_rng(x.view(), &mut rng, cancel)?;
            (coords, EmbeddingMetadata::Umap(summary))
        }
    };

    let groups = rows.iter().map(|&r| groups[r].clone()).collect();
    Ok(Embedding {
        coords,
        rows,
        groups,
        metadata,
    })
}

/// Cached embedding front end. Clones share the same cache.
pub struct Embedder<G> {
    cache: Arc<EmbeddingCache<Embedding<G>>>,
}

impl<G> Clone for Embedder<G> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
        }
    }
}

impl<G> Default for Embedder<G> {
    fn default() -> Self {
        Self {
            cache: Arc::new(EmbeddingCache::new()),
        }
    }
}

impl<G: GroupIdentifier> Embedder<G> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Like [`embed`], but returns the cached embedding when method,
    /// parameters, visible rows, labels and matrix contents are unchanged.
    /// A fresh result replaces the cached one; failures leave it untouched.
    pub fn embed(
        &self,
        data: &DataMatrix,
        groups: &[G],
        method: &Method,
        visibility: &Visibility<G>,
        cancel: &CancelToken,
    ) -> Result<Arc<Embedding<G>>> {
        let rows = visible_rows(data, groups, visibility)?;
        let key = CacheKey {
            method: method.cache_key(),
            labels: label_digest(rows.iter().map(|&r| &groups[r])),
            visible_rows: rows.clone(),
            matrix: MatrixFingerprint::of(data),
        };
        self.cache
            .get_or_try_insert_with(key, || compute(data, groups, method, rows, cancel))
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn is_cached(&self) -> bool {
        !self.cache.is_empty()
    }
}

impl<G: GroupIdentifier + Send + Sync + 'static> Embedder<G> {
    /// Runs [`Embedder::embed`] on a dedicated thread. The returned job can
    /// cancel the run and collect its result.
    pub fn spawn(
        &self,
        data: DataMatrix,
        groups: Vec<G>,
        method: Method,
        visibility: Visibility<G>,
    ) -> anyhow::Result<EmbeddingJob<G>> {
        let cancel = CancelToken::new();
        let (sender, receiver) = mpsc::channel();
        let embedder = self.clone();
        let token = cancel.clone();

        let handle = std::thread::Builder::new()
            .name("embedding-worker".to_owned())
            .spawn(move || {
                debug!("embedding worker started for {}", method.name());
                let result = embedder.embed(&data, &groups, &method, &visibility, &token);
                // The job may have been dropped; nobody is waiting then.
                let _ = sender.send(result);
            })
            .context("failed to spawn embedding worker")?;

        Ok(EmbeddingJob {
            cancel,
            receiver,
            handle: Some(handle),
            delivered: None,
        })
    }
}

/// Handle to an embedding running on a worker thread. Dropping it cancels
/// the run.
pub struct EmbeddingJob<G> {
    cancel: CancelToken,
    receiver: mpsc::Receiver<Result<Arc<Embedding<G>>>>,
    handle: Option<JoinHandle<()>>,
    // Result already taken off the channel by a poll.
    delivered: Option<Result<Arc<Embedding<G>>>>,
}

impl<G> EmbeddingJob<G> {
    /// Asks the worker to stop at its next iteration boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Result of the run if it has finished, without blocking. Once a result
    /// has arrived every later poll, and [`EmbeddingJob::join`], returns it
    /// again.
    pub fn try_result(&mut self) -> Option<anyhow::Result<Arc<Embedding<G>>>> {
        if self.delivered.is_none() {
            match self.receiver.try_recv() {
                Ok(result) => self.delivered = Some(result),
                Err(mpsc::TryRecvError::Empty) => return None,
                Err(mpsc::TryRecvError::Disconnected) => {
                    return Some(Err(anyhow!("embedding worker exited without a result")))
                }
            }
        }
        self.delivered
            .clone()
            .map(|result| result.map_err(anyhow::Error::from))
    }

    /// Waits for the worker and returns its result.
    pub fn join(mut self) -> anyhow::Result<Arc<Embedding<G>>> {
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| anyhow!("embedding worker panicked"))?;
        }
        let result = match self.delivered.take() {
            Some(result) => result,
            None => self
                .receiver
                .recv()
                .context("embedding worker exited without a result")?,
        };
        Ok(result?)
    }
}

impl<G> Drop for EmbeddingJob<G> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimred::pca::PcaBuilder;
    use crate::dimred::tsne::TsneBuilder;
    use crate::dimred::umap::UmapBuilder;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn clusters() -> (DataMatrix, Vec<String>) {
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for i in 0..12 {
            let offset = if i < 6 { 0.0 } else { 10.0 };
            let jitter = (i % 6) as f64 * 0.1;
            rows.push(vec![
                Some(offset + jitter),
                Some(offset - jitter),
                Some(jitter * 2.0),
            ]);
            labels.push(if i < 6 { "a".to_string() } else { "b".to_string() });
        }
        (DataMatrix::from_rows(&rows).unwrap(), labels)
    }

    fn quick_tsne() -> Method {
        Method::Tsne(TsneBuilder::new().perplexity(3.0).iterations(150).build())
    }

    #[test]
    fn test_method_names_and_preprocessing() {
        assert_eq!(Method::default().name(), "pca");
        assert_eq!(quick_tsne().name(), "tsne");
        assert_eq!(Method::Umap(Umap::default()).name(), "umap");
        assert_eq!(Method::default().preprocessing(), Preprocessing::Center);
        assert_eq!(quick_tsne().preprocessing(), Preprocessing::Standardize);
    }

    #[test]
    fn test_cache_key_tracks_parameters() {
        let a = Method::Tsne(TsneBuilder::new().random_seed(1).build());
        let b = Method::Tsne(TsneBuilder::new().random_seed(2).build());
        assert_ne!(a.cache_key(), b.cache_key());
        assert_eq!(a.cache_key(), a.cache_key());
        assert_ne!(
            Method::Pca(PcaBuilder::new().components(0, 2).build()).cache_key(),
            Method::default().cache_key()
        );
    }

    #[test]
    fn test_visibility_resolution() {
        let labels = vec!["x", "y", "x", "z"];
        assert_eq!(Visibility::All.resolve(&labels).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(
            Visibility::Mask(vec![false, true, true, false])
                .resolve(&labels)
                .unwrap(),
            vec![1, 2]
        );
        let groups: HashSet<&str> = ["x", "z"].into_iter().collect();
        assert_eq!(
            Visibility::Groups(groups).resolve(&labels).unwrap(),
            vec![0, 2, 3]
        );
        assert!(matches!(
            Visibility::Mask(vec![true]).resolve(&labels),
            Err(DimRedError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_pca_embedding_maps_rows_and_labels() {
        let (data, labels) = clusters();
        let mut mask = vec![true; 12];
        mask[3] = false;
        mask[8] = false;

        let result = embed(
            &data,
            &labels,
            &Method::default(),
            &Visibility::Mask(mask),
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(result.len(), 10);
        assert_eq!(result.coords.dim(), (10, 2));
        assert!(!result.rows.contains(&3) && !result.rows.contains(&8));
        for (row, label) in result.rows.iter().zip(&result.groups) {
            assert_eq!(label, &labels[*row]);
        }
        match &result.metadata {
            EmbeddingMetadata::Pca(summary) => {
                let total: f64 = summary.variance_explained.iter().sum();
                assert_relative_eq!(total, 100.0, epsilon = 1e-6);
            }
            other => panic!("unexpected metadata {:?}", other),
        }
    }

    #[test]
    fn test_input_validation() {
        let (data, labels) = clusters();
        let cancel = CancelToken::new();

        let short = &labels[..5];
        assert!(matches!(
            embed(&data, short, &Method::default(), &Visibility::All, &cancel),
            Err(DimRedError::ShapeMismatch(_))
        ));

        assert_eq!(
            embed(
                &data,
                &labels,
                &Method::default(),
                &Visibility::Mask(vec![false; 12]),
                &cancel
            )
            .unwrap_err(),
            DimRedError::EmptySelection
        );

        let mut two = vec![false; 12];
        two[0] = true;
        two[7] = true;
        let err = embed(&data, &labels, &quick_tsne(), &Visibility::Mask(two), &cancel)
            .unwrap_err();
        assert!(err.is_insufficient_data());
    }

    #[test]
    fn test_embedder_reuses_cached_result() {
        let (data, labels) = clusters();
        let embedder = Embedder::new();
        let cancel = CancelToken::new();
        let method = quick_tsne();

        let first = embedder
            .embed(&data, &labels, &method, &Visibility::All, &cancel)
            .unwrap();
        let second = embedder
            .embed(&data, &labels, &method, &Visibility::All, &cancel)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let mut mask = vec![true; 12];
        mask[0] = false;
        let third = embedder
            .embed(&data, &labels, &method, &Visibility::Mask(mask), &cancel)
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(third.len(), 11);

        let relabelled: Vec<String> = labels.iter().map(|l| format!("{}!", l)).collect();
        let fourth = embedder
            .embed(&data, &relabelled, &method, &Visibility::All, &cancel)
            .unwrap();
        assert_eq!(fourth.groups, relabelled);
        assert_eq!(fourth.coords, first.coords);
    }

    #[test]
    fn test_cancelled_run_is_not_cached() {
        let (data, labels) = clusters();
        let embedder = Embedder::new();
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = embedder
            .embed(&data, &labels, &quick_tsne(), &Visibility::All, &cancel)
            .unwrap_err();
        assert_eq!(err, DimRedError::Cancelled);
        assert!(!embedder.is_cached());
    }

    #[test]
    fn test_spawned_job_delivers_result() {
        let (data, labels) = clusters();
        let embedder = Embedder::new();
        let method = Method::Umap(UmapBuilder::new().n_neighbors(4).iterations(50).build());

        let job = embedder
            .spawn(data.clone(), labels.clone(), method, Visibility::All)
            .unwrap();
        let result = job.join().unwrap();
        assert_eq!(result.method(), "umap");
        assert_eq!(result.coords.dim(), (12, 2));
        assert!(result.coords.iter().all(|v| v.is_finite()));

        // The worker filled the shared cache.
        let again = embedder
            .embed(&data, &labels, &method, &Visibility::All, &CancelToken::new())
            .unwrap();
        assert!(Arc::ptr_eq(&result, &again));
    }

    #[test]
    fn test_polled_result_is_kept_for_join() {
        let (data, labels) = clusters();
        let embedder = Embedder::new();
        let mut job = embedder
            .spawn(data, labels, Method::default(), Visibility::All)
            .unwrap();

        let first = loop {
            if let Some(result) = job.try_result() {
                break result.unwrap();
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        };
        let second = job.try_result().unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let joined = job.join().unwrap();
        assert!(Arc::ptr_eq(&first, &joined));
        assert_eq!(joined.method(), "pca");
    }

    #[test]
    fn test_polled_error_is_kept_for_join() {
        let (data, labels) = clusters();
        let embedder = Embedder::new();
        let mut job = embedder
            .spawn(data, labels, quick_tsne(), Visibility::Mask(vec![false; 12]))
            .unwrap();

        let first = loop {
            if let Some(result) = job.try_result() {
                break result;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        };
        assert_eq!(
            first.unwrap_err().downcast_ref::<DimRedError>(),
            Some(&DimRedError::EmptySelection)
        );
        assert!(job.try_result().unwrap().is_err());

        let err = job.join().unwrap_err();
        assert_eq!(
            err.downcast_ref::<DimRedError>(),
            Some(&DimRedError::EmptySelection)
        );
    }

    #[test]
    fn test_spawned_job_can_be_cancelled() {
        let (data, labels) = clusters();
        let embedder = Embedder::new();
        let method = Method::Tsne(
            TsneBuilder::new()
                .perplexity(3.0)
                .iterations(1_000_000)
                .build(),
        );

        let job = embedder
            .spawn(data, labels, method, Visibility::All)
            .unwrap();
        job.cancel();
        assert!(job.is_cancelled());

        let err = job.join().unwrap_err();
        assert_eq!(
            err.downcast_ref::<DimRedError>(),
            Some(&DimRedError::Cancelled)
        );
        assert!(!embedder.is_cached());
    }

    #[test]
    fn test_matrix_change_invalidates_cache() {
        let labels = vec![1u32, 1, 2, 2];
        let a = DataMatrix::new(array![[0.0, 1.0], [1.0, 0.0], [2.0, 3.0], [3.0, 1.0]]).unwrap();
        let b = DataMatrix::new(array![[0.0, 1.0], [1.0, 0.0], [2.0, 3.0], [3.0, 2.0]]).unwrap();
        let embedder = Embedder::new();
        let cancel = CancelToken::new();

        let first = embedder
            .embed(&a, &labels, &Method::default(), &Visibility::All, &cancel)
            .unwrap();
        let second = embedder
            .embed(&b, &labels, &Method::default(), &Visibility::All, &cancel)
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        embedder.clear_cache();
        assert!(!embedder.is_cached());
    }
}
