//! # Embedding cache
//!
//! Holds the most recently computed embedding together with the key it was
//! computed for. A lookup with any differing key component misses, and the
//! next insert replaces the entry wholesale. There is exactly one slot: the
//! cache serves a single scatter-plot viewport, not a history.

use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

use ahash::RandomState;
use log::debug;
use parking_lot::Mutex;

use crate::dense::DataMatrix;

// Fixed seeds make the digest deterministic within a build.
const FINGERPRINT_SEEDS: (u64, u64, u64, u64) = (
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
);

/// Method and every parameter that influences its output. Floats are stored as
/// their bit patterns so the key is `Eq + Hash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKey {
    Pca {
        components: (usize, usize),
        tolerance: u64,
        max_sweeps: usize,
    },
    Tsne {
        perplexity: u64,
        iterations: usize,
        learning_rate: u64,
        seed: u64,
    },
    Umap {
        n_neighbors: usize,
        min_dist: u64,
        iterations: usize,
        learning_rate: u64,
        negative_samples: usize,
        seed: u64,
    },
}

/// Cheap structural identity of a matrix: its shape plus a digest of every
/// value's bit pattern. The matrix itself is never retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatrixFingerprint {
    pub rows: usize,
    pub cols: usize,
    pub digest: u64,
}

fn fingerprint_hasher() -> ahash::AHasher {
    let (s0, s1, s2, s3) = FINGERPRINT_SEEDS;
    RandomState::with_seeds(s0, s1, s2, s3).build_hasher()
}

impl MatrixFingerprint {
    pub fn of(matrix: &DataMatrix) -> Self {
        let mut hasher = fingerprint_hasher();
        for &v in matrix.view().iter() {
            // All missing entries hash alike, whatever their NaN payload.
            let bits = if v.is_nan() { f64::NAN.to_bits() } else { v.to_bits() };
            hasher.write_u64(bits);
        }
        Self {
            rows: matrix.nrows(),
            cols: matrix.ncols(),
            digest: hasher.finish(),
        }
    }
}

/// Digest of the group labels of the visible rows, in row order.
pub fn label_digest<'a, G, I>(labels: I) -> u64
where
    G: Hash + 'a,
    I: IntoIterator<Item = &'a G>,
{
    let mut hasher = fingerprint_hasher();
    for label in labels {
        label.hash(&mut hasher);
    }
    hasher.finish()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub method: MethodKey,
    /// Input row indices that take part in the embedding, ascending.
    pub visible_rows: Vec<usize>,
    pub matrix: MatrixFingerprint,
    /// Labels travel with the cached embedding, so relabelling must miss.
    pub labels: u64,
}

/// Single-entry cache shared between the caller and worker threads.
pub struct EmbeddingCache<V> {
    slot: Mutex<Option<(CacheKey, Arc<V>)>>,
}

impl<V> Default for EmbeddingCache<V> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<V> EmbeddingCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<V>> {
        let slot = self.slot.lock();
        match slot.as_ref() {
            Some((cached, value)) if cached == key => Some(Arc::clone(value)),
            _ => None,
        }
    }

    /// Replaces whatever entry is cached.
    pub fn insert(&self, key: CacheKey, value: V) -> Arc<V> {
        let value = Arc::new(value);
        *self.slot.lock() = Some((key, Arc::clone(&value)));
        value
    }

    /// Returns the cached value for `key`, or runs `compute` and caches its
    /// result. The lock is not held while `compute` runs; errors are not
    /// cached.
    pub fn get_or_try_insert_with<E, F>(&self, key: CacheKey, compute: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(hit) = self.get(&key) {
            debug!("embedding cache hit for {:?}", key.method);
            return Ok(hit);
        }
        debug!("embedding cache miss for {:?}", key.method);
        let value = compute()?;
        Ok(self.insert(key, value))
    }

    pub fn clear(&self) {
        *self.slot.lock() = None;
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn key(seed: u64, rows: Vec<usize>, matrix: &DataMatrix) -> CacheKey {
        CacheKey {
            method: MethodKey::Tsne {
                perplexity: 30.0_f64.to_bits(),
                iterations: 100,
                learning_rate: 200.0_f64.to_bits(),
                seed,
            },
            visible_rows: rows,
            matrix: MatrixFingerprint::of(matrix),
            labels: label_digest(["a", "b"].iter()),
        }
    }

    #[test]
    fn test_fingerprint_tracks_values_and_shape() {
        let a = DataMatrix::new(array![[1.0, 2.0], [3.0, 4.0]]).unwrap();
        let b = DataMatrix::new(array![[1.0, 2.0], [3.0, 4.5]]).unwrap();
        let c = DataMatrix::new(array![[1.0, 2.0, 3.0, 4.0]]).unwrap();

        assert_eq!(MatrixFingerprint::of(&a), MatrixFingerprint::of(&a.clone()));
        assert_ne!(MatrixFingerprint::of(&a), MatrixFingerprint::of(&b));
        assert_ne!(MatrixFingerprint::of(&a), MatrixFingerprint::of(&c));
    }

    #[test]
    fn test_missing_entries_fingerprint_alike() {
        let a = DataMatrix::from_rows(&[vec![None, Some(1.0)]]).unwrap();
        let b = DataMatrix::new(array![[f64::INFINITY, 1.0]]).unwrap();
        assert_eq!(MatrixFingerprint::of(&a), MatrixFingerprint::of(&b));
    }

    #[test]
    fn test_label_digest_is_order_sensitive() {
        let ab = label_digest(["a".to_string(), "b".to_string()].iter());
        let ba = label_digest(["b".to_string(), "a".to_string()].iter());
        assert_eq!(ab, label_digest(["a".to_string(), "b".to_string()].iter()));
        assert_ne!(ab, ba);
    }

    #[test]
    fn test_hit_and_miss() {
        let m = DataMatrix::new(array![[1.0], [2.0], [3.0]]).unwrap();
        let cache: EmbeddingCache<u32> = EmbeddingCache::new();
        assert!(cache.is_empty());

        let mut calls = 0;
        let first = cache
            .get_or_try_insert_with::<(), _>(key(1, vec![0, 1, 2], &m), || {
                calls += 1;
                Ok(7)
            })
            .unwrap();
        let second = cache
            .get_or_try_insert_with::<(), _>(key(1, vec![0, 1, 2], &m), || {
                calls += 1;
                Ok(8)
            })
            .unwrap();
        assert_eq!(*first, 7);
        assert_eq!(*second, 7);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_any_key_change_replaces_entry() {
        let m = DataMatrix::new(array![[1.0], [2.0], [3.0]]).unwrap();
        let cache: EmbeddingCache<u32> = EmbeddingCache::new();
        cache.insert(key(1, vec![0, 1, 2], &m), 1);

        assert!(cache.get(&key(2, vec![0, 1, 2], &m)).is_none());
        assert!(cache.get(&key(1, vec![0, 2], &m)).is_none());

        cache.insert(key(1, vec![0, 2], &m), 2);
        assert!(cache.get(&key(1, vec![0, 1, 2], &m)).is_none());
        assert_eq!(*cache.get(&key(1, vec![0, 2], &m)).unwrap(), 2);
    }

    #[test]
    fn test_errors_are_not_cached() {
        let m = DataMatrix::new(array![[1.0]]).unwrap();
        let cache: EmbeddingCache<u32> = EmbeddingCache::new();
        let err = cache.get_or_try_insert_with(key(1, vec![0], &m), || Err("boom"));
        assert_eq!(err, Err("boom"));
        assert!(cache.is_empty());

        cache.insert(key(1, vec![0], &m), 3);
        cache.clear();
        assert!(cache.is_empty());
    }
}
