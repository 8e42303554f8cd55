use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use num_traits::Float;
use rayon::prelude::*;

pub trait DistanceMeasure {
    fn calculate<T: Float>(&self, a: ArrayView1<T>, b: ArrayView1<T>) -> T;
}

pub struct SquaredEuclidean;

impl DistanceMeasure for SquaredEuclidean {
    fn calculate<T: Float>(&self, a: ArrayView1<T>, b: ArrayView1<T>) -> T {
        a.iter().zip(b.iter()).fold(T::zero(), |acc, (&x, &y)| {
            let diff = x - y;
            acc + diff * diff
        })
    }
}

pub struct Euclidean;

impl DistanceMeasure for Euclidean {
    fn calculate<T: Float>(&self, a: ArrayView1<T>, b: ArrayView1<T>) -> T {
        SquaredEuclidean.calculate(a, b).sqrt()
    }
}

/// Symmetric n x n matrix of `measure` between every pair of rows, zero on the
/// diagonal. Rows are filled in parallel; every cell is computed on its own, so
/// the result does not depend on scheduling.
pub fn pairwise_distances<T, D>(data: ArrayView2<T>, measure: &D) -> Array2<T>
where
    T: Float + Send + Sync,
    D: DistanceMeasure + Sync,
{
    let n = data.nrows();
    let mut out = Array2::from_elem((n, n), T::zero());
    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut row)| {
            let a = data.row(i);
            for j in 0..n {
                if i != j {
                    row[j] = measure.calculate(a, data.row(j));
                }
            }
        });
    out
}

/// The `k` nearest other rows of each row as `(index, distance)`, closest
/// first. Ties keep the lower index first.
pub fn k_nearest<T: Float>(distances: ArrayView2<T>, k: usize) -> Vec<Vec<(usize, T)>> {
    let n = distances.nrows();
    let mut order: Vec<usize> = Vec::with_capacity(n);

    (0..n)
        .map(|i| {
            let row = distances.row(i);
            order.clear();
            order.extend((0..n).filter(|&j| j != i));
            order.sort_by(|&a, &b| {
                row[a]
                    .partial_cmp(&row[b])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            order.iter().take(k).map(|&j| (j, row[j])).collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_squared_euclidean() {
        let a = array![0.0, 0.0];
        let b = array![3.0, 4.0];
        assert_eq!(SquaredEuclidean.calculate(a.view(), b.view()), 25.0);
        assert_eq!(Euclidean.calculate(a.view(), b.view()), 5.0);
    }

    #[test]
    fn test_pairwise_is_symmetric_with_zero_diagonal() {
        let data = array![[0.0, 0.0], [1.0, 0.0], [0.0, 2.0], [1.0, 1.0]];
        let d = pairwise_distances(data.view(), &SquaredEuclidean);

        assert_eq!(d.dim(), (4, 4));
        for i in 0..4 {
            assert_eq!(d[[i, i]], 0.0);
            for j in 0..4 {
                assert_relative_eq!(d[[i, j]], d[[j, i]]);
            }
        }
        assert_relative_eq!(d[[1, 2]], 5.0);
    }

    #[test]
    fn test_k_nearest_excludes_self_and_sorts() {
        let data = array![[0.0], [1.0], [3.0], [10.0]];
        let d = pairwise_distances(data.view(), &Euclidean);
        let knn = k_nearest(d.view(), 2);

        assert_eq!(knn.len(), 4);
        assert_eq!(knn[0], vec![(1, 1.0), (2, 3.0)]);
        assert_eq!(knn[2], vec![(1, 2.0), (0, 3.0)]);
        assert_eq!(knn[3], vec![(2, 7.0), (1, 9.0)]);
    }

    #[test]
    fn test_k_nearest_tie_keeps_lower_index() {
        let data = array![[0.0], [-1.0], [1.0]];
        let d = pairwise_distances(data.view(), &Euclidean);
        let knn = k_nearest(d.view(), 1);
        assert_eq!(knn[0], vec![(1, 1.0)]);
    }
}
