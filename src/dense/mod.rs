//! # Matrix preprocessing
//!
//! Dense sample x feature input with an explicit missing-value marker, plus the
//! column centering and z-scoring applied before each embedding method.
//!
//! Missing entries are substituted by `0.0` and still count toward `n` when the
//! column mean and population standard deviation are computed. Columns whose
//! standard deviation is (near) zero are divided by `1.0` instead, so a constant
//! column turns into a zero column rather than NaN.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;

use crate::error::{DimRedError, Result};

const MIN_STD_DEV: f64 = 1e-10;

/// Rectangular n x p matrix. `NaN` marks a missing entry; infinities are stored
/// as missing too.
#[derive(Debug, Clone, PartialEq)]
pub struct DataMatrix {
    values: Array2<f64>,
}

impl DataMatrix {
    pub fn new(mut values: Array2<f64>) -> Result<Self> {
        if values.ncols() == 0 {
            return Err(DimRedError::ShapeMismatch(
                "matrix must have at least one column".to_string(),
            ));
        }
        values.mapv_inplace(|v| if v.is_finite() { v } else { f64::NAN });
        Ok(Self { values })
    }

    /// Builds a matrix from rows where `None` is a missing entry.
    pub fn from_rows(rows: &[Vec<Option<f64>>]) -> Result<Self> {
        let n_cols = rows.first().map_or(0, |row| row.len());
        if let Some((idx, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != n_cols) {
            return Err(DimRedError::ShapeMismatch(format!(
                "row {} has {} entries, expected {}",
                idx,
                row.len(),
                n_cols
            )));
        }

        let flat: Vec<f64> = rows
            .iter()
            .flat_map(|row| row.iter().map(|v| v.unwrap_or(f64::NAN)))
            .collect();
        let values = Array2::from_shape_vec((rows.len(), n_cols), flat)
            .map_err(|e| DimRedError::ShapeMismatch(e.to_string()))?;
        Self::new(values)
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn is_missing(&self, row: usize, col: usize) -> bool {
        self.values[[row, col]].is_nan()
    }

    pub fn missing_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_nan()).count()
    }

    /// Copy of the given rows, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> DataMatrix {
        DataMatrix {
            values: self.values.select(Axis(0), rows),
        }
    }

    /// Values with missing entries replaced by `0.0`.
    pub fn filled(&self) -> Array2<f64> {
        self.values.mapv(fill_missing)
    }

    pub fn column_stats(&self) -> ColumnStats {
        column_stats(self.values.view())
    }

    pub fn preprocess(&self, mode: Preprocessing) -> Array2<f64> {
        let stats = self.column_stats();
        let mut x = self.filled();

        x.axis_iter_mut(Axis(0))
            .into_par_iter()
            .for_each(|mut row| {
                row -= &stats.mean;
            });

        if mode == Preprocessing::Standardize {
            let scale = stats.sanitized_std_dev();
            x.axis_iter_mut(Axis(0))
                .into_par_iter()
                .for_each(|mut row| {
                    row /= &scale;
                });
        }

        x
    }

    pub fn centered(&self) -> Array2<f64> {
        self.preprocess(Preprocessing::Center)
    }

    pub fn standardized(&self) -> Array2<f64> {
        self.preprocess(Preprocessing::Standardize)
    }
}

/// Which preprocessing a method expects. PCA works on centered data, t-SNE and
/// UMAP on z-scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preprocessing {
    Center,
    Standardize,
}

/// Per-column mean and population standard deviation.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnStats {
    pub mean: Array1<f64>,
    pub std_dev: Array1<f64>,
}

impl ColumnStats {
    /// Standard deviations with near-zero entries replaced by `1.0`.
    pub fn sanitized_std_dev(&self) -> Array1<f64> {
        self.std_dev
            .mapv(|s| if s.is_finite() && s >= MIN_STD_DEV { s } else { 1.0 })
    }
}

pub fn column_stats(x: ArrayView2<f64>) -> ColumnStats {
    let n = x.nrows();
    let p = x.ncols();
    if n == 0 {
        return ColumnStats {
            mean: Array1::zeros(p),
            std_dev: Array1::zeros(p),
        };
    }

    let n_f = n as f64;
    let mean: Array1<f64> = x
        .axis_iter(Axis(1))
        .map(|col| col.iter().map(|&v| fill_missing(v)).sum::<f64>() / n_f)
        .collect();
    let std_dev: Array1<f64> = x
        .axis_iter(Axis(1))
        .zip(mean.iter())
        .map(|(col, &m)| {
            let ss: f64 = col
                .iter()
                .map(|&v| {
                    let d = fill_missing(v) - m;
                    d * d
                })
                .sum();
            (ss / n_f).sqrt()
        })
        .collect();

    ColumnStats { mean, std_dev }
}

#[inline]
fn fill_missing(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_from_rows_rejects_ragged_input() {
        let rows = vec![vec![Some(1.0), Some(2.0)], vec![Some(3.0)]];
        let err = DataMatrix::from_rows(&rows).unwrap_err();
        assert!(matches!(err, DimRedError::ShapeMismatch(_)));
    }

    #[test]
    fn test_zero_columns_rejected() {
        let err = DataMatrix::new(Array2::zeros((3, 0))).unwrap_err();
        assert!(matches!(err, DimRedError::ShapeMismatch(_)));
    }

    #[test]
    fn test_infinite_values_become_missing() {
        let m = DataMatrix::new(array![[1.0, f64::INFINITY], [2.0, 3.0]]).unwrap();
        assert!(m.is_missing(0, 1));
        assert_eq!(m.missing_count(), 1);
    }

    #[test]
    fn test_missing_counts_as_zero_in_mean() {
        let rows = vec![
            vec![Some(2.0), Some(1.0)],
            vec![None, Some(1.0)],
            vec![Some(4.0), Some(1.0)],
        ];
        let m = DataMatrix::from_rows(&rows).unwrap();
        let stats = m.column_stats();

        // (2 + 0 + 4) / 3
        assert_relative_eq!(stats.mean[0], 2.0);
        assert_relative_eq!(stats.mean[1], 1.0);
        assert_relative_eq!(stats.std_dev[0], (8.0_f64 / 3.0).sqrt());
        assert_relative_eq!(stats.std_dev[1], 0.0);
    }

    #[test]
    fn test_centered_has_zero_column_means() {
        let m = DataMatrix::new(array![[1.0, 10.0], [2.0, 20.0], [6.0, 30.0]]).unwrap();
        let c = m.centered();
        for col in c.axis_iter(Axis(1)) {
            assert_relative_eq!(col.sum(), 0.0, epsilon = 1e-12);
        }
        assert_relative_eq!(c[[0, 1]], -10.0);
    }

    #[test]
    fn test_standardize_constant_column_is_zero() {
        let m = DataMatrix::new(array![
            [1.0, 7.0, 0.5],
            [2.0, 7.0, 0.1],
            [3.0, 7.0, 0.9],
            [4.0, 7.0, 0.3],
        ])
        .unwrap();
        let z = m.standardized();

        assert!(z.iter().all(|v| v.is_finite()));
        for i in 0..z.nrows() {
            assert_eq!(z[[i, 1]], 0.0);
        }
        let col0 = z.column(0);
        let var = col0.mapv(|v| v * v).sum() / col0.len() as f64;
        assert_relative_eq!(var, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_select_rows_keeps_order() {
        let m = DataMatrix::new(array![[1.0], [2.0], [3.0]]).unwrap();
        let s = m.select_rows(&[2, 0]);
        assert_eq!(s.view(), array![[3.0], [1.0]].view());
    }
}
