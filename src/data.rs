use ndarray::{Array1, Array2};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("Sample must have at least one input and one output value (got x={x_len}, y={y_len}).")]
    EmptySample { x_len: usize, y_len: usize },

    #[error(
        "Sample dimension mismatch: table holds x∈R^{expected_x}, y∈R^{expected_y} but sample has x∈R^{found_x}, y∈R^{found_y}."
    )]
    DimensionMismatch {
        expected_x: usize,
        expected_y: usize,
        found_x: usize,
        found_y: usize,
    },

    #[error("Sample {index} contains a non-finite value.")]
    NonFinite { index: usize },

    #[error("Dimension index {index} is out of range for a table with {dims} dimensions.")]
    DimensionOutOfRange { index: usize, dims: usize },
}

/// One observation `(x, y)`.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    x: Vec<f64>,
    y: Vec<f64>,
}

impl DataPoint {
    pub fn x(&self) -> &[f64] {
        &self.x
    }

    pub fn y(&self) -> &[f64] {
        &self.y
    }
}

/// Ordered, append-only collection of samples. The first sample fixes `dim_x`
/// and `dim_y`; every later sample must agree.
#[derive(Debug, Clone, Default)]
pub struct DataTable {
    samples: Vec<DataPoint>,
    dim_x: usize,
    dim_y: usize,
}

impl DataTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table from `(x, y)` pairs, stopping at the first invalid sample.
    pub fn from_samples<I>(samples: I) -> Result<Self, DataError>
    where
        I: IntoIterator<Item = (Vec<f64>, Vec<f64>)>,
    {
        let mut table = Self::new();
        for (x, y) in samples {
            table.add_sample(x, y)?;
        }
        Ok(table)
    }

    pub fn add_sample(&mut self, x: Vec<f64>, y: Vec<f64>) -> Result<(), DataError> {
        if x.is_empty() || y.is_empty() {
            return Err(DataError::EmptySample {
                x_len: x.len(),
                y_len: y.len(),
            });
        }
        if self.samples.is_empty() {
            self.dim_x = x.len();
            self.dim_y = y.len();
        } else if x.len() != self.dim_x || y.len() != self.dim_y {
            return Err(DataError::DimensionMismatch {
                expected_x: self.dim_x,
                expected_y: self.dim_y,
                found_x: x.len(),
                found_y: y.len(),
            });
        }
        if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
            return Err(DataError::NonFinite {
                index: self.samples.len(),
            });
        }
        self.samples.push(DataPoint { x, y });
        Ok(())
    }

    /// Convenience for one-dimensional data.
    pub fn add_sample_scalar(&mut self, x: f64, y: f64) -> Result<(), DataError> {
        self.add_sample(vec![x], vec![y])
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn dim_x(&self) -> usize {
        self.dim_x
    }

    pub fn dim_y(&self) -> usize {
        self.dim_y
    }

    pub fn samples(&self) -> impl ExactSizeIterator<Item = &DataPoint> + '_ {
        self.samples.iter()
    }

    pub fn x_column(&self, dim: usize) -> Result<Array1<f64>, DataError> {
        if dim >= self.dim_x {
            return Err(DataError::DimensionOutOfRange {
                index: dim,
                dims: self.dim_x,
            });
        }
        Ok(self.samples.iter().map(|s| s.x[dim]).collect())
    }

    /// Samples × dim_x matrix of inputs, rows in insertion order.
    pub fn x_matrix(&self) -> Array2<f64> {
        let mut out = Array2::zeros((self.samples.len(), self.dim_x));
        for (mut row, sample) in out.rows_mut().into_iter().zip(&self.samples) {
            for (dst, &src) in row.iter_mut().zip(&sample.x) {
                *dst = src;
            }
        }
        out
    }

    /// Samples × dim_y matrix of outputs, rows in insertion order.
    pub fn y_matrix(&self) -> Array2<f64> {
        let mut out = Array2::zeros((self.samples.len(), self.dim_y));
        for (mut row, sample) in out.rows_mut().into_iter().zip(&self.samples) {
            for (dst, &src) in row.iter_mut().zip(&sample.y) {
                *dst = src;
            }
        }
        out
    }

    /// Sorted distinct coordinates of input dimension `dim`.
    pub fn unique_sorted(&self, dim: usize) -> Result<Vec<f64>, DataError> {
        let mut values = self.x_column(dim)?.to_vec();
        values.sort_by(f64::total_cmp);
        values.dedup();
        Ok(values)
    }

    /// True when the samples cover every point of the grid spanned by the
    /// distinct per-dimension coordinates exactly once.
    pub fn is_grid_complete(&self) -> bool {
        if self.samples.is_empty() {
            return false;
        }
        let mut grid_size = 1usize;
        for dim in 0..self.dim_x {
            let Ok(unique) = self.unique_sorted(dim) else {
                return false;
            };
            grid_size = match grid_size.checked_mul(unique.len()) {
                Some(v) => v,
                None => return false,
            };
        }
        if grid_size != self.samples.len() {
            return false;
        }
        let mut points: Vec<&[f64]> = self.samples.iter().map(|s| s.x.as_slice()).collect();
        points.sort_by(|a, b| {
            a.iter()
                .zip(b.iter())
                .map(|(l, r)| l.total_cmp(r))
                .find(|o| o.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        points.windows(2).all(|w| w[0] != w[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_fixes_dimensions() {
        let mut table = DataTable::new();
        table.add_sample(vec![0.0, 1.0], vec![2.0]).unwrap();
        assert_eq!(table.dim_x(), 2);
        assert_eq!(table.dim_y(), 1);

        let err = table.add_sample(vec![0.0], vec![1.0]).unwrap_err();
        assert_eq!(
            err,
            DataError::DimensionMismatch {
                expected_x: 2,
                expected_y: 1,
                found_x: 1,
                found_y: 1
            }
        );
        assert_eq!(table.num_samples(), 1);
    }

    #[test]
    fn rejects_empty_and_non_finite_samples() {
        let mut table = DataTable::new();
        assert!(matches!(
            table.add_sample(vec![], vec![1.0]),
            Err(DataError::EmptySample { .. })
        ));
        assert!(matches!(
            table.add_sample(vec![f64::NAN], vec![1.0]),
            Err(DataError::NonFinite { index: 0 })
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn unique_sorted_removes_duplicates() {
        let table = DataTable::from_samples(vec![
            (vec![3.0], vec![0.0]),
            (vec![1.0], vec![0.0]),
            (vec![3.0], vec![1.0]),
            (vec![2.0], vec![0.0]),
        ])
        .unwrap();
        assert_eq!(table.unique_sorted(0).unwrap(), vec![1.0, 2.0, 3.0]);
        assert!(matches!(
            table.unique_sorted(1),
            Err(DataError::DimensionOutOfRange { index: 1, dims: 1 })
        ));
    }

    #[test]
    fn matrices_preserve_insertion_order() {
        let table = DataTable::from_samples(vec![
            (vec![1.0, 10.0], vec![5.0]),
            (vec![2.0, 20.0], vec![6.0]),
        ])
        .unwrap();
        let x = table.x_matrix();
        assert_eq!(x.shape(), &[2, 2]);
        assert_eq!(x[[1, 1]], 20.0);
        assert_eq!(table.y_matrix()[[0, 0]], 5.0);
    }

    #[test]
    fn grid_completeness() {
        let mut grid = DataTable::new();
        for &a in &[0.0, 1.0] {
            for &b in &[0.0, 0.5, 1.0] {
                grid.add_sample(vec![a, b], vec![a + b]).unwrap();
            }
        }
        assert!(grid.is_grid_complete());

        let scattered = DataTable::from_samples(vec![
            (vec![0.0, 0.0], vec![0.0]),
            (vec![1.0, 1.0], vec![0.0]),
        ])
        .unwrap();
        assert!(!scattered.is_grid_complete());
    }
}
