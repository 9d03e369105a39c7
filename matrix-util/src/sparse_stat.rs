use crate::traits::RunningStatOps;
use nalgebra_sparse::CscMatrix;
use num_traits::{Float, Zero};
use std::iter::Sum;
use std::ops::AddAssign;

/// Running statistics that accepts sparse column input but stores
/// sufficient statistics in dense vectors, one slot per row.
///
/// Columns are observations (cells) and rows are features (genes).
/// Implicit zeros count toward the number of observations.
///
#[derive(Clone)]
pub struct SparseRunningStatistics<T>
where
    T: Float,
{
    nrows: usize,
    ncols_processed: usize,
    npos: Vec<T>,
    s1: Vec<T>,
    s2: Vec<T>,
}

impl<T> SparseRunningStatistics<T>
where
    T: Float + AddAssign + Sum + Zero,
{
    /// Create a new SparseRunningStatistics object
    ///
    /// # Arguments
    /// * `nrows` - Number of rows (features)
    ///
    pub fn new(nrows: usize) -> Self {
        SparseRunningStatistics {
            nrows,
            ncols_processed: 0,
            npos: vec![T::zero(); nrows],
            s1: vec![T::zero(); nrows],
            s2: vec![T::zero(); nrows],
        }
    }

    /// Add a sparse column to the running statistics
    ///
    /// # Arguments
    /// * `row_indices` - Row indices of non-zero values
    /// * `values` - Non-zero values
    ///
    pub fn add_sparse_column(&mut self, row_indices: &[usize], values: &[T]) {
        debug_assert_eq!(row_indices.len(), values.len());

        for (&row, &val) in row_indices.iter().zip(values.iter()) {
            if val.is_finite() {
                if val > T::zero() {
                    self.npos[row] += T::one();
                }
                self.s1[row] += val;
                self.s2[row] += val * val;
            }
        }
        self.ncols_processed += 1;
    }

    /// Add columns from a CscMatrix, widening the stored values to
    /// the accumulator type (e.g. `f32` data into `f64` sums)
    ///
    /// # Arguments
    /// * `csc` - Sparse matrix in CSC format
    ///
    pub fn add_csc<S>(&mut self, csc: &CscMatrix<S>)
    where
        S: Copy,
        T: From<S>,
    {
        debug_assert_eq!(csc.nrows(), self.nrows);
        let mut values: Vec<T> = vec![];
        for col in csc.col_iter() {
            values.clear();
            values.extend(col.values().iter().map(|&v| <T as From<S>>::from(v)));
            self.add_sparse_column(col.row_indices(), &values);
        }
    }

    /// Number of rows
    pub fn nrows(&self) -> usize {
        self.nrows
    }

    /// Number of columns processed so far
    pub fn ncols_processed(&self) -> usize {
        self.ncols_processed
    }

    fn denom(&self) -> T {
        let n = T::from(self.ncols_processed).unwrap_or(T::one());
        if n > T::zero() {
            n
        } else {
            T::one()
        }
    }

    /// Unbiased variance per row (`n - 1` denominator)
    pub fn sample_variance(&self) -> Vec<T> {
        let n = self.denom();
        let n1 = if n > T::one() { n - T::one() } else { T::one() };
        self.s1
            .iter()
            .zip(self.s2.iter())
            .map(|(&s1, &s2)| {
                let v = (s2 - s1 * s1 / n) / n1;
                v.max(T::zero())
            })
            .collect()
    }
}

/// Per-column totals and number of non-zero entries
pub fn column_totals_and_nnz<T>(csc: &CscMatrix<T>) -> (Vec<T>, Vec<usize>)
where
    T: Float + Sum,
{
    csc.col_iter()
        .map(|col| {
            let tot: T = col.values().iter().copied().filter(|v| v.is_finite()).sum();
            let nnz = col.values().iter().filter(|&&v| v > T::zero()).count();
            (tot, nnz)
        })
        .unzip()
}

impl<T> RunningStatOps<T> for SparseRunningStatistics<T>
where
    T: Float + AddAssign + Sum + Zero,
{
    type Output = Vec<T>;

    fn clear(&mut self) {
        self.ncols_processed = 0;
        self.npos.fill(T::zero());
        self.s1.fill(T::zero());
        self.s2.fill(T::zero());
    }

    /// Count of positive (non-zero) values per row
    fn count_positives(&self) -> Vec<T> {
        self.npos.clone()
    }

    /// Sum per row
    fn sum(&self) -> Vec<T> {
        self.s1.clone()
    }

    /// Mean per row
    /// Uses ncols_processed as the denominator (implicit zeros count)
    fn mean(&self) -> Vec<T> {
        let n = self.denom();
        self.s1.iter().map(|&s| s / n).collect()
    }

    /// Population variance per row
    fn variance(&self) -> Vec<T> {
        let n = self.denom();
        self.s1
            .iter()
            .zip(self.s2.iter())
            .map(|(&s1, &s2)| {
                let mu = s1 / n;
                (s2 / n - mu * mu).max(T::zero())
            })
            .collect()
    }

    fn std(&self) -> Vec<T> {
        self.variance().into_iter().map(|v| v.sqrt()).collect()
    }
}
