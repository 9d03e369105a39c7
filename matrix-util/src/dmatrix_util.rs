pub use nalgebra::{DMatrix, DVector};
pub use rand::rngs::StdRng;
pub use rand::{Rng, SeedableRng};
pub use rand_distr::StandardNormal;

use crate::traits::{MatOps, RowOps, SampleOps};

impl SampleOps for DMatrix<f32> {
    type Mat = Self;

    fn rnorm_seeded(dd: usize, nn: usize, seed: u64) -> Self::Mat {
        let mut rng = StdRng::seed_from_u64(seed);
        DMatrix::<f32>::from_fn(dd, nn, |_, _| rng.sample(StandardNormal))
    }
}

impl MatOps for DMatrix<f32> {
    type Mat = Self;
    type Scalar = f32;

    /// Y[,j] = X[,j] / max(1, norm(X[,j]))
    fn normalize_columns_inplace(&mut self) {
        for mut xx_j in self.column_iter_mut() {
            let denom = xx_j.norm().max(1.0);
            xx_j /= denom;
        }
    }

    fn normalize_columns(&self) -> Self::Mat {
        let mut ret = self.clone();
        ret.normalize_columns_inplace();
        ret
    }

    /// Z-score each column with the sample standard deviation
    /// (`n - 1` denominator). Moments are accumulated in `f64`; a
    /// column whose deviation is below `1e-6 · max(|mean|, 1)` is
    /// constant up to rounding and becomes all zeros.
    fn scale_columns_inplace(&mut self) {
        let nn = self.nrows();
        if nn == 0 {
            return;
        }
        let denom = (nn.max(2) - 1) as f64;
        for mut xx_j in self.column_iter_mut() {
            let mu = xx_j.iter().map(|&x| x as f64).sum::<f64>() / nn as f64;
            let ss: f64 = xx_j.iter().map(|&x| (x as f64 - mu).powi(2)).sum();
            let sig = (ss / denom).sqrt();
            if sig > 1e-6 * mu.abs().max(1.0) {
                xx_j.apply(|x| *x = ((*x as f64 - mu) / sig) as f32);
            } else {
                xx_j.fill(0.0);
            }
        }
    }

    fn scale_columns(&self) -> Self::Mat {
        let mut ret = self.clone();
        ret.scale_columns_inplace();
        ret
    }

    fn centre_columns_inplace(&mut self) {
        let nn = self.nrows();
        if nn == 0 {
            return;
        }
        for mut xx_j in self.column_iter_mut() {
            let mu = xx_j.sum() / nn as f32;
            xx_j.add_scalar_mut(-mu);
        }
    }

    fn centre_columns(&self) -> Self::Mat {
        let mut ret = self.clone();
        ret.centre_columns_inplace();
        ret
    }
}

impl RowOps for DMatrix<f32> {
    type Mat = Self;

    /// Rows with zero norm are left untouched
    fn normalize_rows_inplace(&mut self) {
        for mut xx_i in self.row_iter_mut() {
            let denom = xx_i.norm();
            if denom > 0.0 {
                xx_i /= denom;
            }
        }
    }
}

/// Take a subset of rows in the given order
pub fn select_rows(xx: &DMatrix<f32>, rows: &[usize]) -> DMatrix<f32> {
    DMatrix::<f32>::from_fn(rows.len(), xx.ncols(), |i, j| xx[(rows[i], j)])
}

/// Squared Euclidean distance between row `i` of `xx` and row `j` of `yy`
pub fn row_distance_sq(xx: &DMatrix<f32>, i: usize, yy: &DMatrix<f32>, j: usize) -> f32 {
    debug_assert_eq!(xx.ncols(), yy.ncols());
    (0..xx.ncols())
        .map(|k| {
            let d = xx[(i, k)] - yy[(j, k)];
            d * d
        })
        .sum()
}
