pub use log::{debug, info, warn};

pub use crate::error::{Exclusion, PipelineError};

pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_SCALE_FACTOR: f32 = 10_000.0;
pub const DEFAULT_N_FEATURES: usize = 5000;
pub const DEFAULT_N_PCS: usize = 30;
pub const DEFAULT_N_DIMS: usize = 15;
pub const DEFAULT_KNN: usize = 20;
pub const DEFAULT_RESOLUTION: f64 = 0.5;
pub const DEFAULT_BLOCK_SIZE: usize = 256;

pub type Mat = nalgebra::DMatrix<f32>;
pub type CscMat = nalgebra_sparse::CscMatrix<f32>;

/// Take a subset of columns of a CSC matrix in the given order
pub fn select_csc_columns(xx: &CscMat, columns: &[usize]) -> anyhow::Result<CscMat> {
    let mut offsets = Vec::with_capacity(columns.len() + 1);
    let mut indices = vec![];
    let mut values = vec![];
    offsets.push(0);
    for &j in columns {
        if j >= xx.ncols() {
            anyhow::bail!("column {} out of range ({} columns)", j, xx.ncols());
        }
        let col = xx.col(j);
        indices.extend_from_slice(col.row_indices());
        values.extend_from_slice(col.values());
        offsets.push(indices.len());
    }
    CscMat::try_from_csc_data(xx.nrows(), columns.len(), offsets, indices, values)
        .map_err(|e| anyhow::anyhow!("failed to build CSC matrix: {:?}", e))
}

/// Dense row of a CSC matrix (genes × cells), one value per cell
pub fn csc_row_dense(xx: &CscMat, row: usize) -> Vec<f32> {
    let mut ret = vec![0.0; xx.ncols()];
    for (j, col) in xx.col_iter().enumerate() {
        if let Ok(k) = col.row_indices().binary_search(&row) {
            ret[j] = col.values()[k];
        }
    }
    ret
}

/// Sparse triplets `(row, col, value)` in column-major order
pub fn csc_triplets(xx: &CscMat) -> Vec<(usize, usize, f32)> {
    xx.col_iter()
        .enumerate()
        .flat_map(|(j, col)| {
            col.row_indices()
                .iter()
                .zip(col.values().iter())
                .map(move |(&i, &v)| (i, j, v))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Build a CSC matrix from triplets; zeros are dropped and duplicate
/// entries are summed
pub fn csc_from_triplets(
    nrows: usize,
    ncols: usize,
    triplets: &[(usize, usize, f32)],
) -> anyhow::Result<CscMat> {
    let mut coo = nalgebra_sparse::CooMatrix::new(nrows, ncols);
    for &(i, j, v) in triplets {
        if i >= nrows || j >= ncols {
            return Err(PipelineError::DimensionMismatch {
                what: format!("triplet ({}, {})", i, j).into(),
                expected: format!("[{} x {}]", nrows, ncols).into(),
                found: format!("({}, {})", i, j).into(),
            }
            .into());
        }
        if v != 0.0 {
            coo.push(i, j, v);
        }
    }
    Ok(CscMat::from(&coo))
}
