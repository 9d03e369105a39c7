use crate::batch::{BatchPartition, BatchView};
use crate::common::*;
use crate::expression::ExpressionMatrix;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct NormalizeArgs {
    pub scale_factor: f32,
}

impl Default for NormalizeArgs {
    fn default() -> Self {
        NormalizeArgs {
            scale_factor: DEFAULT_SCALE_FACTOR,
        }
    }
}

/// Normalization state of one batch view; never shared across views
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BatchNormalization {
    pub batch: Box<str>,
    pub scale_factor: f32,
    /// total raw count of each cell of the view, in view order
    pub cell_totals: Vec<f32>,
}

/// `ln(1 + c / T * S)` for every stored entry, genes × cells in the
/// matrix column order
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedExpression {
    pub data: CscMat,
    pub per_batch: Vec<BatchNormalization>,
}

#[inline]
pub fn log_normalize(count: f32, total: f32, scale_factor: f32) -> f32 {
    if total > 0.0 {
        (count / total * scale_factor).ln_1p()
    } else {
        0.0
    }
}

type SparseColumn = (Vec<usize>, Vec<f32>);

/// Normalize the cells of one view using totals computed from the
/// view's own cells
pub fn normalize_view(
    view: &BatchView,
    args: &NormalizeArgs,
) -> (BatchNormalization, Vec<SparseColumn>) {
    let mut cell_totals = Vec::with_capacity(view.len());
    let mut columns = Vec::with_capacity(view.len());

    for k in 0..view.len() {
        let col = view.column(k);
        let total: f32 = col.values().iter().sum();
        let values = col
            .values()
            .iter()
            .map(|&c| log_normalize(c, total, args.scale_factor))
            .collect();
        cell_totals.push(total);
        columns.push((col.row_indices().to_vec(), values));
    }

    (
        BatchNormalization {
            batch: view.name.into(),
            scale_factor: args.scale_factor,
            cell_totals,
        },
        columns,
    )
}

/// Normalize every batch view in parallel and reassemble the columns in
/// the matrix order
pub fn normalize_batches(
    matrix: &ExpressionMatrix,
    partition: &BatchPartition,
    args: &NormalizeArgs,
) -> anyhow::Result<NormalizedExpression> {
    if args.scale_factor <= 0.0 || !args.scale_factor.is_finite() {
        anyhow::bail!("scale factor must be positive, got {}", args.scale_factor);
    }
    partition.check_cover()?;

    let views = partition.views(matrix);
    let results: Vec<(BatchNormalization, Vec<SparseColumn>)> = views
        .par_iter()
        .map(|view| normalize_view(view, args))
        .collect();

    let mut slots: Vec<Option<SparseColumn>> = vec![None; matrix.num_cells()];
    let mut per_batch = Vec::with_capacity(results.len());

    for (view, (state, columns)) in views.iter().zip(results) {
        for (&j, col) in view.cells.iter().zip(columns) {
            slots[j] = Some(col);
        }
        let n_zero = state.cell_totals.iter().filter(|&&t| t <= 0.0).count();
        if n_zero > 0 {
            warn!("batch {}: {} cells with zero total count", state.batch, n_zero);
        }
        per_batch.push(state);
    }

    let mut offsets = Vec::with_capacity(matrix.num_cells() + 1);
    let mut indices = vec![];
    let mut values = vec![];
    offsets.push(0);
    for (j, slot) in slots.into_iter().enumerate() {
        let (rows, vals) = slot.ok_or_else(|| anyhow::anyhow!("cell {} was not normalized", j))?;
        indices.extend(rows);
        values.extend(vals);
        offsets.push(indices.len());
    }

    let data = CscMat::try_from_csc_data(matrix.num_genes(), matrix.num_cells(), offsets, indices, values)
        .map_err(|e| anyhow::anyhow!("failed to assemble normalized matrix: {:?}", e))?;

    info!(
        "normalized {} cells in {} batches (scale factor {})",
        data.ncols(),
        per_batch.len(),
        args.scale_factor
    );

    Ok(NormalizedExpression { data, per_batch })
}
