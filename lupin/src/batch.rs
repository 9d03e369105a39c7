use crate::common::*;
use crate::expression::ExpressionMatrix;

use matrix_util::utils::partition_by_membership;
use nalgebra_sparse::csc::CscCol;
use serde::{Deserialize, Serialize};

/// Cells sharing one donor label, as column positions into the
/// QC-filtered matrix
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Batch {
    pub name: Box<str>,
    pub cells: Vec<usize>,
}

/// Disjoint cover of the matrix columns by donor
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BatchPartition {
    pub batches: Vec<Batch>,
    pub num_cells: usize,
}

/// Read-only window onto the cells of one batch
pub struct BatchView<'a> {
    pub name: &'a str,
    pub cells: &'a [usize],
    matrix: &'a ExpressionMatrix,
}

impl<'a> BatchView<'a> {
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Raw counts of the `k`-th cell of this view
    pub fn column(&self, k: usize) -> CscCol<'a, f32> {
        self.matrix.counts().col(self.cells[k])
    }
}

impl BatchPartition {
    pub fn num_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn names(&self) -> Vec<Box<str>> {
        self.batches.iter().map(|b| b.name.clone()).collect()
    }

    pub fn view<'a>(&'a self, b: usize, matrix: &'a ExpressionMatrix) -> BatchView<'a> {
        let batch = &self.batches[b];
        BatchView {
            name: &batch.name,
            cells: &batch.cells,
            matrix,
        }
    }

    pub fn views<'a>(&'a self, matrix: &'a ExpressionMatrix) -> Vec<BatchView<'a>> {
        (0..self.num_batches()).map(|b| self.view(b, matrix)).collect()
    }

    /// Batch position of every cell
    pub fn batch_of_cells(&self) -> Vec<usize> {
        let mut ret = vec![usize::MAX; self.num_cells];
        for (b, batch) in self.batches.iter().enumerate() {
            for &j in &batch.cells {
                ret[j] = b;
            }
        }
        ret
    }

    /// Every cell appears in exactly one batch
    pub fn check_cover(&self) -> anyhow::Result<()> {
        let mut seen = vec![false; self.num_cells];
        for batch in &self.batches {
            for &j in &batch.cells {
                if j >= self.num_cells || seen[j] {
                    anyhow::bail!("cell {} is out of range or in two batches", j);
                }
                seen[j] = true;
            }
        }
        if let Some(j) = seen.iter().position(|&s| !s) {
            anyhow::bail!("cell {} is not in any batch", j);
        }
        Ok(())
    }
}

/// Group the matrix columns by donor. Batches are sorted by name and
/// list their cells in ascending column order.
pub fn partition_by_donor(matrix: &ExpressionMatrix) -> anyhow::Result<BatchPartition> {
    let donors = matrix.metadata().donors();
    let groups = partition_by_membership(&donors);

    let mut batches: Vec<Batch> = groups
        .into_iter()
        .map(|(name, cells)| Batch { name, cells })
        .collect();
    batches.sort_by(|a, b| a.name.cmp(&b.name));

    let ret = BatchPartition {
        batches,
        num_cells: matrix.num_cells(),
    };
    ret.check_cover()?;

    info!(
        "{} batches: {}",
        ret.num_batches(),
        ret.batches
            .iter()
            .map(|b| format!("{}({})", b.name, b.cells.len()))
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(ret)
}
