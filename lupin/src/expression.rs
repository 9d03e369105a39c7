use crate::common::*;
use crate::metadata::CellMetadata;

use fnv::FnvHashMap as HashMap;
use matrix_util::sparse_stat::column_totals_and_nnz;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MITO_PREFIX: &str = "MT-";

/// Derived per-cell quality metrics
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct CellQcMetrics {
    pub total_count: f32,
    pub detected_features: usize,
    pub percent_mito: f32,
}

/// Sparse gene × cell count matrix with cell metadata kept in lockstep
/// with the columns.
///
/// Genes are rows, cells are columns. The gene set is fixed for the
/// lifetime of the matrix; only the cell set changes, through
/// `subset_cells`, which returns a new matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct ExpressionMatrix {
    counts: CscMat,
    genes: Vec<Box<str>>,
    metadata: CellMetadata,
    is_mito: Vec<bool>,
    mito_prefix: Box<str>,
    cell_metrics: Vec<CellQcMetrics>,
    gene_index: HashMap<Box<str>, usize>,
}

/// Case-insensitive prefix match on gene symbols
pub fn is_mito_gene(symbol: &str, prefix: &str) -> bool {
    symbol.len() >= prefix.len()
        && symbol.is_char_boundary(prefix.len())
        && symbol[..prefix.len()].eq_ignore_ascii_case(prefix)
}

impl ExpressionMatrix {
    /// * `counts` - genes × cells
    /// * `genes` - unique gene symbols, one per row
    /// * `metadata` - one record per column
    /// * `mito_prefix` - symbol prefix of mitochondrial genes
    pub fn new(
        counts: CscMat,
        genes: Vec<Box<str>>,
        metadata: CellMetadata,
        mito_prefix: &str,
    ) -> anyhow::Result<Self> {
        if counts.nrows() != genes.len() {
            return Err(PipelineError::DimensionMismatch {
                what: "gene symbols".into(),
                expected: format!("{} rows", counts.nrows()).into(),
                found: format!("{} symbols", genes.len()).into(),
            }
            .into());
        }
        if counts.ncols() != metadata.len() {
            return Err(PipelineError::DimensionMismatch {
                what: "cell metadata".into(),
                expected: format!("{} columns", counts.ncols()).into(),
                found: format!("{} records", metadata.len()).into(),
            }
            .into());
        }
        if let Some(v) = counts.values().iter().find(|v| !v.is_finite() || **v < 0.0) {
            anyhow::bail!("counts must be finite and non-negative, found {}", v);
        }

        let mut gene_index: HashMap<Box<str>, usize> = HashMap::default();
        for (g, name) in genes.iter().enumerate() {
            if gene_index.insert(name.clone(), g).is_some() {
                anyhow::bail!("duplicate gene symbol `{}`", name);
            }
        }

        let is_mito: Vec<bool> = genes.iter().map(|g| is_mito_gene(g, mito_prefix)).collect();
        let cell_metrics = compute_cell_metrics(&counts, &is_mito);

        Ok(ExpressionMatrix {
            counts,
            genes,
            metadata,
            is_mito,
            mito_prefix: mito_prefix.into(),
            cell_metrics,
            gene_index,
        })
    }

    /// Build from `(gene, cell, count)` triplets
    pub fn from_triplets(
        genes: Vec<Box<str>>,
        metadata: CellMetadata,
        triplets: &[(usize, usize, f32)],
        mito_prefix: &str,
    ) -> anyhow::Result<Self> {
        let counts = csc_from_triplets(genes.len(), metadata.len(), triplets)?;
        Self::new(counts, genes, metadata, mito_prefix)
    }

    pub fn num_genes(&self) -> usize {
        self.genes.len()
    }

    pub fn num_cells(&self) -> usize {
        self.counts.ncols()
    }

    pub fn counts(&self) -> &CscMat {
        &self.counts
    }

    pub fn genes(&self) -> &[Box<str>] {
        &self.genes
    }

    pub fn cells(&self) -> Vec<Box<str>> {
        self.metadata.cells()
    }

    pub fn metadata(&self) -> &CellMetadata {
        &self.metadata
    }

    pub fn mito_prefix(&self) -> &str {
        &self.mito_prefix
    }

    pub fn cell_metrics(&self) -> &[CellQcMetrics] {
        &self.cell_metrics
    }

    pub fn num_mito_genes(&self) -> usize {
        self.is_mito.iter().filter(|&&m| m).count()
    }

    pub fn gene_index(&self, symbol: &str) -> Option<usize> {
        self.gene_index.get(symbol).copied()
    }

    /// Number of cells with a non-zero count per gene
    pub fn gene_detected_cells(&self) -> Vec<usize> {
        let mut ret = vec![0usize; self.num_genes()];
        for col in self.counts.col_iter() {
            for (&g, &v) in col.row_indices().iter().zip(col.values()) {
                if v > 0.0 {
                    ret[g] += 1;
                }
            }
        }
        ret
    }

    /// Total count per gene
    pub fn gene_totals(&self) -> Vec<f32> {
        let mut ret = vec![0.0f32; self.num_genes()];
        for col in self.counts.col_iter() {
            for (&g, &v) in col.row_indices().iter().zip(col.values()) {
                ret[g] += v;
            }
        }
        ret
    }

    /// The same counts with mitochondrial genes flagged by `prefix`
    /// and the per-cell metrics recomputed
    pub fn with_mito_prefix(&self, prefix: &str) -> Self {
        let is_mito: Vec<bool> = self.genes.iter().map(|g| is_mito_gene(g, prefix)).collect();
        let cell_metrics = compute_cell_metrics(&self.counts, &is_mito);
        ExpressionMatrix {
            counts: self.counts.clone(),
            genes: self.genes.clone(),
            metadata: self.metadata.clone(),
            is_mito,
            mito_prefix: prefix.into(),
            cell_metrics,
            gene_index: self.gene_index.clone(),
        }
    }

    /// A new matrix holding only the listed cells, in the given order.
    /// Counts, metadata and metrics move together.
    pub fn subset_cells(&self, cells: &[usize]) -> anyhow::Result<Self> {
        let counts = select_csc_columns(&self.counts, cells)?;
        let metadata = self.metadata.subset(cells)?;
        let cell_metrics = cells.iter().map(|&j| self.cell_metrics[j]).collect();
        Ok(ExpressionMatrix {
            counts,
            genes: self.genes.clone(),
            metadata,
            is_mito: self.is_mito.clone(),
            mito_prefix: self.mito_prefix.clone(),
            cell_metrics,
            gene_index: self.gene_index.clone(),
        })
    }
}

/// Total count, detected features and percent mitochondrial per cell
fn compute_cell_metrics(counts: &CscMat, is_mito: &[bool]) -> Vec<CellQcMetrics> {
    let (totals, nnz) = column_totals_and_nnz(counts);

    (0..counts.ncols())
        .into_par_iter()
        .map(|j| {
            let col = counts.col(j);
            let mito: f32 = col
                .row_indices()
                .iter()
                .zip(col.values())
                .filter(|&(&g, _)| is_mito[g])
                .map(|(_, &v)| v)
                .sum();
            let total = totals[j];
            let percent_mito = if total > 0.0 {
                (mito / total * 100.0).clamp(0.0, 100.0)
            } else {
                0.0
            };
            CellQcMetrics {
                total_count: total,
                detected_features: nnz[j],
                percent_mito,
            }
        })
        .collect()
}
