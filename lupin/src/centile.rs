use crate::cluster::ClusterAssignment;
use crate::common::*;
use crate::expression::ExpressionMatrix;

use indicatif::ParallelProgressIterator;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const MISSING_GROUP: &str = "NA";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CentileArgs {
    /// genes of interest, in report order
    pub genes: Vec<Box<str>>,
    /// metadata column used as the group label; cluster ids otherwise
    pub group_column: Option<Box<str>>,
    /// cells with a centile strictly above this are extracted
    pub threshold: u8,
}

impl Default for CentileArgs {
    fn default() -> Self {
        CentileArgs {
            genes: vec![],
            group_column: None,
            threshold: 95,
        }
    }
}

/// Percentile bin in `[1, 100]` of every cell.
///
/// Cells are ranked by ascending value; equal values are ordered by
/// cell identifier, then by position, so every cell gets its own rank.
/// Rank `r` of `n` falls in bin `ceil(100 r / n)`.
pub fn centile_bins(values: &[f32], cells: &[Box<str>]) -> Vec<u8> {
    let nn = values.len();
    debug_assert_eq!(nn, cells.len());

    let mut order: Vec<usize> = (0..nn).collect();
    order.sort_by(|&a, &b| {
        values[a]
            .total_cmp(&values[b])
            .then_with(|| cells[a].cmp(&cells[b]))
            .then(a.cmp(&b))
    });

    let mut bins = vec![0u8; nn];
    for (r, &j) in order.iter().enumerate() {
        let rank = r + 1;
        bins[j] = (rank * 100).div_ceil(nn) as u8;
    }
    bins
}

/// Read-only centile view of a set of genes over all retained cells
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CentileTable {
    pub genes: Vec<Box<str>>,
    pub cells: Vec<Box<str>>,
    pub group_column: Box<str>,
    pub groups: Vec<Box<str>>,
    /// `centiles[g][j]` for gene `g` and cell `j`
    pub centiles: Vec<Vec<u8>>,
}

impl CentileTable {
    fn gene_position(&self, gene: &str) -> anyhow::Result<usize> {
        self.genes
            .iter()
            .position(|g| g.as_ref() == gene)
            .ok_or_else(|| PipelineError::UnknownGene(gene.into()).into())
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn centiles_of(&self, gene: &str) -> anyhow::Result<&[u8]> {
        let g = self.gene_position(gene)?;
        Ok(&self.centiles[g])
    }

    /// Cell positions with `centile > threshold`, in cell order.
    ///
    /// The comparison is strict: a threshold of 95 selects bins 96 to
    /// 100, which is exactly 5 cells out of 100. Using `>=` would add
    /// bin 95 and select 6.
    pub fn crossing(&self, gene: &str, threshold: u8) -> anyhow::Result<Vec<usize>> {
        let g = self.gene_position(gene)?;
        Ok(self.centiles[g]
            .iter()
            .enumerate()
            .filter_map(|(j, &c)| (c > threshold).then_some(j))
            .collect())
    }

    /// Number of crossing cells per group
    pub fn group_counts(&self, gene: &str, threshold: u8) -> anyhow::Result<BTreeMap<Box<str>, usize>> {
        let mut ret = BTreeMap::new();
        for j in self.crossing(gene, threshold)? {
            *ret.entry(self.groups[j].clone()).or_insert(0) += 1;
        }
        Ok(ret)
    }

    /// Crossing cell identifiers per group
    pub fn group_listing(
        &self,
        gene: &str,
        threshold: u8,
    ) -> anyhow::Result<BTreeMap<Box<str>, Vec<Box<str>>>> {
        let mut ret: BTreeMap<Box<str>, Vec<Box<str>>> = BTreeMap::new();
        for j in self.crossing(gene, threshold)? {
            ret.entry(self.groups[j].clone())
                .or_default()
                .push(self.cells[j].clone());
        }
        Ok(ret)
    }

    /// cell, group, one centile column per gene
    pub fn to_lines(&self) -> Vec<Box<str>> {
        let mut hdr = vec!["cell".to_string(), self.group_column.to_string()];
        hdr.extend(self.genes.iter().map(|g| g.to_string()));
        let mut lines: Vec<Box<str>> = vec![hdr.join("\t").into_boxed_str()];
        for j in 0..self.num_cells() {
            let mut fields = vec![self.cells[j].to_string(), self.groups[j].to_string()];
            fields.extend(self.centiles.iter().map(|c| c[j].to_string()));
            lines.push(fields.join("\t").into_boxed_str());
        }
        lines
    }

    /// gene, threshold, group, count
    pub fn count_lines(&self, threshold: u8) -> anyhow::Result<Vec<Box<str>>> {
        let mut lines: Vec<Box<str>> = vec!["gene\tthreshold\tgroup\tcount".into()];
        for gene in &self.genes {
            for (group, n) in self.group_counts(gene, threshold)? {
                lines.push(format!("{}\t{}\t{}\t{}", gene, threshold, group, n).into_boxed_str());
            }
        }
        Ok(lines)
    }

    /// gene, threshold, group, cell
    pub fn cell_lines(&self, threshold: u8) -> anyhow::Result<Vec<Box<str>>> {
        let mut lines: Vec<Box<str>> = vec!["gene\tthreshold\tgroup\tcell".into()];
        for gene in &self.genes {
            for (group, cells) in self.group_listing(gene, threshold)? {
                for cell in cells {
                    lines.push(format!("{}\t{}\t{}\t{}", gene, threshold, group, cell).into_boxed_str());
                }
            }
        }
        Ok(lines)
    }
}

/// Group label per cell: a metadata column when named, cluster ids
/// otherwise. Empty annotations become `NA`.
pub fn resolve_groups(
    matrix: &ExpressionMatrix,
    group_column: Option<&str>,
    clusters: Option<&ClusterAssignment>,
) -> anyhow::Result<(Box<str>, Vec<Box<str>>)> {
    let (name, values): (Box<str>, Vec<Box<str>>) = match (group_column, clusters) {
        (Some(col), _) => {
            let values = matrix.metadata().column(col).ok_or_else(|| {
                anyhow::anyhow!(
                    "no metadata column `{}` (annotation columns: {})",
                    col,
                    matrix.metadata().annotation_columns.join(", ")
                )
            })?;
            (col.into(), values)
        }
        (None, Some(cl)) => (
            "cluster".into(),
            cl.labels.iter().map(|k| k.to_string().into_boxed_str()).collect(),
        ),
        (None, None) => ("group".into(), vec![MISSING_GROUP.into(); matrix.num_cells()]),
    };

    if values.len() != matrix.num_cells() {
        return Err(PipelineError::DimensionMismatch {
            what: format!("group column {}", name).into(),
            expected: format!("{} cells", matrix.num_cells()).into(),
            found: format!("{} labels", values.len()).into(),
        }
        .into());
    }

    let values = values
        .into_iter()
        .map(|v| if v.is_empty() { MISSING_GROUP.into() } else { v })
        .collect();
    Ok((name, values))
}

/// Centile bins of the requested genes over all cells of `normalized`
/// (genes × cells, columns aligned with `matrix`)
pub fn compute_centiles(
    matrix: &ExpressionMatrix,
    normalized: &CscMat,
    genes: &[Box<str>],
    group_column: &str,
    groups: Vec<Box<str>>,
) -> anyhow::Result<CentileTable> {
    if normalized.ncols() != matrix.num_cells() || groups.len() != matrix.num_cells() {
        return Err(PipelineError::DimensionMismatch {
            what: "centile input".into(),
            expected: format!("{} cells", matrix.num_cells()).into(),
            found: format!("{} columns, {} groups", normalized.ncols(), groups.len()).into(),
        }
        .into());
    }

    let mut unique: Vec<Box<str>> = vec![];
    for g in genes {
        if unique.contains(g) {
            warn!("gene {} listed twice; keeping the first", g);
        } else {
            unique.push(g.clone());
        }
    }

    let rows = unique
        .iter()
        .map(|g| {
            matrix
                .gene_index(g)
                .ok_or_else(|| anyhow::Error::from(PipelineError::UnknownGene(g.clone())))
        })
        .collect::<anyhow::Result<Vec<usize>>>()?;

    let cells = matrix.cells();
    let centiles: Vec<Vec<u8>> = rows
        .par_iter()
        .progress_count(rows.len() as u64)
        .map(|&r| centile_bins(&csc_row_dense(normalized, r), &cells))
        .collect();

    info!(
        "centiles of {} genes over {} cells, grouped by {}",
        unique.len(),
        cells.len(),
        group_column
    );

    Ok(CentileTable {
        genes: unique,
        cells,
        group_column: group_column.into(),
        groups,
        centiles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Box<str>> {
        (0..n).map(|i| format!("cell{:03}", i).into()).collect()
    }

    #[test]
    fn test_bins_cover_one_to_hundred() {
        let values: Vec<f32> = (1..=100).rev().map(|v| v as f32).collect();
        let bins = centile_bins(&values, &ids(100));
        // value 100 sits at position 0
        assert_eq!(bins[0], 100);
        assert_eq!(bins[99], 1);
        let mut sorted = bins.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (1..=100).collect::<Vec<u8>>());
    }

    #[test]
    fn test_uneven_count_and_max_in_top_bin() {
        let values = vec![0.5, 3.0, 1.0, 2.0, 0.0, 0.0, 9.0];
        let bins = centile_bins(&values, &ids(7));
        assert_eq!(bins[6], 100);
        assert!(bins.iter().all(|&b| (1..=100).contains(&b)));
        // ranks 1..7 of 7 -> ceil(100 r / 7)
        assert_eq!(bins[4], 15);
        assert_eq!(bins[5], 29);
    }

    #[test]
    fn test_ties_follow_cell_identifier() {
        let cells: Vec<Box<str>> = vec!["c".into(), "a".into(), "b".into(), "a".into()];
        let bins = centile_bins(&[0.0; 4], &cells);
        // a(1) < a(3) < b < c
        assert_eq!(bins, vec![100, 25, 75, 50]);
    }

    #[test]
    fn test_crossing_and_groups() {
        let n = 100;
        let values: Vec<f32> = (1..=n).map(|v| v as f32).collect();
        let cells = ids(n);
        let groups: Vec<Box<str>> = (0..n).map(|j| if j % 2 == 0 { "even".into() } else { "odd".into() }).collect();
        let table = CentileTable {
            genes: vec!["G".into()],
            cells: cells.clone(),
            group_column: "parity".into(),
            groups,
            centiles: vec![centile_bins(&values, &cells)],
        };

        let top = table.crossing("G", 95).expect("known gene");
        assert_eq!(top, vec![95, 96, 97, 98, 99]);
        assert!(top.contains(&99));

        let counts = table.group_counts("G", 95).expect("known gene");
        assert_eq!(counts.get("even"), Some(&2));
        assert_eq!(counts.get("odd"), Some(&3));

        let listing = table.group_listing("G", 95).expect("known gene");
        let expected: Vec<Box<str>> = vec!["cell096".into(), "cell098".into()];
        assert_eq!(listing["even"], expected);

        assert_eq!(table.to_lines().len(), n + 1);
        assert_eq!(table.count_lines(95).expect("lines").len(), 3);
        assert_eq!(table.cell_lines(95).expect("lines").len(), 6);

        let err = table.crossing("NOPE", 95).err().expect("unknown gene");
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::UnknownGene(_))
        ));
    }
}
