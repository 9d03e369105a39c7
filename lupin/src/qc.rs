use crate::common::*;
use crate::expression::{CellQcMetrics, ExpressionMatrix, DEFAULT_MITO_PREFIX};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Exclusive bounds on per-cell metrics
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct QcThresholds {
    /// keep cells with strictly more detected features
    pub min_features: usize,
    /// keep cells with strictly lower percent mitochondrial counts
    pub max_percent_mito: f32,
    /// keep cells with strictly lower total counts
    pub max_total_count: f32,
    /// gene symbol prefix of mitochondrial genes (case insensitive)
    pub mito_prefix: Box<str>,
}

impl Default for QcThresholds {
    fn default() -> Self {
        QcThresholds {
            min_features: 500,
            max_percent_mito: 15.0,
            max_total_count: 100_000.0,
            mito_prefix: DEFAULT_MITO_PREFIX.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum QcPredicate {
    MinFeatures,
    MaxPercentMito,
    MaxTotalCount,
}

impl fmt::Display for QcPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QcPredicate::MinFeatures => "detected_features",
            QcPredicate::MaxPercentMito => "percent_mito",
            QcPredicate::MaxTotalCount => "total_count",
        };
        write!(f, "{}", s)
    }
}

/// Predicates a cell violates; empty means the cell is kept
pub fn failed_predicates(m: &CellQcMetrics, th: &QcThresholds) -> Vec<QcPredicate> {
    let mut ret = vec![];
    if m.detected_features <= th.min_features {
        ret.push(QcPredicate::MinFeatures);
    }
    if m.percent_mito >= th.max_percent_mito {
        ret.push(QcPredicate::MaxPercentMito);
    }
    if m.total_count >= th.max_total_count {
        ret.push(QcPredicate::MaxTotalCount);
    }
    ret
}

#[derive(Clone, Debug, PartialEq)]
pub struct QcRecord {
    pub cell: Box<str>,
    pub metrics: CellQcMetrics,
    pub failed: Vec<QcPredicate>,
}

impl QcRecord {
    pub fn retained(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of every input cell
#[derive(Clone, Debug, PartialEq)]
pub struct QcReport {
    pub thresholds: QcThresholds,
    pub records: Vec<QcRecord>,
}

impl QcReport {
    pub fn num_before(&self) -> usize {
        self.records.len()
    }

    pub fn num_retained(&self) -> usize {
        self.records.iter().filter(|r| r.retained()).count()
    }

    /// Header plus one tab-separated line per input cell
    pub fn to_lines(&self) -> Vec<Box<str>> {
        let mut lines: Vec<Box<str>> =
            vec!["cell\ttotal_count\tdetected_features\tpercent_mito\tretained\tfailed".into()];
        for r in &self.records {
            let failed = r
                .failed
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(",");
            lines.push(
                format!(
                    "{}\t{}\t{}\t{:.4}\t{}\t{}",
                    r.cell,
                    r.metrics.total_count,
                    r.metrics.detected_features,
                    r.metrics.percent_mito,
                    r.retained(),
                    if failed.is_empty() { "." } else { failed.as_str() }
                )
                .into_boxed_str(),
            );
        }
        lines
    }
}

pub struct QcOutcome {
    pub matrix: ExpressionMatrix,
    pub report: QcReport,
}

/// Keep cells passing every predicate. Pure filter: retained cells keep
/// their counts and metrics unchanged.
pub fn qc_filter(matrix: &ExpressionMatrix, th: &QcThresholds) -> anyhow::Result<QcOutcome> {
    let relabelled;
    let matrix = if matrix.mito_prefix().eq_ignore_ascii_case(&th.mito_prefix) {
        matrix
    } else {
        info!(
            "QC: recomputing percent mitochondrial with prefix `{}` (matrix used `{}`)",
            th.mito_prefix,
            matrix.mito_prefix()
        );
        relabelled = matrix.with_mito_prefix(&th.mito_prefix);
        &relabelled
    };

    let cells = matrix.cells();
    let records: Vec<QcRecord> = matrix
        .cell_metrics()
        .iter()
        .zip(cells)
        .map(|(m, cell)| QcRecord {
            cell,
            metrics: *m,
            failed: failed_predicates(m, th),
        })
        .collect();

    let keep: Vec<usize> = records
        .iter()
        .enumerate()
        .filter_map(|(j, r)| r.retained().then_some(j))
        .collect();

    let n_before = matrix.num_cells();
    info!(
        "QC: {} -> {} cells (features > {}, mito < {}%, total < {})",
        n_before,
        keep.len(),
        th.min_features,
        th.max_percent_mito,
        th.max_total_count
    );

    if keep.is_empty() {
        return Err(PipelineError::EmptyAfterFilter {
            stage: "qc".into(),
            before: n_before,
            params: format!("{:?}", th).into(),
        }
        .into());
    }

    let filtered = matrix.subset_cells(&keep)?;

    Ok(QcOutcome {
        matrix: filtered,
        report: QcReport {
            thresholds: th.clone(),
            records,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{build_metadata, MetadataArgs};

    fn metrics(total: f32, features: usize, mito: f32) -> CellQcMetrics {
        CellQcMetrics {
            total_count: total,
            detected_features: features,
            percent_mito: mito,
        }
    }

    #[test]
    fn test_boundaries_are_exclusive() {
        let th = QcThresholds::default();
        assert!(failed_predicates(&metrics(5000.0, 501, 14.99), &th).is_empty());
        assert_eq!(
            failed_predicates(&metrics(5000.0, 500, 1.0), &th),
            vec![QcPredicate::MinFeatures]
        );
        assert_eq!(
            failed_predicates(&metrics(5000.0, 900, 15.0), &th),
            vec![QcPredicate::MaxPercentMito]
        );
        assert_eq!(
            failed_predicates(&metrics(100_000.0, 900, 1.0), &th),
            vec![QcPredicate::MaxTotalCount]
        );
        assert_eq!(failed_predicates(&metrics(100_000.0, 10, 50.0), &th).len(), 3);
    }

    #[test]
    fn test_thresholds_prefix_wins() -> anyhow::Result<()> {
        let cells: Vec<Box<str>> = vec!["D1.AC.1".into(), "D1.GT.1".into()];
        let meta = build_metadata(&cells, None, &MetadataArgs::default())?;
        let genes: Vec<Box<str>> = vec!["mt-co1".into(), "chrM-nd1".into(), "G1".into(), "G2".into()];
        // cell 0: half of its counts on chrM-nd1; cell 1: half on mt-co1
        let trip = vec![(1, 0, 2.0), (2, 0, 1.0), (3, 0, 1.0), (0, 1, 2.0), (2, 1, 1.0), (3, 1, 1.0)];
        let xx = ExpressionMatrix::from_triplets(genes, meta, &trip, "MT-")?;
        assert_eq!(xx.cell_metrics()[1].percent_mito, 50.0);

        let th = QcThresholds {
            min_features: 1,
            mito_prefix: "chrm-".into(),
            ..Default::default()
        };
        let out = qc_filter(&xx, &th)?;
        assert_eq!(out.report.records[0].metrics.percent_mito, 50.0);
        assert_eq!(out.report.records[0].failed, vec![QcPredicate::MaxPercentMito]);
        assert_eq!(out.report.records[1].metrics.percent_mito, 0.0);
        assert_eq!(out.matrix.cells()[0].as_ref(), "D1.GT.1");
        assert_eq!(out.matrix.mito_prefix(), "chrm-");
        Ok(())
    }

    #[test]
    fn test_filter_and_empty() -> anyhow::Result<()> {
        let cells: Vec<Box<str>> = vec!["D1.AC.1".into(), "D1.GT.1".into()];
        let meta = build_metadata(&cells, None, &MetadataArgs::default())?;
        let genes: Vec<Box<str>> = (0..4).map(|g| format!("G{}", g).into()).collect();
        // cell 0 detects four genes, cell 1 detects one
        let trip = vec![(0, 0, 1.0), (1, 0, 1.0), (2, 0, 1.0), (3, 0, 1.0), (0, 1, 5.0)];
        let xx = ExpressionMatrix::from_triplets(genes, meta, &trip, "MT-")?;

        let th = QcThresholds {
            min_features: 2,
            ..Default::default()
        };
        let out = qc_filter(&xx, &th)?;
        assert_eq!(out.matrix.num_cells(), 1);
        assert_eq!(out.matrix.cells()[0].as_ref(), "D1.AC.1");
        assert_eq!(out.report.num_before(), 2);
        assert_eq!(out.report.num_retained(), 1);
        assert_eq!(out.report.to_lines().len(), 3);

        let strict = QcThresholds {
            min_features: 4,
            ..Default::default()
        };
        let err = qc_filter(&xx, &strict).err().expect("all cells fail");
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::EmptyAfterFilter { before: 2, .. })
        ));
        Ok(())
    }
}
