use crate::centile::CentileTable;
use crate::cluster::ClusterAssignment;
use crate::common::*;
use crate::expression::ExpressionMatrix;
use crate::integrate::IntegrationReport;
use crate::pipeline::PipelineState;

use matrix_util::common_io::{mkdir, write_lines};
use std::collections::BTreeSet;

/// `<prefix>.<suffix>`
pub fn output_file(prefix: &str, suffix: &str) -> String {
    format!("{}.{}", prefix, suffix)
}

fn write_output(lines: &[Box<str>], prefix: &str, suffix: &str) -> anyhow::Result<String> {
    let file = output_file(prefix, suffix);
    mkdir(&file)?;
    write_lines(lines, &file)?;
    info!("wrote {} ({} lines)", file, lines.len());
    Ok(file)
}

/// cell, donor, replicate, cluster
pub fn cluster_lines(
    matrix: &ExpressionMatrix,
    clusters: &ClusterAssignment,
) -> anyhow::Result<Vec<Box<str>>> {
    let records = &matrix.metadata().records;
    if records.len() != clusters.labels.len() {
        return Err(PipelineError::DimensionMismatch {
            what: format!("clustering {}", clusters.key).into(),
            expected: format!("{} cells", records.len()).into(),
            found: format!("{} labels", clusters.labels.len()).into(),
        }
        .into());
    }

    let mut lines: Vec<Box<str>> = vec!["cell\tdonor\treplicate\tcluster".into()];
    for ((rec, cell), k) in records.iter().zip(&clusters.cells).zip(&clusters.labels) {
        if rec.cell != *cell {
            anyhow::bail!("clustering is not aligned with the matrix at cell {}", cell);
        }
        lines.push(format!("{}\t{}\t{}\t{}", rec.cell, rec.donor, rec.replicate, k).into_boxed_str());
    }
    Ok(lines)
}

/// One row per batch pair: status `ok` or the reason it was skipped
pub fn integration_lines(report: &IntegrationReport) -> Vec<Box<str>> {
    let mut lines: Vec<Box<str>> =
        vec!["batch_a\tbatch_b\tstatus\trank\tn_anchors\tsingular_values".into()];
    for p in &report.pairs {
        let sv = p
            .singular_values
            .iter()
            .map(|s| format!("{:.4}", s))
            .collect::<Vec<_>>()
            .join(",");
        lines.push(
            format!("{}\t{}\tok\t{}\t{}\t{}", p.batch_a, p.batch_b, p.rank, p.n_anchors, sv)
                .into_boxed_str(),
        );
    }
    for f in &report.failures {
        if let PipelineError::InsufficientOverlap {
            batch_a,
            batch_b,
            reason,
        } = f
        {
            lines.push(format!("{}\t{}\t{}\t0\t0\t", batch_a, batch_b, reason).into_boxed_str());
        }
    }
    lines
}

/// `centile.tsv`, `centile_counts.tsv` and `centile_cells.tsv`
pub fn write_centile_outputs(
    table: &CentileTable,
    threshold: u8,
    prefix: &str,
) -> anyhow::Result<Vec<String>> {
    Ok(vec![
        write_output(&table.to_lines(), prefix, "centile.tsv")?,
        write_output(&table.count_lines(threshold)?, prefix, "centile_counts.tsv")?,
        write_output(&table.cell_lines(threshold)?, prefix, "centile_cells.tsv")?,
    ])
}

/// Write every table of a finished run under `prefix` and return the
/// file names in the order written
pub fn write_pipeline_outputs(
    state: &PipelineState,
    prefix: &str,
    checkpoint_suffix: &str,
) -> anyhow::Result<Vec<String>> {
    let mut files = vec![];

    let config_file = output_file(prefix, "config.json");
    state.config.to_json_file(&config_file)?;
    files.push(config_file);

    files.push(write_output(&state.qc.to_lines(), prefix, "qc.tsv")?);
    files.push(write_output(&state.features.to_lines(), prefix, "features.tsv")?);
    files.push(write_output(&state.pca.variance_lines(), prefix, "pca_variance.tsv")?);
    files.push(write_output(&state.pca.loading_lines(), prefix, "pca_loadings.tsv")?);
    files.push(write_output(
        &integration_lines(&state.integration),
        prefix,
        "integration.tsv",
    )?);
    files.push(write_output(
        &cluster_lines(&state.matrix, &state.clusters)?,
        prefix,
        "clusters.tsv",
    )?);

    let mut taken = BTreeSet::new();
    for emb in state.registry.embeddings() {
        let mut suffix = format!("embedding.{}.tsv", emb.key.method);
        if !taken.insert(suffix.clone()) {
            suffix = format!("embedding.{}.{}.tsv", emb.key.method, emb.key.scope);
            taken.insert(suffix.clone());
        }
        files.push(write_output(&emb.to_lines(), prefix, &suffix)?);
    }

    if let Some(table) = &state.centiles {
        files.extend(write_centile_outputs(table, state.config.centile.threshold, prefix)?);
    }

    let checkpoint_file = output_file(prefix, checkpoint_suffix);
    state.checkpoint().to_json_file(&checkpoint_file)?;
    files.push(checkpoint_file);

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrate::PairSummary;

    #[test]
    fn test_integration_lines() {
        let report = IntegrationReport {
            order: vec!["D1".into(), "D2".into(), "D3".into()],
            pairs: vec![PairSummary {
                batch_a: "D1".into(),
                batch_b: "D2".into(),
                rank: 3,
                n_anchors: 12,
                singular_values: vec![0.9, 0.5, 0.25],
            }],
            failures: vec![PipelineError::InsufficientOverlap {
                batch_a: "D1".into(),
                batch_b: "D3".into(),
                reason: "no anchors".into(),
            }],
            uncorrected_batches: vec![],
        };
        let lines = integration_lines(&report);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1].as_ref(), "D1\tD2\tok\t3\t12\t0.9000,0.5000,0.2500");
        assert!(lines[2].starts_with("D1\tD3\tno anchors"));
    }

    #[test]
    fn test_output_file_name() {
        assert_eq!(output_file("out/run1", "clusters.tsv"), "out/run1.clusters.tsv");
    }
}
