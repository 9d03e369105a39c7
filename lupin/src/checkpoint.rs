use crate::cluster::ClusterAssignment;
use crate::common::*;
use crate::config::PipelineConfig;
use crate::embedding::{Embedding, EmbeddingKey, Registry};
use crate::expression::ExpressionMatrix;
use crate::metadata::CellMetadata;

use matrix_util::common_io::{mkdir, open_buf_reader, open_buf_writer};
use serde::{Deserialize, Serialize};
use std::io::Write;

const CHECKPOINT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
struct MatrixSnapshot {
    genes: Vec<Box<str>>,
    metadata: CellMetadata,
    mito_prefix: Box<str>,
    nrows: usize,
    ncols: usize,
    /// `(gene, cell, count)` in column-major order
    triplets: Vec<(usize, usize, f32)>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
struct EmbeddingSnapshot {
    key: EmbeddingKey,
    cells: Vec<Box<str>>,
    components: Vec<Box<str>>,
    nrows: usize,
    ncols: usize,
    /// column-major coordinates
    data: Vec<f32>,
}

/// Serialized pipeline state: configuration, QC-filtered matrix and
/// every registered embedding and clustering. The same state always
/// produces the same bytes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Checkpoint {
    version: u32,
    config: PipelineConfig,
    matrix: MatrixSnapshot,
    embeddings: Vec<EmbeddingSnapshot>,
    clusterings: Vec<ClusterAssignment>,
}

impl Checkpoint {
    pub fn from_state(config: &PipelineConfig, matrix: &ExpressionMatrix, registry: &Registry) -> Self {
        let counts = matrix.counts();
        let matrix = MatrixSnapshot {
            genes: matrix.genes().to_vec(),
            metadata: matrix.metadata().clone(),
            mito_prefix: matrix.mito_prefix().into(),
            nrows: counts.nrows(),
            ncols: counts.ncols(),
            triplets: csc_triplets(counts),
        };

        let embeddings = registry
            .embeddings()
            .map(|e| EmbeddingSnapshot {
                key: e.key.clone(),
                cells: e.cells.clone(),
                components: e.components.clone(),
                nrows: e.coords.nrows(),
                ncols: e.coords.ncols(),
                data: e.coords.as_slice().to_vec(),
            })
            .collect();

        Checkpoint {
            version: CHECKPOINT_VERSION,
            config: config.clone(),
            matrix,
            embeddings,
            clusterings: registry.clusterings().cloned().collect(),
        }
    }

    /// Rebuild the in-memory state
    pub fn restore(&self) -> anyhow::Result<(PipelineConfig, ExpressionMatrix, Registry)> {
        if self.version != CHECKPOINT_VERSION {
            anyhow::bail!(
                "checkpoint version {} is not supported (expected {})",
                self.version,
                CHECKPOINT_VERSION
            );
        }

        let m = &self.matrix;
        let counts = csc_from_triplets(m.nrows, m.ncols, &m.triplets)?;
        let matrix = ExpressionMatrix::new(counts, m.genes.clone(), m.metadata.clone(), &m.mito_prefix)?;

        let mut registry = Registry::default();
        for e in &self.embeddings {
            if e.data.len() != e.nrows * e.ncols {
                return Err(PipelineError::DimensionMismatch {
                    what: format!("checkpoint embedding {}", e.key).into(),
                    expected: format!("{} values", e.nrows * e.ncols).into(),
                    found: format!("{} values", e.data.len()).into(),
                }
                .into());
            }
            let coords = Mat::from_column_slice(e.nrows, e.ncols, &e.data);
            registry.insert_embedding(Embedding::new(
                e.key.clone(),
                e.cells.clone(),
                e.components.clone(),
                coords,
            )?)?;
        }
        for c in &self.clusterings {
            registry.insert_clustering(c.clone())?;
        }

        Ok((self.config.clone(), matrix, registry))
    }

    pub fn to_json_file(&self, file: &str) -> anyhow::Result<()> {
        mkdir(file)?;
        let mut writer = open_buf_writer(file)?;
        serde_json::to_writer(&mut writer, self)?;
        writeln!(writer)?;
        writer.flush()?;
        info!(
            "checkpoint: {} embeddings, {} clusterings -> {}",
            self.embeddings.len(),
            self.clusterings.len(),
            file
        );
        Ok(())
    }

    pub fn from_json_file(file: &str) -> anyhow::Result<Self> {
        let reader = open_buf_reader(file)?;
        serde_json::from_reader(reader)
            .map_err(|e| anyhow::anyhow!("failed to read checkpoint {}: {}", file, e))
    }
}
