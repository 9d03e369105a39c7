use crate::batch::{partition_by_donor, BatchPartition};
use crate::centile::{compute_centiles, resolve_groups, CentileArgs, CentileTable};
use crate::checkpoint::Checkpoint;
use crate::cluster::{cluster_embedding, ClusterAssignment};
use crate::common::*;
use crate::config::PipelineConfig;
use crate::embedding::{EmbeddingKey, Registry, Scope};
use crate::expression::ExpressionMatrix;
use crate::feature_selection::{select_features, FeatureSelection};
use crate::input::CountTable;
use crate::integrate::{integrate_batches, IntegrationReport};
use crate::metadata::{build_metadata, AnnotationTable};
use crate::normalize::{normalize_batches, NormalizedExpression};
use crate::pca::{run_pca, PcaResult};
use crate::projection::project_embedding;
use crate::qc::{qc_filter, QcReport};

/// Everything one run produced, in stage order
pub struct PipelineState {
    pub config: PipelineConfig,
    /// QC-retained cells; every later stage is aligned with its columns
    pub matrix: ExpressionMatrix,
    pub qc: QcReport,
    pub partition: BatchPartition,
    pub normalized: NormalizedExpression,
    pub features: FeatureSelection,
    pub pca: PcaResult,
    pub integration: IntegrationReport,
    pub integrated_key: EmbeddingKey,
    pub clusters: ClusterAssignment,
    pub centiles: Option<CentileTable>,
    pub registry: Registry,
}

impl PipelineState {
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint::from_state(&self.config, &self.matrix, &self.registry)
    }

    /// Cell counts through the stages, for the final log line
    pub fn summary(&self) -> String {
        format!(
            "{} -> {} cells after QC, {} batches, {} features, {} PCs, {} clusters, {} embeddings",
            self.qc.num_before(),
            self.matrix.num_cells(),
            self.partition.num_batches(),
            self.features.num_selected(),
            self.pca.num_components(),
            self.clusters.n_clusters,
            self.registry.num_embeddings()
        )
    }
}

/// Run every stage on an in-memory count table.
///
/// Stages run strictly in order; the first stage error aborts the run.
/// Centiles are computed only when `config.centile.genes` is non-empty.
pub fn run_pipeline(
    table: &CountTable,
    annotation: Option<&AnnotationTable>,
    config: &PipelineConfig,
) -> anyhow::Result<PipelineState> {
    info!(
        "pipeline: {} genes × {} cells",
        table.num_genes(),
        table.num_cells()
    );

    let metadata = build_metadata(&table.cells, annotation, &config.metadata)?;
    let raw = ExpressionMatrix::from_triplets(
        table.genes.clone(),
        metadata,
        &table.triplets,
        &config.qc.mito_prefix,
    )?;
    info!(
        "expression matrix: {} genes ({} mitochondrial) × {} cells",
        raw.num_genes(),
        raw.num_mito_genes(),
        raw.num_cells()
    );

    let qc = qc_filter(&raw, &config.qc)?;
    drop(raw);
    let matrix = qc.matrix;

    let partition = partition_by_donor(&matrix)?;
    let normalized = normalize_batches(&matrix, &partition, &config.normalize)?;
    let features = select_features(&normalized, matrix.genes(), &config.features)?;

    let cells = matrix.cells();
    let pca = run_pca(
        &normalized.data,
        matrix.genes(),
        &features.selected,
        &cells,
        &config.pca,
    )?;

    let integrated = integrate_batches(&pca.embedding, &partition, &config.integration)?;
    if !integrated.report.uncorrected_batches.is_empty() {
        warn!(
            "batches left uncorrected: {}",
            integrated.report.uncorrected_batches.join(", ")
        );
    }

    let clusters = cluster_embedding(&integrated.embedding, &config.cluster)?;

    let mut registry = Registry::default();
    registry.insert_embedding(pca.embedding.clone())?;

    for method in config.projection.methods() {
        let projected = project_embedding(&integrated.embedding, method, &config.projection)?;
        registry.insert_embedding(projected)?;
    }

    let integrated_key = integrated.embedding.key.clone();
    registry.insert_embedding(integrated.embedding)?;
    registry.insert_clustering(clusters.clone())?;

    let centiles = if config.centile.genes.is_empty() {
        None
    } else {
        Some(centiles_for(
            &matrix,
            &normalized.data,
            &config.centile,
            Some(&clusters),
        )?)
    };

    let state = PipelineState {
        config: config.clone(),
        matrix,
        qc: qc.report,
        partition,
        normalized,
        features,
        pca,
        integration: integrated.report,
        integrated_key,
        clusters,
        centiles,
        registry,
    };

    info!("pipeline: {}", state.summary());
    Ok(state)
}

fn centiles_for(
    matrix: &ExpressionMatrix,
    normalized: &CscMat,
    args: &CentileArgs,
    clusters: Option<&ClusterAssignment>,
) -> anyhow::Result<CentileTable> {
    let (group_column, groups) = resolve_groups(matrix, args.group_column.as_deref(), clusters)?;
    compute_centiles(matrix, normalized, &args.genes, &group_column, groups)
}

/// Clustering of the integrated embedding if there is one, otherwise
/// the first clustering in key order
pub fn primary_clustering(registry: &Registry) -> Option<&ClusterAssignment> {
    registry
        .clusterings()
        .find(|c| c.key.embedding.scope == Scope::Integrated)
        .or_else(|| registry.clusterings().next())
}

/// Recompute centiles from a checkpoint without re-running the
/// upstream stages. Normalization is rebuilt from the stored counts with
/// the stored configuration, so the values match the original run.
pub fn centiles_from_checkpoint(
    checkpoint: &Checkpoint,
    args: &CentileArgs,
) -> anyhow::Result<CentileTable> {
    if args.genes.is_empty() {
        anyhow::bail!("no genes requested for centile extraction");
    }

    let (config, matrix, registry) = checkpoint.restore()?;
    info!(
        "checkpoint: {} cells, {} embeddings, {} clusterings",
        matrix.num_cells(),
        registry.num_embeddings(),
        registry.num_clusterings()
    );

    let partition = partition_by_donor(&matrix)?;
    let normalized = normalize_batches(&matrix, &partition, &config.normalize)?;

    let clusters = primary_clustering(&registry);
    if args.group_column.is_none() && clusters.is_none() {
        warn!("checkpoint holds no clustering; every cell falls in one group");
    }

    centiles_for(&matrix, &normalized.data, args, clusters)
}
