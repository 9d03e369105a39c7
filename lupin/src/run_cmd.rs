use lupin::config::PipelineConfig;
use lupin::input::{read_annotation_table, read_count_table};
use lupin::output::write_pipeline_outputs;
use lupin::pca::PcaSolver;
use lupin::pipeline::run_pipeline;

use clap::Args;
use log::info;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// gene × cell count table (`.tsv`, `.csv`, optionally gzipped)
    #[arg(long, short, required = true)]
    counts: Box<str>,

    /// cell annotation table; the first column is the cell key
    #[arg(long, short)]
    annotation: Option<Box<str>>,

    /// Output header
    #[arg(long, short, required = true)]
    out: Box<str>,

    /// pipeline configuration (JSON); flags below override it
    #[arg(long)]
    config: Option<Box<str>>,

    /// genes for centile extraction (comma-separated)
    #[arg(long, short, value_delimiter(','))]
    genes: Option<Vec<Box<str>>>,

    /// annotation column used to group centile cells (clusters by default)
    #[arg(long)]
    group_column: Option<Box<str>>,

    /// extract cells with centile strictly above this
    #[arg(long)]
    threshold: Option<u8>,

    /// also compute a UMAP projection of the integrated embedding
    #[arg(long, default_value_t = false)]
    umap: bool,

    /// also compute a t-SNE projection of the integrated embedding
    #[arg(long, default_value_t = false)]
    tsne: bool,

    /// random seed for clustering and projections
    #[arg(long)]
    seed: Option<u64>,

    /// Louvain resolution
    #[arg(long, short)]
    resolution: Option<f64>,

    /// #k-nearest neighbours of the clustering graph
    #[arg(long, short)]
    knn: Option<usize>,

    /// leading integrated dimensions used for clustering and projections
    #[arg(long, short = 'd')]
    n_dims: Option<usize>,

    /// number of variable features
    #[arg(long, short = 'f')]
    n_features: Option<usize>,

    /// number of principal components
    #[arg(long)]
    n_pcs: Option<usize>,

    /// keep cells with more detected features than this
    #[arg(long)]
    min_features: Option<usize>,

    /// keep cells with lower percent mitochondrial counts than this
    #[arg(long)]
    max_percent_mito: Option<f32>,

    /// keep cells with lower total counts than this
    #[arg(long)]
    max_total_count: Option<f32>,

    /// always use the randomized PCA solver
    #[arg(long, default_value_t = false)]
    randomized_pca: bool,

    /// keep going when a batch has no usable anchors
    #[arg(long, default_value_t = false)]
    tolerate_partial_integration: bool,

    /// write the checkpoint without gzip compression
    #[arg(long, default_value_t = false)]
    plain_checkpoint: bool,
}

impl RunArgs {
    fn pipeline_config(&self) -> anyhow::Result<PipelineConfig> {
        let mut cfg = match &self.config {
            Some(file) => PipelineConfig::from_json_file(file)?,
            None => PipelineConfig::default(),
        };

        if let Some(genes) = &self.genes {
            cfg.centile.genes = genes.clone();
        }
        if let Some(col) = &self.group_column {
            cfg.centile.group_column = Some(col.clone());
        }
        if let Some(t) = self.threshold {
            cfg.centile.threshold = t;
        }
        if self.umap {
            cfg.projection.umap = true;
        }
        if self.tsne {
            cfg.projection.tsne = true;
        }
        if let Some(seed) = self.seed {
            cfg.cluster.seed = seed;
            cfg.projection.seed = seed;
            match &mut cfg.pca.solver {
                PcaSolver::Randomized { seed: s } | PcaSolver::Auto { seed: s, .. } => *s = seed,
                PcaSolver::Exact => {}
            }
        }
        if let Some(r) = self.resolution {
            cfg.cluster.resolution = r;
        }
        if let Some(k) = self.knn {
            cfg.cluster.knn = k;
        }
        if let Some(d) = self.n_dims {
            cfg.cluster.n_dims = d;
            cfg.projection.n_dims = d;
        }
        if let Some(n) = self.n_features {
            cfg.features.n_features = n;
        }
        if let Some(n) = self.n_pcs {
            cfg.pca.n_pcs = n;
        }
        if let Some(n) = self.min_features {
            cfg.qc.min_features = n;
        }
        if let Some(m) = self.max_percent_mito {
            cfg.qc.max_percent_mito = m;
        }
        if let Some(m) = self.max_total_count {
            cfg.qc.max_total_count = m;
        }
        if self.randomized_pca {
            cfg.pca.solver = PcaSolver::Randomized {
                seed: self.seed.unwrap_or(cfg.cluster.seed),
            };
        }
        if self.tolerate_partial_integration {
            cfg.integration.tolerate_partial = true;
        }
        Ok(cfg)
    }
}

pub fn run(args: &RunArgs) -> anyhow::Result<()> {
    let config = args.pipeline_config()?;

    let counts = read_count_table(&args.counts)?;
    let annotation = match &args.annotation {
        Some(file) => Some(read_annotation_table(file)?),
        None => None,
    };

    let state = run_pipeline(&counts, annotation.as_ref(), &config)?;

    let checkpoint_suffix = if args.plain_checkpoint {
        "checkpoint.json"
    } else {
        "checkpoint.json.gz"
    };
    let files = write_pipeline_outputs(&state, &args.out, checkpoint_suffix)?;

    info!("{}", state.summary());
    info!("done: {} files written under {}", files.len(), args.out);
    Ok(())
}
