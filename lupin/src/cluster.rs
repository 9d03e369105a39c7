use crate::common::*;
use crate::embedding::{ClusterKey, Embedding};

use matrix_util::clustering::{cluster_sizes, louvain, LouvainArgs, WeightedGraph};
use matrix_util::knn_graph::{knn_search, shared_neighbour_edges};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ClusterArgs {
    /// leading embedding dimensions used for the graph
    pub n_dims: usize,
    /// neighbourhood size, the cell itself included
    pub knn: usize,
    /// drop shared-neighbour edges with Jaccard weight below this
    pub prune_snn: f32,
    pub resolution: f64,
    pub seed: u64,
    pub block_size: usize,
}

impl Default for ClusterArgs {
    fn default() -> Self {
        ClusterArgs {
            n_dims: DEFAULT_N_DIMS,
            knn: DEFAULT_KNN,
            prune_snn: 1.0 / 15.0,
            resolution: DEFAULT_RESOLUTION,
            seed: DEFAULT_SEED,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// One cluster id per cell; id 0 is the largest cluster
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ClusterAssignment {
    pub key: ClusterKey,
    pub cells: Vec<Box<str>>,
    pub labels: Vec<usize>,
    pub n_clusters: usize,
    pub modularity: f64,
    pub resolution: f64,
    pub seed: u64,
}

impl ClusterAssignment {
    pub fn cluster_sizes(&self) -> Vec<usize> {
        cluster_sizes(&self.labels)
    }

    /// Render an ASCII histogram of cluster sizes for logging.
    ///
    /// Shows up to `max_show` clusters with bars scaled to `max_width`.
    pub fn histogram_ascii(&self, max_width: usize, max_show: usize) -> String {
        let sizes = self.cluster_sizes();
        let n_cells = self.labels.len().max(1) as f64;
        let n_show = max_show.min(sizes.len());
        let max_size = sizes.first().copied().unwrap_or(1).max(1);

        let mut lines = vec![
            format!(
                "Cluster assignments ({} cells, {} clusters, modularity {:.4}):",
                self.labels.len(),
                sizes.len(),
                self.modularity
            ),
            String::new(),
        ];

        for (k, &size) in sizes.iter().enumerate().take(n_show) {
            let pct = 100.0 * size as f64 / n_cells;
            let bar_len = ((size as f64 / max_size as f64) * max_width as f64) as usize;
            lines.push(format!(
                "  Cluster {:3}  {:>6} cells ({:>5.1}%)  {}",
                k,
                size,
                pct,
                "█".repeat(bar_len.max(1))
            ));
        }

        if sizes.len() > n_show {
            let hidden: usize = sizes[n_show..].iter().sum();
            lines.push(format!(
                "  ... and {} more clusters ({} cells, {:.1}%)",
                sizes.len() - n_show,
                hidden,
                100.0 * hidden as f64 / n_cells
            ));
        }
        lines.join("\n")
    }
}

/// Shared-nearest-neighbour Louvain clustering of the leading
/// `args.n_dims` components of an embedding
pub fn cluster_embedding(embedding: &Embedding, args: &ClusterArgs) -> anyhow::Result<ClusterAssignment> {
    let nn = embedding.num_cells();
    if nn == 0 {
        return Err(PipelineError::DegenerateInput {
            stage: "cluster".into(),
            detail: format!("embedding {} has no cells", embedding.key).into(),
        }
        .into());
    }
    if args.knn == 0 {
        anyhow::bail!("knn must be positive");
    }

    let n_dims = args.n_dims.min(embedding.num_components());
    if n_dims < args.n_dims {
        warn!(
            "embedding {} has only {} components; clustering on {}",
            embedding.key,
            embedding.num_components(),
            n_dims
        );
    }
    let xx = embedding.leading(n_dims);

    info!(
        "clustering {} cells: {} dims, k = {}, resolution {}, seed {}",
        nn, n_dims, args.knn, args.resolution, args.seed
    );

    // neighbour lists exclude the cell, the shared-neighbour sets add it back
    let neighbours = knn_search(&xx, &xx, args.knn.saturating_sub(1), true, args.block_size)?;
    let edges = shared_neighbour_edges(&neighbours, args.prune_snn);
    debug!("shared-neighbour graph: {} edges", edges.len());

    let graph = WeightedGraph::from_edges(nn, &edges)?;
    let out = louvain(
        &graph,
        &LouvainArgs {
            resolution: args.resolution,
            seed: args.seed,
            ..Default::default()
        },
    )?;

    let n_clusters = cluster_sizes(&out.membership).len();
    let key = ClusterKey::new(
        embedding.key.clone(),
        "snn_louvain",
        &[
            ("n_dims", n_dims.to_string()),
            ("knn", args.knn.to_string()),
            ("prune_snn", format!("{}", args.prune_snn)),
            ("resolution", format!("{}", args.resolution)),
            ("seed", args.seed.to_string()),
        ],
    );

    let ret = ClusterAssignment {
        key,
        cells: embedding.cells.clone(),
        labels: out.membership,
        n_clusters,
        modularity: out.modularity,
        resolution: args.resolution,
        seed: args.seed,
    };
    info!("\n{}", ret.histogram_ascii(40, 20));
    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingKey, EmbeddingMethod, Scope};
    use matrix_util::dmatrix_util::*;

    fn blobs(n_per: usize, seed: u64) -> anyhow::Result<Embedding> {
        let centres = [[0.0f32, 0.0, 0.0], [12.0, 0.0, 0.0], [0.0, 12.0, 0.0]];
        let mut rng = StdRng::seed_from_u64(seed);
        let n = n_per * centres.len();
        let mut coords = Mat::zeros(n, 3);
        for (b, centre) in centres.iter().enumerate() {
            for i in 0..n_per {
                for c in 0..3 {
                    let z: f32 = rng.sample(StandardNormal);
                    coords[(b * n_per + i, c)] = centre[c] + z;
                }
            }
        }
        Embedding::new(
            EmbeddingKey::new(EmbeddingMethod::Cca, Scope::Integrated, &[]),
            (0..n).map(|i| format!("cell{}", i).into()).collect(),
            Embedding::component_names("IPC", 3),
            coords,
        )
    }

    #[test]
    fn test_blobs_become_clusters() -> anyhow::Result<()> {
        let emb = blobs(40, 1)?;
        let args = ClusterArgs {
            knn: 10,
            ..Default::default()
        };
        let out = cluster_embedding(&emb, &args)?;
        assert_eq!(out.labels.len(), 120);
        assert_eq!(out.n_clusters, 3);
        assert_eq!(out.cluster_sizes(), vec![40, 40, 40]);
        for b in 0..3 {
            let first = out.labels[b * 40];
            assert!(out.labels[b * 40..(b + 1) * 40].iter().all(|&l| l == first));
        }
        assert!(out.modularity > 0.5);

        let hist = out.histogram_ascii(20, 2);
        assert!(hist.starts_with("Cluster assignments (120 cells, 3 clusters"));
        assert!(hist.contains("... and 1 more clusters (40 cells"));
        Ok(())
    }

    #[test]
    fn test_same_seed_same_partition() -> anyhow::Result<()> {
        let emb = blobs(25, 9)?;
        let args = ClusterArgs {
            knn: 8,
            seed: 11,
            ..Default::default()
        };
        let a = cluster_embedding(&emb, &args)?;
        let b = cluster_embedding(&emb, &args)?;
        assert_eq!(a, b);
        assert!(a.labels.iter().all(|&l| l < a.n_clusters));
        Ok(())
    }
}
