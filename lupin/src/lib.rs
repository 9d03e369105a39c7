pub mod batch; // donor batch views over the matrix columns
pub mod centile; // per-gene percentile bins and threshold views
pub mod checkpoint;
pub mod cluster; // shared-nearest-neighbour Louvain
pub mod common;
pub mod config;
pub mod embedding; // named embeddings and the run registry
pub mod error;
pub mod expression;
pub mod feature_selection;
pub mod input;
pub mod integrate; // canonical-correlation anchors across batches
pub mod metadata;
pub mod normalize;
pub mod output;
pub mod pca;
pub mod pipeline;
pub mod projection; // UMAP and t-SNE
pub mod qc;
