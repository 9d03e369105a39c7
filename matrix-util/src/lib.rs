pub mod clustering; // modularity-based community detection
pub mod common_io; // gz-aware delimited text input/output
pub mod dmatrix_rsvd; // seeded randomized SVD
pub mod dmatrix_util; // dense matrix helpers
pub mod knn_graph; // exact kNN, SNN and MNN graphs
pub mod sparse_stat; // sufficient statistics over sparse columns
pub mod traits;
pub mod utils;
