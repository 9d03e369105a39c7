use crate::cluster::ClusterAssignment;
use crate::common::*;

use matrix_util::dmatrix_util::select_rows;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EmbeddingMethod {
    Pca,
    Cca,
    Umap,
    Tsne,
}

/// Which cells an embedding was fitted on
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    /// all retained cells pooled together
    Pooled,
    /// all retained cells after batch alignment
    Integrated,
}

/// `(method, scope, parameters)`; parameters are rendered as a
/// canonical `name=value` list so keys can be ordered and compared
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EmbeddingKey {
    pub method: EmbeddingMethod,
    pub scope: Scope,
    pub params: Box<str>,
}

impl EmbeddingKey {
    pub fn new(method: EmbeddingMethod, scope: Scope, params: &[(&str, String)]) -> Self {
        EmbeddingKey {
            method,
            scope,
            params: render_params(params),
        }
    }
}

impl fmt::Display for EmbeddingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EmbeddingMethod::Pca => "pca",
            EmbeddingMethod::Cca => "cca",
            EmbeddingMethod::Umap => "umap",
            EmbeddingMethod::Tsne => "tsne",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Pooled => write!(f, "pooled"),
            Scope::Integrated => write!(f, "integrated"),
        }
    }
}

impl fmt::Display for EmbeddingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.method, self.scope, self.params)
    }
}

/// A clustering is identified by its input embedding, the algorithm
/// and its parameters
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterKey {
    pub embedding: EmbeddingKey,
    pub algorithm: Box<str>,
    pub params: Box<str>,
}

impl ClusterKey {
    pub fn new(embedding: EmbeddingKey, algorithm: &str, params: &[(&str, String)]) -> Self {
        ClusterKey {
            embedding,
            algorithm: algorithm.into(),
            params: render_params(params),
        }
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}/{}]", self.algorithm, self.embedding, self.params)
    }
}

fn render_params(params: &[(&str, String)]) -> Box<str> {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
        .into_boxed_str()
}

/// Named components per cell; rows follow `cells`
#[derive(Clone, Debug, PartialEq)]
pub struct Embedding {
    pub key: EmbeddingKey,
    pub cells: Vec<Box<str>>,
    pub components: Vec<Box<str>>,
    pub coords: Mat,
}

impl Embedding {
    pub fn new(
        key: EmbeddingKey,
        cells: Vec<Box<str>>,
        components: Vec<Box<str>>,
        coords: Mat,
    ) -> anyhow::Result<Self> {
        if coords.nrows() != cells.len() || coords.ncols() != components.len() {
            return Err(PipelineError::DimensionMismatch {
                what: format!("embedding {}", key).into(),
                expected: format!("[{} x {}]", cells.len(), components.len()).into(),
                found: format!("[{} x {}]", coords.nrows(), coords.ncols()).into(),
            }
            .into());
        }
        Ok(Embedding {
            key,
            cells,
            components,
            coords,
        })
    }

    /// Components named `<prefix>_1 .. <prefix>_n`
    pub fn component_names(prefix: &str, n: usize) -> Vec<Box<str>> {
        (1..=n).map(|k| format!("{}_{}", prefix, k).into()).collect()
    }

    pub fn num_cells(&self) -> usize {
        self.coords.nrows()
    }

    pub fn num_components(&self) -> usize {
        self.coords.ncols()
    }

    /// First `n` components (all of them if fewer exist)
    pub fn leading(&self, n: usize) -> Mat {
        let n = n.min(self.num_components());
        self.coords.columns(0, n).into_owned()
    }

    pub fn rows(&self, cells: &[usize]) -> Mat {
        select_rows(&self.coords, cells)
    }

    pub fn to_lines(&self) -> Vec<Box<str>> {
        let mut hdr = vec!["cell".to_string()];
        hdr.extend(self.components.iter().map(|c| c.to_string()));
        let mut lines: Vec<Box<str>> = vec![hdr.join("\t").into_boxed_str()];
        for (i, cell) in self.cells.iter().enumerate() {
            let mut fields = vec![cell.to_string()];
            fields.extend(self.coords.row(i).iter().map(|x| format!("{}", x)));
            lines.push(fields.join("\t").into_boxed_str());
        }
        lines
    }
}

/// Every embedding and clustering computed in a run, keyed so nothing
/// is silently replaced
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Registry {
    embeddings: BTreeMap<EmbeddingKey, Embedding>,
    clusterings: BTreeMap<ClusterKey, ClusterAssignment>,
}

impl Registry {
    pub fn insert_embedding(&mut self, embedding: Embedding) -> anyhow::Result<()> {
        if self.embeddings.contains_key(&embedding.key) {
            return Err(PipelineError::DuplicateRegistryEntry {
                key: embedding.key.to_string().into(),
            }
            .into());
        }
        debug!("registered embedding {}", embedding.key);
        self.embeddings.insert(embedding.key.clone(), embedding);
        Ok(())
    }

    pub fn insert_clustering(&mut self, clustering: ClusterAssignment) -> anyhow::Result<()> {
        if self.clusterings.contains_key(&clustering.key) {
            return Err(PipelineError::DuplicateRegistryEntry {
                key: clustering.key.to_string().into(),
            }
            .into());
        }
        debug!("registered clustering {}", clustering.key);
        self.clusterings.insert(clustering.key.clone(), clustering);
        Ok(())
    }

    pub fn embedding(&self, key: &EmbeddingKey) -> Option<&Embedding> {
        self.embeddings.get(key)
    }

    pub fn clustering(&self, key: &ClusterKey) -> Option<&ClusterAssignment> {
        self.clusterings.get(key)
    }

    pub fn embeddings(&self) -> impl Iterator<Item = &Embedding> {
        self.embeddings.values()
    }

    pub fn clusterings(&self) -> impl Iterator<Item = &ClusterAssignment> {
        self.clusterings.values()
    }

    /// Embeddings of one method, in key order
    pub fn embeddings_by_method(&self, method: EmbeddingMethod) -> Vec<&Embedding> {
        self.embeddings
            .values()
            .filter(|e| e.key.method == method)
            .collect()
    }

    pub fn num_embeddings(&self) -> usize {
        self.embeddings.len()
    }

    pub fn num_clusterings(&self) -> usize {
        self.clusterings.len()
    }
}
