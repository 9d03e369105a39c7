use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Typed failures raised by pipeline stages. They travel inside
/// `anyhow::Error`; callers can recover the variant with
/// `err.downcast_ref::<PipelineError>()`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("malformed cell identifier `{identifier}` at position {position}: expected <donor>.<barcode>.<replicate>")]
    MalformedIdentifier { identifier: Box<str>, position: usize },

    #[error("annotation key `{key}` appears {count} times")]
    DuplicateAnnotationKey { key: Box<str>, count: usize },

    #[error("{stage}: no cells left after filtering ({before} -> 0) with {params}")]
    EmptyAfterFilter {
        stage: Box<str>,
        before: usize,
        params: Box<str>,
    },

    #[error("insufficient overlap between batches `{batch_a}` and `{batch_b}`: {reason}")]
    InsufficientOverlap {
        batch_a: Box<str>,
        batch_b: Box<str>,
        reason: Box<str>,
    },

    #[error("{stage}: degenerate input: {detail}")]
    DegenerateInput { stage: Box<str>, detail: Box<str> },

    #[error("registry already holds an entry for {key}")]
    DuplicateRegistryEntry { key: Box<str> },

    #[error("unknown gene `{0}`")]
    UnknownGene(Box<str>),

    #[error("{what}: expected {expected}, found {found}")]
    DimensionMismatch {
        what: Box<str>,
        expected: Box<str>,
        found: Box<str>,
    },
}

/// A gene, component or batch that a stage left out, and why
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Exclusion {
    pub stage: Box<str>,
    pub item: Box<str>,
    pub reason: Box<str>,
}

impl Exclusion {
    pub fn new(stage: &str, item: &str, reason: &str) -> Self {
        let ret = Exclusion {
            stage: stage.into(),
            item: item.into(),
            reason: reason.into(),
        };
        warn!("[{}] excluded {}: {}", ret.stage, ret.item, ret.reason);
        ret
    }
}
