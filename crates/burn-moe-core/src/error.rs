//! Error type shared by the MoE building blocks

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MoeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("k = {k} exceeds the number of experts ({num_experts})")]
    TopKExceedsExperts { k: usize, num_experts: usize },

    #[error("Shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Expected outputs from {expected} non-empty experts, got {actual}")]
    ExpertOutputCount { expected: usize, actual: usize },

    #[error("Gate matrix has no nonzero entries; nothing was routed")]
    EmptyRouting,

    #[error("Label {label} out of range for {num_classes} classes")]
    InvalidLabel { label: i64, num_classes: usize },
}

pub type Result<T> = std::result::Result<T, MoeError>;
