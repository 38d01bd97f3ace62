//! Sparsely-Gated Mixture of Experts for burn
//!
//! This crate provides the building blocks of a sparse MoE layer with noisy
//! top-k gating: each example is routed to `k` of `num_experts` expert
//! networks and an auxiliary loss keeps the experts evenly used.
//!
//! # Modules
//!
//! ## Routing
//!
//! - [`gate`] - Noisy top-k gate with a differentiable load estimate
//! - [`dispatcher`] - Per-expert dispatch and log-space combine
//! - [`normal`] - Gaussian CDF used by the load estimate
//!
//! ## Layer
//!
//! - [`expert`] - Expert capability and the default feed-forward expert
//! - [`moe`] - The MoE layer, its config and outputs
//! - [`loss`] - Squared coefficient of variation and the balancing loss
//!
//! ## Training
//!
//! - [`train`] - AdamW training step and evaluation
//!
//! # Example
//!
//! ```ignore
//! use burn_moe_core::moe::SparseMoeConfig;
//!
//! let moe = SparseMoeConfig::new(784, 10, 8, 256).with_k(2).init::<B>(&device)?;
//!
//! // Training: task loss and load-balancing loss
//! let (target_loss, loss) = moe.forward_losses(images, labels, 1e-2)?;
//!
//! // Inference: log-probabilities [batch, 10]
//! let scores = moe.forward(images, None, false)?.prediction_scores();
//! ```

pub mod dispatcher;
pub mod error;
pub mod expert;
pub mod gate;
pub mod loss;
pub mod moe;
pub mod normal;
pub mod train;

pub use error::{MoeError, Result};
pub use moe::{MoeOutput, SparseMoe, SparseMoeConfig};
