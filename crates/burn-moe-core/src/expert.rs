//! Expert networks
//!
//! An expert maps a mini-batch of feature vectors to log-probabilities.
//! The MoE layer only relies on the [`Expert`] capability, so any module
//! with that signature can back the pool.

use burn::nn::{Linear, LinearConfig, Relu};
use burn::prelude::*;
use burn::tensor::activation::log_softmax;
use serde::{Deserialize, Serialize};

use crate::error::{MoeError, Result};

/// A sub-network that processes the examples routed to it
///
/// Implementations receive only non-empty batches and must return
/// log-domain outputs of shape [n, output_size].
pub trait Expert<B: Backend> {
    fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2>;
}

/// Two-layer MLP expert
///
/// # Architecture
///
/// ```text
/// output = log_softmax(fc2(relu(fc1(x))))
/// ```
#[derive(Module, Debug)]
pub struct FeedForwardExpert<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
    activation: Relu,
}

/// Configuration for FeedForwardExpert
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeedForwardExpertConfig {
    /// Input feature dimension
    pub input_size: usize,
    /// Hidden layer dimension
    pub hidden_size: usize,
    /// Number of output classes
    pub output_size: usize,
}

impl FeedForwardExpertConfig {
    pub fn new(input_size: usize, hidden_size: usize, output_size: usize) -> Self {
        Self {
            input_size,
            hidden_size,
            output_size,
        }
    }

    /// Initializes an expert with fresh parameters
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<FeedForwardExpert<B>> {
        if self.input_size == 0 || self.hidden_size == 0 || self.output_size == 0 {
            return Err(MoeError::InvalidConfig(format!(
                "expert sizes must be > 0, got {}x{}x{}",
                self.input_size, self.hidden_size, self.output_size
            )));
        }

        Ok(FeedForwardExpert {
            fc1: LinearConfig::new(self.input_size, self.hidden_size).init(device),
            fc2: LinearConfig::new(self.hidden_size, self.output_size).init(device),
            activation: Relu::new(),
        })
    }
}

impl<B: Backend> Expert<B> for FeedForwardExpert<B> {
    /// # Arguments
    ///
    /// * `x` - Input tensor [n, input_size]
    ///
    /// # Returns
    ///
    /// Log-probabilities [n, output_size]
    fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let hidden = self.activation.forward(self.fc1.forward(x));
        log_softmax(self.fc2.forward(hidden), 1)
    }
}
