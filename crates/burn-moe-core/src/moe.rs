//! Sparsely-gated Mixture of Experts layer
//!
//! Each example is scored by a noisy top-k gate, sent to its `k` best
//! experts, and the expert log-probabilities are mixed back together with
//! the gate weights. An auxiliary loss keeps expert usage balanced across
//! the batch.
//!
//! # Architecture
//!
//! ```text
//! 1. Gate computes sparse weights [batch, num_experts] and per-expert load
//! 2. Dispatcher splits the batch into per-expert mini-batches
//! 3. Each expert with at least one example processes its mini-batch
//! 4. Dispatcher combines the outputs in batch order, weighted by the gates
//! 5. loss = loss_coef * (cv^2(importance) + cv^2(load))
//! ```
//!
//! # References
//!
//! - [Sparsely-Gated Mixture-of-Experts](https://arxiv.org/abs/1701.06538)

use std::fs;
use std::path::Path;

use burn::nn::loss::CrossEntropyLossConfig;
use burn::nn::Initializer;
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::dispatcher::SparseDispatcher;
use crate::error::{MoeError, Result};
use crate::expert::{Expert, FeedForwardExpert, FeedForwardExpertConfig};
use crate::gate::{GateOutput, NoisyTopKGate, NoisyTopKGateConfig, DEFAULT_NOISE_EPSILON};
use crate::loss::load_balancing_loss;

/// Default multiplier on the load-balancing loss
pub const DEFAULT_LOSS_COEF: f64 = 1e-2;

/// Sparse MoE layer with a pool of feed-forward experts
#[derive(Module, Debug)]
pub struct SparseMoe<B: Backend> {
    gate: NoisyTopKGate<B>,
    experts: Vec<FeedForwardExpert<B>>,
    input_size: usize,
    output_size: usize,
    loss_coef: f64,
}

/// Configuration for SparseMoe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseMoeConfig {
    /// Flattened feature size of each example
    pub input_size: usize,
    /// Number of output classes
    pub output_size: usize,
    /// Total number of experts
    pub num_experts: usize,
    /// Hidden size of each expert
    pub hidden_size: usize,
    /// Number of experts per example
    #[serde(default = "default_k")]
    pub k: usize,
    /// Inject noise into the gate logits during training
    #[serde(default = "default_noisy_gating")]
    pub noisy_gating: bool,
    #[serde(default = "default_noise_epsilon")]
    pub noise_epsilon: f64,
    /// Multiplier on the load-balancing loss
    #[serde(default = "default_loss_coef")]
    pub loss_coef: f64,
    /// Initializer for the gate projections
    #[serde(default = "default_gate_initializer")]
    pub gate_initializer: Initializer,
}

fn default_k() -> usize {
    4
}

fn default_noisy_gating() -> bool {
    true
}

fn default_noise_epsilon() -> f64 {
    DEFAULT_NOISE_EPSILON
}

fn default_loss_coef() -> f64 {
    DEFAULT_LOSS_COEF
}

fn default_gate_initializer() -> Initializer {
    Initializer::Zeros
}

impl SparseMoeConfig {
    /// Creates a config with k = 4 and noisy gating
    pub fn new(
        input_size: usize,
        output_size: usize,
        num_experts: usize,
        hidden_size: usize,
    ) -> Self {
        Self {
            input_size,
            output_size,
            num_experts,
            hidden_size,
            k: default_k(),
            noisy_gating: default_noisy_gating(),
            noise_epsilon: default_noise_epsilon(),
            loss_coef: default_loss_coef(),
            gate_initializer: default_gate_initializer(),
        }
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_noisy_gating(mut self, noisy_gating: bool) -> Self {
        self.noisy_gating = noisy_gating;
        self
    }

    pub fn with_noise_epsilon(mut self, noise_epsilon: f64) -> Self {
        self.noise_epsilon = noise_epsilon;
        self
    }

    pub fn with_loss_coef(mut self, loss_coef: f64) -> Self {
        self.loss_coef = loss_coef;
        self
    }

    pub fn with_gate_initializer(mut self, initializer: Initializer) -> Self {
        self.gate_initializer = initializer;
        self
    }

    /// Reads a JSON config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the config as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn gate_config(&self) -> NoisyTopKGateConfig {
        NoisyTopKGateConfig::new(self.input_size, self.num_experts, self.k)
            .with_noisy_gating(self.noisy_gating)
            .with_noise_epsilon(self.noise_epsilon)
            .with_initializer(self.gate_initializer.clone())
    }

    pub fn expert_config(&self) -> FeedForwardExpertConfig {
        FeedForwardExpertConfig::new(self.input_size, self.hidden_size, self.output_size)
    }

    pub fn validate(&self) -> Result<()> {
        self.gate_config().validate()?;
        if self.output_size == 0 || self.hidden_size == 0 {
            return Err(MoeError::InvalidConfig(
                "output_size and hidden_size must be > 0".into(),
            ));
        }
        if !self.loss_coef.is_finite() || self.loss_coef < 0.0 {
            return Err(MoeError::InvalidConfig(format!(
                "loss_coef must be finite and >= 0, got {}",
                self.loss_coef
            )));
        }
        Ok(())
    }

    /// Initializes the layer with independently initialized experts
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<SparseMoe<B>> {
        self.validate()?;
        let gate = self.gate_config().init(device)?;
        let expert_config = self.expert_config();
        let experts = (0..self.num_experts)
            .map(|_| expert_config.init(device))
            .collect::<Result<Vec<_>>>()?;

        Ok(SparseMoe {
            gate,
            experts,
            input_size: self.input_size,
            output_size: self.output_size,
            loss_coef: self.loss_coef,
        })
    }
}

/// Result of a forward pass
#[derive(Debug, Clone)]
pub enum MoeOutput<B: Backend> {
    /// Combined log-probabilities [batch, output_size]
    Prediction { prediction_scores: Tensor<B, 2> },
    /// Supervised loss and the load-balancing loss, kept apart so the
    /// caller decides how to weight them
    Training {
        target_loss: Tensor<B, 1>,
        loss: Tensor<B, 1>,
    },
}

impl<B: Backend> MoeOutput<B> {
    pub fn prediction_scores(self) -> Option<Tensor<B, 2>> {
        match self {
            Self::Prediction { prediction_scores } => Some(prediction_scores),
            Self::Training { .. } => None,
        }
    }

    /// `(target_loss, loss)` for training outputs
    pub fn losses(self) -> Option<(Tensor<B, 1>, Tensor<B, 1>)> {
        match self {
            Self::Training { target_loss, loss } => Some((target_loss, loss)),
            Self::Prediction { .. } => None,
        }
    }
}

/// Everything produced while routing one batch
#[derive(Debug, Clone)]
pub struct Routed<B: Backend> {
    /// Combined log-probabilities [batch, output_size]
    pub output: Tensor<B, 2>,
    /// Load-balancing loss [1]
    pub loss: Tensor<B, 1>,
    /// Gate matrix [batch, num_experts]
    pub gates: Tensor<B, 2>,
    /// Per-expert load [num_experts]
    pub load: Tensor<B, 1>,
    /// Examples routed to each expert
    pub part_sizes: Vec<usize>,
}

/// Routes a flattened batch through a pool of experts
///
/// Only experts with at least one assigned example are run.
///
/// # Arguments
///
/// * `gate` - Gate network
/// * `experts` - Expert pool, one per gate column
/// * `x` - Input tensor [batch, input_size]
/// * `training` - Enables gate noise
/// * `loss_coef` - Multiplier on the load-balancing loss
pub fn route<B: Backend, E: Expert<B>>(
    gate: &NoisyTopKGate<B>,
    experts: &[E],
    x: Tensor<B, 2>,
    training: bool,
    loss_coef: f64,
) -> Result<Routed<B>> {
    if experts.len() != gate.num_experts() {
        return Err(MoeError::InvalidConfig(format!(
            "gate has {} experts but the pool has {}",
            gate.num_experts(),
            experts.len()
        )));
    }
    let [batch, _] = x.dims();

    let GateOutput { gates, load } = gate.forward(x.clone(), training);

    let importance = gates.clone().sum_dim(0).reshape([gate.num_experts()]);
    let loss = load_balancing_loss(importance, load.clone(), loss_coef);

    let dispatcher = SparseDispatcher::new(gate.num_experts(), gates.clone())?;
    let expert_inputs = dispatcher.dispatch(x)?;

    let expert_outputs: Vec<Tensor<B, 2>> = expert_inputs
        .into_iter()
        .zip(experts)
        .enumerate()
        .filter_map(|(idx, (input, expert))| match input {
            Some(input) => Some(expert.forward(input)),
            None => {
                tracing::trace!(expert = idx, "skipping expert with no examples");
                None
            }
        })
        .collect();

    let output = dispatcher.combine(expert_outputs, true)?;
    tracing::debug!(batch, part_sizes = ?dispatcher.part_sizes(), "routed batch");

    Ok(Routed {
        output,
        loss,
        gates,
        load,
        part_sizes: dispatcher.part_sizes().to_vec(),
    })
}

impl<B: Backend> SparseMoe<B> {
    pub fn num_experts(&self) -> usize {
        self.experts.len()
    }

    pub fn k(&self) -> usize {
        self.gate.k()
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    /// Configured load-balancing coefficient
    pub fn loss_coef(&self) -> f64 {
        self.loss_coef
    }

    pub fn gate(&self) -> &NoisyTopKGate<B> {
        &self.gate
    }

    pub fn experts(&self) -> &[FeedForwardExpert<B>] {
        &self.experts
    }

    /// Forward pass with the configured loss coefficient
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [batch, ...], flattened to [batch, input_size]
    /// * `labels` - Class indices [batch]
    /// * `training` - Training mode: enables gate noise and, with labels,
    ///   returns losses instead of predictions
    pub fn forward<const D: usize>(
        &self,
        x: Tensor<B, D>,
        labels: Option<Tensor<B, 1, Int>>,
        training: bool,
    ) -> Result<MoeOutput<B>> {
        self.forward_with_coef(x, labels, training, self.loss_coef)
    }

    /// Forward pass with a per-call load-balancing coefficient
    pub fn forward_with_coef<const D: usize>(
        &self,
        x: Tensor<B, D>,
        labels: Option<Tensor<B, 1, Int>>,
        training: bool,
        loss_coef: f64,
    ) -> Result<MoeOutput<B>> {
        match labels {
            Some(labels) if training => {
                let (target_loss, loss) = self.forward_losses(x, labels, loss_coef)?;
                Ok(MoeOutput::Training { target_loss, loss })
            }
            _ => {
                let routed = self.route(x, training, loss_coef)?;
                Ok(MoeOutput::Prediction {
                    prediction_scores: routed.output,
                })
            }
        }
    }

    /// Training-mode forward returning `(target_loss, loss)`
    ///
    /// `target_loss` is the cross-entropy between the combined output and
    /// `labels`; `loss` is the load-balancing term.
    pub fn forward_losses<const D: usize>(
        &self,
        x: Tensor<B, D>,
        labels: Tensor<B, 1, Int>,
        loss_coef: f64,
    ) -> Result<(Tensor<B, 1>, Tensor<B, 1>)> {
        let routed = self.route(x, true, loss_coef)?;
        self.check_labels(&labels, routed.output.dims()[0])?;

        let target_loss = CrossEntropyLossConfig::new()
            .init(&routed.output.device())
            .forward(routed.output, labels);
        Ok((target_loss, routed.loss))
    }

    /// Runs gate, dispatch, experts and combine, keeping the routing details
    pub fn route<const D: usize>(
        &self,
        x: Tensor<B, D>,
        training: bool,
        loss_coef: f64,
    ) -> Result<Routed<B>> {
        let x = self.flatten(x)?;
        route(&self.gate, &self.experts, x, training, loss_coef)
    }

    /// Flattens every example to a single feature vector
    fn flatten<const D: usize>(&self, x: Tensor<B, D>) -> Result<Tensor<B, 2>> {
        let dims = x.dims();
        if D < 2 {
            return Err(MoeError::ShapeMismatch {
                what: "input",
                expected: vec![0, self.input_size],
                actual: dims.to_vec(),
            });
        }
        let batch = dims[0];
        let features: usize = dims[1..].iter().product();
        if features != self.input_size {
            return Err(MoeError::ShapeMismatch {
                what: "input",
                expected: vec![batch, self.input_size],
                actual: dims.to_vec(),
            });
        }
        Ok(x.reshape([batch, features]))
    }

    fn check_labels(&self, labels: &Tensor<B, 1, Int>, batch: usize) -> Result<()> {
        let [len] = labels.dims();
        if len != batch {
            return Err(MoeError::ShapeMismatch {
                what: "labels",
                expected: vec![batch],
                actual: vec![len],
            });
        }
        let num_classes = self.output_size;
        match labels
            .to_data()
            .iter::<i64>()
            .find(|&label| label < 0 || label as usize >= num_classes)
        {
            Some(label) => Err(MoeError::InvalidLabel { label, num_classes }),
            None => Ok(()),
        }
    }
}
