//! Training step for the MoE layer
//!
//! A thin loop body around `burn::optim`: forward in training mode, add the
//! load-balancing loss to the task loss, backpropagate and apply AdamW.

use burn::module::AutodiffModule;
use burn::optim::grad_clipping::GradientClippingConfig;
use burn::optim::{AdamWConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::moe::SparseMoe;

/// Optimizer and loss settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f32,
    #[serde(default = "default_beta_1")]
    pub beta_1: f32,
    #[serde(default = "default_beta_2")]
    pub beta_2: f32,
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,
    /// Maximum L2 norm of the gradients; `None` disables clipping
    #[serde(default = "default_grad_clip_norm")]
    pub grad_clip_norm: Option<f32>,
    /// Overrides the layer's load-balancing coefficient when set
    #[serde(default)]
    pub loss_coef: Option<f64>,
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_weight_decay() -> f32 {
    0.01
}

fn default_beta_1() -> f32 {
    0.9
}

fn default_beta_2() -> f32 {
    0.999
}

fn default_epsilon() -> f32 {
    1e-8
}

fn default_grad_clip_norm() -> Option<f32> {
    Some(1.0)
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            beta_1: default_beta_1(),
            beta_2: default_beta_2(),
            epsilon: default_epsilon(),
            grad_clip_norm: default_grad_clip_norm(),
            loss_coef: None,
        }
    }
}

impl TrainerConfig {
    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn with_grad_clip_norm(mut self, grad_clip_norm: Option<f32>) -> Self {
        self.grad_clip_norm = grad_clip_norm;
        self
    }

    pub fn with_loss_coef(mut self, loss_coef: f64) -> Self {
        self.loss_coef = Some(loss_coef);
        self
    }

    /// AdamW settings
    ///
    /// Weight decay applies to every parameter, biases included.
    pub fn optimizer(&self) -> AdamWConfig {
        AdamWConfig::new()
            .with_beta_1(self.beta_1)
            .with_beta_2(self.beta_2)
            .with_epsilon(self.epsilon)
            .with_weight_decay(self.weight_decay)
            .with_grad_clipping(self.grad_clip_norm.map(GradientClippingConfig::Norm))
    }
}

/// Losses of one optimizer step, read back to the host
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepStats {
    pub target_loss: f32,
    pub aux_loss: f32,
    pub total_loss: f32,
}

/// Inference-mode metrics on a labelled batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalStats {
    pub accuracy: f32,
    pub num_examples: usize,
}

/// Owns a model and its optimizer state
pub struct MoeTrainer<B: AutodiffBackend, O> {
    model: SparseMoe<B>,
    optim: O,
    config: TrainerConfig,
    steps: usize,
}

/// Creates a trainer using AdamW with the given settings
pub fn adamw_trainer<B: AutodiffBackend>(
    model: SparseMoe<B>,
    config: TrainerConfig,
) -> MoeTrainer<B, impl Optimizer<SparseMoe<B>, B>> {
    let optim = config.optimizer().init::<B, SparseMoe<B>>();
    MoeTrainer::new(model, optim, config)
}

impl<B: AutodiffBackend, O: Optimizer<SparseMoe<B>, B>> MoeTrainer<B, O> {
    pub fn new(model: SparseMoe<B>, optim: O, config: TrainerConfig) -> Self {
        Self {
            model,
            optim,
            config,
            steps: 0,
        }
    }

    pub fn model(&self) -> &SparseMoe<B> {
        &self.model
    }

    pub fn into_model(self) -> SparseMoe<B> {
        self.model
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// One optimizer step on a labelled batch
    ///
    /// Minimizes `target_loss + loss`, where `loss` is the load-balancing
    /// term.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [batch, ...]
    /// * `labels` - Class indices [batch]
    pub fn step<const D: usize>(
        &mut self,
        x: Tensor<B, D>,
        labels: Tensor<B, 1, Int>,
    ) -> Result<StepStats> {
        let loss_coef = self
            .config
            .loss_coef
            .unwrap_or_else(|| self.model.loss_coef());
        let (target_loss, aux_loss) = self.model.forward_losses(x, labels, loss_coef)?;
        let total = target_loss.clone() + aux_loss.clone();

        let stats = StepStats {
            target_loss: target_loss.into_scalar().elem(),
            aux_loss: aux_loss.into_scalar().elem(),
            total_loss: total.clone().into_scalar().elem(),
        };

        let grads = total.backward();
        let grads = GradientsParams::from_grads(grads, &self.model);
        self.model = self
            .optim
            .step(self.config.learning_rate, self.model.clone(), grads);
        self.steps += 1;

        tracing::debug!(
            step = self.steps,
            target_loss = stats.target_loss,
            aux_loss = stats.aux_loss,
            "optimizer step"
        );
        Ok(stats)
    }

    /// Accuracy of the current model without gate noise or gradients
    pub fn evaluate<const D: usize>(
        &self,
        x: Tensor<B, D>,
        labels: Tensor<B, 1, Int>,
    ) -> Result<EvalStats> {
        evaluate(&self.model.valid(), x.inner(), labels.to_data())
    }
}

/// Accuracy of `model` on a labelled batch in inference mode
pub fn evaluate<B: Backend, const D: usize>(
    model: &SparseMoe<B>,
    x: Tensor<B, D>,
    labels: TensorData,
) -> Result<EvalStats> {
    let routed = model.route(x, false, model.loss_coef())?;
    let predicted: Vec<i64> = routed.output.argmax(1).to_data().iter::<i64>().collect();
    let expected: Vec<i64> = labels.iter::<i64>().collect();

    let correct = predicted
        .iter()
        .zip(&expected)
        .filter(|(p, l)| p == l)
        .count();
    let num_examples = predicted.len();
    Ok(EvalStats {
        accuracy: correct as f32 / num_examples.max(1) as f32,
        num_examples,
    })
}
