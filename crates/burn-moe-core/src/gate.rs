//! Noisy top-k gating
//!
//! Scores every expert for every example, keeps the `k` best and softmaxes
//! over them. During training, tunable Gaussian noise is added to the
//! logits, which both encourages exploration and lets the expected load of
//! each expert be estimated in closed form.
//!
//! # References
//!
//! - [Outrageously Large Neural Networks: The Sparsely-Gated Mixture-of-Experts Layer](https://arxiv.org/abs/1701.06538)

use burn::module::Param;
use burn::nn::Initializer;
use burn::prelude::*;
use burn::tensor::activation::{softmax, softplus};
use burn::tensor::{Distribution, IndexingUpdateOp};
use serde::{Deserialize, Serialize};

use crate::error::{MoeError, Result};
use crate::normal::Normal;

/// Default floor added to the noise standard deviation
pub const DEFAULT_NOISE_EPSILON: f64 = 1e-2;

/// Gate network producing sparse per-example expert weights
#[derive(Module, Debug)]
pub struct NoisyTopKGate<B: Backend> {
    /// Clean logit projection [input_size, num_experts]
    w_gate: Param<Tensor<B, 2>>,
    /// Noise scale projection [input_size, num_experts]
    w_noise: Param<Tensor<B, 2>>,
    num_experts: usize,
    k: usize,
    noisy_gating: bool,
    noise_epsilon: f64,
}

/// Configuration for NoisyTopKGate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoisyTopKGateConfig {
    /// Feature dimension of each example
    pub input_size: usize,
    /// Total number of experts
    pub num_experts: usize,
    /// Number of experts selected per example
    pub k: usize,
    /// Whether to inject noise into the logits during training
    #[serde(default = "default_noisy_gating")]
    pub noisy_gating: bool,
    /// Added to softplus(x @ w_noise) so the noise scale never reaches zero
    #[serde(default = "default_noise_epsilon")]
    pub noise_epsilon: f64,
    /// Initializer for both gate projections
    #[serde(default = "default_initializer")]
    pub initializer: Initializer,
}

fn default_noisy_gating() -> bool {
    true
}

fn default_noise_epsilon() -> f64 {
    DEFAULT_NOISE_EPSILON
}

fn default_initializer() -> Initializer {
    Initializer::Zeros
}

impl NoisyTopKGateConfig {
    /// Creates a config with noisy gating and zero-initialized projections
    pub fn new(input_size: usize, num_experts: usize, k: usize) -> Self {
        Self {
            input_size,
            num_experts,
            k,
            noisy_gating: default_noisy_gating(),
            noise_epsilon: default_noise_epsilon(),
            initializer: default_initializer(),
        }
    }

    pub fn with_noisy_gating(mut self, noisy_gating: bool) -> Self {
        self.noisy_gating = noisy_gating;
        self
    }

    pub fn with_noise_epsilon(mut self, noise_epsilon: f64) -> Self {
        self.noise_epsilon = noise_epsilon;
        self
    }

    pub fn with_initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = initializer;
        self
    }

    /// Checks the routing invariants
    pub fn validate(&self) -> Result<()> {
        if self.input_size == 0 {
            return Err(MoeError::InvalidConfig("input_size must be > 0".into()));
        }
        if self.num_experts == 0 {
            return Err(MoeError::InvalidConfig("num_experts must be > 0".into()));
        }
        if self.k == 0 {
            return Err(MoeError::InvalidConfig("k must be > 0".into()));
        }
        if self.k > self.num_experts {
            return Err(MoeError::TopKExceedsExperts {
                k: self.k,
                num_experts: self.num_experts,
            });
        }
        if !(self.noise_epsilon.is_finite() && self.noise_epsilon > 0.0) {
            return Err(MoeError::InvalidConfig(format!(
                "noise_epsilon must be > 0, got {}",
                self.noise_epsilon
            )));
        }
        Ok(())
    }

    /// Initializes the gate
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<NoisyTopKGate<B>> {
        self.validate()?;
        let shape = [self.input_size, self.num_experts];

        Ok(NoisyTopKGate {
            w_gate: self.initializer.init(shape, device),
            w_noise: self.initializer.init(shape, device),
            num_experts: self.num_experts,
            k: self.k,
            noisy_gating: self.noisy_gating,
            noise_epsilon: self.noise_epsilon,
        })
    }

    /// Builds a gate around existing projection weights
    pub fn init_with_weights<B: Backend>(
        &self,
        w_gate: Tensor<B, 2>,
        w_noise: Tensor<B, 2>,
    ) -> Result<NoisyTopKGate<B>> {
        self.validate()?;
        let expected = [self.input_size, self.num_experts];
        for (what, weight) in [("w_gate", &w_gate), ("w_noise", &w_noise)] {
            if weight.dims() != expected {
                return Err(MoeError::ShapeMismatch {
                    what,
                    expected: expected.to_vec(),
                    actual: weight.dims().to_vec(),
                });
            }
        }

        Ok(NoisyTopKGate {
            w_gate: Param::from_tensor(w_gate),
            w_noise: Param::from_tensor(w_noise),
            num_experts: self.num_experts,
            k: self.k,
            noisy_gating: self.noisy_gating,
            noise_epsilon: self.noise_epsilon,
        })
    }
}

/// Gate values and expert load for a batch
#[derive(Debug, Clone)]
pub struct GateOutput<B: Backend> {
    /// Sparse gate matrix [batch, num_experts], `k` nonzeros per row
    pub gates: Tensor<B, 2>,
    /// Per-expert load estimate [num_experts]
    pub load: Tensor<B, 1>,
}

impl<B: Backend> NoisyTopKGate<B> {
    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn noisy_gating(&self) -> bool {
        self.noisy_gating
    }

    /// Computes gates and load
    ///
    /// Noise is only sampled when the gate is noisy and `training` is set.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [batch, input_size]
    /// * `training` - Whether the call is part of a training step
    pub fn forward(&self, x: Tensor<B, 2>, training: bool) -> GateOutput<B> {
        let noise = (self.noisy_gating && training).then(|| {
            let [batch, _] = x.dims();
            Tensor::random(
                [batch, self.num_experts],
                Distribution::Normal(0.0, 1.0),
                &x.device(),
            )
        });
        self.forward_with_noise(x, noise)
    }

    /// Computes gates and load with caller-supplied noise
    ///
    /// `Some(noise)` takes the noisy training path with `noise` as the
    /// standard-normal sample [batch, num_experts]; `None` uses the clean
    /// logits.
    pub fn forward_with_noise(
        &self,
        x: Tensor<B, 2>,
        noise: Option<Tensor<B, 2>>,
    ) -> GateOutput<B> {
        let clean_logits = x.clone().matmul(self.w_gate.val());

        let noisy = noise.map(|noise| {
            let raw_noise_stddev = x.matmul(self.w_noise.val());
            let noise_stddev = softplus(raw_noise_stddev, 1.0).add_scalar(self.noise_epsilon);
            let noisy_logits = clean_logits.clone() + noise * noise_stddev.clone();
            (noisy_logits, noise_stddev)
        });
        let logits = match &noisy {
            Some((noisy_logits, _)) => noisy_logits.clone(),
            None => clean_logits.clone(),
        };

        // One extra value for the load threshold
        let m = (self.k + 1).min(self.num_experts);
        let (top_logits, top_indices) = logits.topk_with_indices(m, 1);
        let top_k_logits = top_logits.clone().narrow(1, 0, self.k);
        let top_k_indices = top_indices.narrow(1, 0, self.k);
        let top_k_gates = softmax(top_k_logits, 1);

        let gates = self.scatter_gates(top_k_gates, top_k_indices);

        let load = match noisy {
            Some((noisy_logits, noise_stddev)) if self.k < self.num_experts => self
                .prob_in_top_k(clean_logits, noisy_logits, noise_stddev, top_logits)
                .sum_dim(0)
                .reshape([self.num_experts]),
            _ => gates_to_load(gates.clone()),
        };

        GateOutput { gates, load }
    }

    /// Places the top-k gate values into a dense [batch, num_experts] matrix
    fn scatter_gates(
        &self,
        top_k_gates: Tensor<B, 2>,
        top_k_indices: Tensor<B, 2, Int>,
    ) -> Tensor<B, 2> {
        let [batch, _] = top_k_gates.dims();
        Tensor::<B, 2>::zeros([batch, self.num_experts], &top_k_gates.device()).scatter(
            1,
            top_k_indices,
            top_k_gates,
            IndexingUpdateOp::Add,
        )
    }

    /// Probability that each expert stays in the top k under resampled noise
    ///
    /// An expert currently in the top k must beat the (k+1)-th largest noisy
    /// logit; an expert outside must beat the k-th largest. Differentiable
    /// through `clean_values` and `noise_stddev`.
    ///
    /// # Arguments
    ///
    /// * `clean_values` - Clean logits [batch, num_experts]
    /// * `noisy_values` - Noisy logits [batch, num_experts]
    /// * `noise_stddev` - Noise scale [batch, num_experts]
    /// * `noisy_top_values` - Top (k+1) noisy logits, descending [batch, k + 1]
    fn prob_in_top_k(
        &self,
        clean_values: Tensor<B, 2>,
        noisy_values: Tensor<B, 2>,
        noise_stddev: Tensor<B, 2>,
        noisy_top_values: Tensor<B, 2>,
    ) -> Tensor<B, 2> {
        let normal = Normal::standard();

        let threshold_if_in = noisy_top_values.clone().narrow(1, self.k, 1);
        let threshold_if_out = noisy_top_values.narrow(1, self.k - 1, 1);
        let is_in = (noisy_values - threshold_if_in.clone()).greater_elem(0.0);

        let prob_if_in =
            normal.cdf((clean_values.clone() - threshold_if_in) / noise_stddev.clone());
        let prob_if_out = normal.cdf((clean_values - threshold_if_out) / noise_stddev);

        prob_if_out.mask_where(is_in, prob_if_in)
    }
}

/// Number of examples with a nonzero gate for each expert
pub fn gates_to_load<B: Backend>(gates: Tensor<B, 2>) -> Tensor<B, 1> {
    let [_, num_experts] = gates.dims();
    gates
        .greater_elem(0.0)
        .float()
        .sum_dim(0)
        .reshape([num_experts])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn random_gate(input_size: usize, num_experts: usize, k: usize) -> NoisyTopKGate<TestBackend> {
        NoisyTopKGateConfig::new(input_size, num_experts, k)
            .with_initializer(Initializer::Normal { mean: 0.0, std: 1.0 })
            .init(&Default::default())
            .unwrap()
    }

    fn rows(t: Tensor<TestBackend, 2>) -> Vec<Vec<f32>> {
        let [_, cols] = t.dims();
        let flat: Vec<f32> = t.into_data().to_vec().unwrap();
        flat.chunks(cols).map(|c| c.to_vec()).collect()
    }

    #[test]
    fn test_gate_rows_have_k_nonzeros_summing_to_one() {
        let device = Default::default();
        let gate = random_gate(16, 8, 3);
        let x = Tensor::<TestBackend, 2>::random([10, 16], Distribution::Normal(0.0, 1.0), &device);

        for training in [false, true] {
            let out = gate.forward(x.clone(), training);
            assert_eq!(out.gates.dims(), [10, 8]);
            for row in rows(out.gates) {
                let nonzero: Vec<f32> = row.into_iter().filter(|v| *v != 0.0).collect();
                assert_eq!(nonzero.len(), 3);
                assert!(nonzero.iter().all(|v| (0.0..=1.0).contains(v)));
                let sum: f32 = nonzero.iter().sum();
                assert!((sum - 1.0).abs() < 1e-5, "row sums to {sum}");
            }
        }
    }

    #[test]
    fn test_clean_load_counts_routed_examples() {
        let device = Default::default();
        let gate = random_gate(6, 4, 2);
        let x = Tensor::<TestBackend, 2>::random([7, 6], Distribution::Normal(0.0, 1.0), &device);

        let out = gate.forward(x, false);
        let load: Vec<f32> = out.load.into_data().to_vec().unwrap();
        assert_eq!(load.len(), 4);
        assert_eq!(load.iter().sum::<f32>(), 14.0);
        assert!(load.iter().all(|v| v.fract() == 0.0));
    }

    #[test]
    fn test_noisy_load_uses_normal_cdf() {
        let device = Default::default();
        let config = NoisyTopKGateConfig::new(1, 3, 1);
        let w_gate = Tensor::<TestBackend, 2>::from_floats([[1.0, 2.0, 3.0]], &device);
        let gate = config
            .init_with_weights(w_gate, Tensor::zeros([1, 3], &device))
            .unwrap();

        let x = Tensor::<TestBackend, 2>::ones([1, 1], &device);
        let out = gate.forward_with_noise(x, Some(Tensor::zeros([1, 3], &device)));

        // Zero noise: noisy == clean, top-2 = [3, 2], stddev = ln 2 + 0.01
        // Phi(-2 / stddev), Phi(-1 / stddev), Phi(1 / stddev)
        let expected = [0.002_225f32, 0.077_487, 0.922_513];

        let load: Vec<f32> = out.load.into_data().to_vec().unwrap();
        for (got, want) in load.iter().zip(expected) {
            assert!((got - want).abs() < 1e-4, "got {got}, want {want}");
        }

        let gates: Vec<f32> = out.gates.into_data().to_vec().unwrap();
        assert_eq!(gates, vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_noisy_load_k2_matches_reference() {
        let device = Default::default();
        let w_gate = Tensor::<TestBackend, 2>::from_floats(
            [[0.5, -0.2, 0.8, 0.1], [0.3, 0.9, -0.4, 0.2]],
            &device,
        );
        let w_noise = Tensor::<TestBackend, 2>::from_floats(
            [[0.2, -0.1, 0.4, 0.0], [-0.3, 0.5, 0.1, 0.2]],
            &device,
        );
        let gate = NoisyTopKGateConfig::new(2, 4, 2)
            .init_with_weights(w_gate, w_noise)
            .unwrap();

        let x = Tensor::<TestBackend, 2>::from_floats([[1.0, -0.5], [0.3, 0.8]], &device);
        let noise = Tensor::<TestBackend, 2>::from_floats(
            [[0.5, -1.0, 0.2, 1.5], [-0.3, 0.8, -1.2, 0.4]],
            &device,
        );
        let out = gate.forward_with_noise(x, Some(noise));

        // Computed independently: stddev = softplus(x @ w_noise) + 0.01,
        // thresholds from the top-3 noisy logits of each row
        let expected_load = [0.666_18f32, 0.693_802, 0.824_754, 0.604_188];
        let load: Vec<f32> = out.load.into_data().to_vec().unwrap();
        for (got, want) in load.iter().zip(expected_load) {
            assert!((got - want).abs() < 1e-4, "load {got}, want {want}");
        }

        let expected_gates = [
            [0.0f32, 0.0, 0.549_112, 0.450_888],
            [0.0, 0.706_738, 0.0, 0.293_262],
        ];
        for (got, want) in rows(out.gates).iter().zip(expected_gates) {
            for (g, w) in got.iter().zip(want) {
                assert!((g - w).abs() < 1e-4, "gate {g}, want {w}");
            }
        }
    }

    #[test]
    fn test_gates_land_on_top_k_columns() {
        let device = Default::default();
        let w_gate = Tensor::<TestBackend, 2>::from_floats([[1.0, 3.0, 2.0, 0.0]], &device);
        let gate = NoisyTopKGateConfig::new(1, 4, 2)
            .with_noisy_gating(false)
            .init_with_weights(w_gate, Tensor::zeros([1, 4], &device))
            .unwrap();
        let x = Tensor::<TestBackend, 2>::from_floats([[1.0], [-1.0]], &device);

        let gates = rows(gate.forward(x, false).gates);

        // softmax([3, 2]) for the first row, softmax([0, -1]) for the second
        let high = std::f32::consts::E / (std::f32::consts::E + 1.0);
        let expected = [[0.0, high, 1.0 - high, 0.0], [1.0 - high, 0.0, 0.0, high]];
        for (got, want) in gates.iter().zip(expected) {
            for (g, w) in got.iter().zip(want) {
                assert!((g - w).abs() < 1e-5, "gate {g}, want {w}");
            }
        }
    }

    #[test]
    fn test_noise_changes_selection() {
        let device = Default::default();
        let config = NoisyTopKGateConfig::new(1, 2, 1);
        let w_gate = Tensor::<TestBackend, 2>::from_floats([[1.0, 0.0]], &device);
        let gate = config
            .init_with_weights(w_gate, Tensor::zeros([1, 2], &device))
            .unwrap();
        let x = Tensor::<TestBackend, 2>::ones([1, 1], &device);

        let clean: Vec<f32> = gate
            .forward_with_noise(x.clone(), None)
            .gates
            .into_data()
            .to_vec()
            .unwrap();
        assert_eq!(clean, vec![1.0, 0.0]);

        // A large draw for expert 1 flips the winner
        let noise = Tensor::from_floats([[0.0, 10.0]], &device);
        let noisy: Vec<f32> = gate
            .forward_with_noise(x, Some(noise))
            .gates
            .into_data()
            .to_vec()
            .unwrap();
        assert_eq!(noisy, vec![0.0, 1.0]);
    }

    #[test]
    fn test_k_equal_to_num_experts_uses_hard_load() {
        let device = Default::default();
        let gate = random_gate(4, 3, 3);
        let x = Tensor::<TestBackend, 2>::random([5, 4], Distribution::Normal(0.0, 1.0), &device);

        let out = gate.forward(x, true);
        let load: Vec<f32> = out.load.into_data().to_vec().unwrap();
        assert_eq!(load, vec![5.0, 5.0, 5.0]);
    }

    #[test]
    fn test_single_expert() {
        let device = Default::default();
        let gate = random_gate(4, 1, 1);
        let x = Tensor::<TestBackend, 2>::random([3, 4], Distribution::Normal(0.0, 1.0), &device);

        let out = gate.forward(x, true);
        let gates: Vec<f32> = out.gates.into_data().to_vec().unwrap();
        assert_eq!(gates, vec![1.0, 1.0, 1.0]);
        let load: Vec<f32> = out.load.into_data().to_vec().unwrap();
        assert_eq!(load, vec![3.0]);
    }

    #[test]
    fn test_config_rejects_k_above_num_experts() {
        let result = NoisyTopKGateConfig::new(4, 2, 3).init::<TestBackend>(&Default::default());
        assert!(matches!(
            result,
            Err(MoeError::TopKExceedsExperts { k: 3, num_experts: 2 })
        ));
    }

    #[test]
    fn test_config_rejects_zero_noise_epsilon() {
        let config = NoisyTopKGateConfig::new(4, 2, 1).with_noise_epsilon(0.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serde_defaults() {
        let config: NoisyTopKGateConfig =
            serde_json::from_str(r#"{"input_size": 8, "num_experts": 4, "k": 2}"#).unwrap();
        assert!(config.noisy_gating);
        assert_eq!(config.noise_epsilon, DEFAULT_NOISE_EPSILON);
    }
}
