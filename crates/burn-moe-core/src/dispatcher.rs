//! Sparse dispatch and combine
//!
//! Turns a sparse gate matrix into per-expert mini-batches and stitches the
//! expert outputs back into batch order. Batch element `b` is sent to expert
//! `e` iff `gates[b, e] != 0`, so an example routed to `k` experts appears
//! `k` times across the expert inputs.
//!
//! ```text
//! dispatcher = SparseDispatcher::new(num_experts, gates)
//! inputs     = dispatcher.dispatch(x)          // one group per expert
//! outputs    = [experts[e](inputs[e]) for non-empty e]
//! y          = dispatcher.combine(outputs)     // y[b] = log sum_e gates[b, e] * exp(expert_e(x[b]))
//! ```
//!
//! Expert outputs are treated as log-probabilities: `combine` exponentiates
//! them, takes the gate-weighted sum and converts back with `log`.

use burn::prelude::*;
use burn::tensor::IndexingUpdateOp;

use crate::error::{MoeError, Result};

/// Replacement for exactly-zero combined entries before taking the log
pub const COMBINE_EPSILON: f64 = f64::EPSILON;

/// Routes a batch to experts according to a sparse gate matrix
#[derive(Debug, Clone)]
pub struct SparseDispatcher<B: Backend> {
    num_experts: usize,
    batch_size: usize,
    /// Number of examples assigned to each expert
    part_sizes: Vec<usize>,
    /// Batch position of each assignment, sorted by expert
    batch_index: Vec<usize>,
    /// Expert of each assignment, ascending
    expert_index: Vec<usize>,
    /// Gate value of each assignment: [num_assignments, 1]
    nonzero_gates: Tensor<B, 2>,
    device: B::Device,
}

impl<B: Backend> SparseDispatcher<B> {
    /// Builds the assignment index from a gate matrix
    ///
    /// # Arguments
    ///
    /// * `num_experts` - Number of experts (columns of `gates`)
    /// * `gates` - Gate matrix [batch_size, num_experts]
    pub fn new(num_experts: usize, gates: Tensor<B, 2>) -> Result<Self> {
        let [batch_size, columns] = gates.dims();
        if columns != num_experts {
            return Err(MoeError::ShapeMismatch {
                what: "gates",
                expected: vec![batch_size, num_experts],
                actual: vec![batch_size, columns],
            });
        }
        let device = gates.device();

        // Row-major enumeration of the nonzero entries
        let values: Vec<f32> = gates.to_data().iter::<f32>().collect();
        let mut assignments: Vec<(usize, usize)> = values
            .iter()
            .enumerate()
            .filter(|(_, v)| **v != 0.0)
            .map(|(flat, _)| (flat / num_experts, flat % num_experts))
            .collect();

        if assignments.is_empty() {
            return Err(MoeError::EmptyRouting);
        }

        // Stable: ties keep batch order
        assignments.sort_by_key(|&(_, expert)| expert);

        let mut part_sizes = vec![0usize; num_experts];
        for &(_, expert) in &assignments {
            part_sizes[expert] += 1;
        }
        let (batch_index, expert_index): (Vec<usize>, Vec<usize>) =
            assignments.into_iter().unzip();

        let num_assignments = batch_index.len();
        let rows = index_tensor::<B>(&batch_index, &device);
        let cols = index_tensor::<B>(&expert_index, &device).reshape([num_assignments, 1]);
        let nonzero_gates = gates.select(0, rows).gather(1, cols);

        tracing::debug!(
            batch_size,
            num_assignments,
            ?part_sizes,
            "built sparse dispatcher"
        );

        Ok(Self {
            num_experts,
            batch_size,
            part_sizes,
            batch_index,
            expert_index,
            nonzero_gates,
            device,
        })
    }

    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of examples routed to each expert
    pub fn part_sizes(&self) -> &[usize] {
        &self.part_sizes
    }

    /// Batch position of every assignment, grouped by expert
    pub fn batch_index(&self) -> &[usize] {
        &self.batch_index
    }

    /// Expert of every assignment (ascending)
    pub fn expert_index(&self) -> &[usize] {
        &self.expert_index
    }

    pub fn num_assignments(&self) -> usize {
        self.batch_index.len()
    }

    /// Experts that received at least one example, ascending
    pub fn non_empty_experts(&self) -> Vec<usize> {
        self.part_sizes
            .iter()
            .enumerate()
            .filter(|(_, size)| **size > 0)
            .map(|(expert, _)| expert)
            .collect()
    }

    /// Creates one input group per expert
    ///
    /// Group `e` holds the rows of `inp` whose gate for expert `e` is
    /// nonzero, in batch order. Experts without assignments get `None` and
    /// must not be run.
    ///
    /// # Arguments
    ///
    /// * `inp` - Input tensor [batch_size, depth]
    ///
    /// # Returns
    ///
    /// `num_experts` groups of shape [part_sizes[e], depth]
    pub fn dispatch(&self, inp: Tensor<B, 2>) -> Result<Vec<Option<Tensor<B, 2>>>> {
        let [rows, depth] = inp.dims();
        if rows != self.batch_size {
            return Err(MoeError::ShapeMismatch {
                what: "dispatch input",
                expected: vec![self.batch_size, depth],
                actual: vec![rows, depth],
            });
        }

        let expanded = inp.select(0, index_tensor::<B>(&self.batch_index, &self.device));
        Ok(self.split(expanded))
    }

    /// Sums the expert outputs back into batch order
    ///
    /// `expert_out` holds one tensor per non-empty expert, in ascending
    /// expert order. Outputs are log-domain: they are exponentiated,
    /// optionally weighted by the gates, summed per batch element and
    /// returned in log space. Batch elements that received nothing get
    /// `log(COMBINE_EPSILON)`.
    ///
    /// # Returns
    ///
    /// Tensor [batch_size, output_size]
    pub fn combine(
        &self,
        expert_out: Vec<Tensor<B, 2>>,
        multiply_by_gates: bool,
    ) -> Result<Tensor<B, 2>> {
        let expected_sizes: Vec<usize> = self
            .part_sizes
            .iter()
            .copied()
            .filter(|&size| size > 0)
            .collect();
        if expert_out.len() != expected_sizes.len() {
            return Err(MoeError::ExpertOutputCount {
                expected: expected_sizes.len(),
                actual: expert_out.len(),
            });
        }
        let output_size = expert_out[0].dims()[1];
        for (out, &size) in expert_out.iter().zip(&expected_sizes) {
            let dims = out.dims();
            if dims != [size, output_size] {
                return Err(MoeError::ShapeMismatch {
                    what: "expert output",
                    expected: vec![size, output_size],
                    actual: dims.to_vec(),
                });
            }
        }

        // Leave log space
        let mut stitched = Tensor::cat(expert_out, 0).exp();
        if multiply_by_gates {
            stitched = stitched * self.nonzero_gates.clone();
        }

        // Grouped sum: combined[b] = sum of stitched[j] over j with batch_index[j] == b
        let rows = index_tensor::<B>(&self.batch_index, &self.device);
        let combined = Tensor::<B, 2>::zeros([self.batch_size, output_size], &self.device)
            .select_assign(0, rows, stitched, IndexingUpdateOp::Add);

        let unrouted = combined.clone().equal_elem(0.0);
        Ok(combined.mask_fill(unrouted, COMBINE_EPSILON).log())
    }

    /// Gate values matching the rows of each expert's input group
    pub fn expert_to_gates(&self) -> Vec<Option<Tensor<B, 1>>> {
        self.split(self.nonzero_gates.clone())
            .into_iter()
            .map(|group| {
                group.map(|gates| {
                    let [rows, _] = gates.dims();
                    gates.reshape([rows])
                })
            })
            .collect()
    }

    /// Splits an assignment-ordered tensor into per-expert groups
    fn split(&self, sorted: Tensor<B, 2>) -> Vec<Option<Tensor<B, 2>>> {
        let mut offset = 0;
        self.part_sizes
            .iter()
            .map(|&size| {
                if size == 0 {
                    return None;
                }
                let group = sorted.clone().narrow(0, offset, size);
                offset += size;
                Some(group)
            })
            .collect()
    }
}

fn index_tensor<B: Backend>(indices: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let data: Vec<i64> = indices.iter().map(|&i| i as i64).collect();
    Tensor::from_data(TensorData::new(data, [indices.len()]), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn gates_4x3(device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 2> {
        // batch 0 -> experts 0, 2; batch 1 -> experts 1, 2; batch 2 -> experts 0, 3
        Tensor::from_floats(
            [
                [0.7, 0.0, 0.3, 0.0],
                [0.0, 0.4, 0.6, 0.0],
                [0.5, 0.0, 0.0, 0.5],
            ],
            device,
        )
    }

    #[test]
    fn test_assignment_index_sorted_by_expert() {
        let device = Default::default();
        let dispatcher = SparseDispatcher::new(4, gates_4x3(&device)).unwrap();

        assert_eq!(dispatcher.part_sizes(), &[2, 1, 2, 1]);
        assert_eq!(dispatcher.expert_index(), &[0, 0, 1, 2, 2, 3]);
        // Ties keep batch order
        assert_eq!(dispatcher.batch_index(), &[0, 2, 1, 0, 1, 2]);
        assert_eq!(dispatcher.num_assignments(), 6);
    }

    #[test]
    fn test_expert_to_gates_follow_assignment_order() {
        let device = Default::default();
        let dispatcher = SparseDispatcher::new(4, gates_4x3(&device)).unwrap();

        let groups = dispatcher.expert_to_gates();
        let expected: [&[f32]; 4] = [&[0.7, 0.5], &[0.4], &[0.3, 0.6], &[0.5]];
        for (group, want) in groups.into_iter().zip(expected) {
            let got: Vec<f32> = group.unwrap().into_data().to_vec().unwrap();
            assert_eq!(got, want);
        }
    }

    #[test]
    fn test_dispatch_duplicates_rows() {
        let device = Default::default();
        let dispatcher = SparseDispatcher::new(4, gates_4x3(&device)).unwrap();
        let x = Tensor::<TestBackend, 2>::from_floats([[1.0, 1.0], [2.0, 2.0], [3.0, 3.0]], &device);

        let groups = dispatcher.dispatch(x).unwrap();
        assert_eq!(groups.len(), 4);

        let expert0: Vec<f32> = groups[0].clone().unwrap().into_data().to_vec().unwrap();
        assert_eq!(expert0, vec![1.0, 1.0, 3.0, 3.0]);
        let expert2: Vec<f32> = groups[2].clone().unwrap().into_data().to_vec().unwrap();
        assert_eq!(expert2, vec![1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_empty_expert_gets_no_group() {
        let device = Default::default();
        let gates = Tensor::<TestBackend, 2>::from_floats([[1.0, 0.0, 0.0], [0.0, 0.0, 1.0]], &device);
        let dispatcher = SparseDispatcher::new(3, gates).unwrap();

        let groups = dispatcher.dispatch(Tensor::ones([2, 5], &device)).unwrap();
        assert!(groups[0].is_some());
        assert!(groups[1].is_none());
        assert!(groups[2].is_some());
        assert_eq!(dispatcher.non_empty_experts(), vec![0, 2]);
        assert!(dispatcher.expert_to_gates()[1].is_none());
    }

    #[test]
    fn test_combine_weights_by_gates_in_log_space() {
        let device = Default::default();
        let dispatcher = SparseDispatcher::new(4, gates_4x3(&device)).unwrap();

        // Each expert returns log(c_e) for every row
        let consts = [1.0f32, 2.0, 4.0, 8.0];
        let outputs: Vec<Tensor<TestBackend, 2>> = dispatcher
            .part_sizes()
            .iter()
            .zip(consts)
            .map(|(&size, c)| Tensor::full([size, 1], c.ln(), &device))
            .collect();

        let combined: Vec<f32> = dispatcher
            .combine(outputs, true)
            .unwrap()
            .exp()
            .into_data()
            .to_vec()
            .unwrap();

        let expected = [0.7 * 1.0 + 0.3 * 4.0, 0.4 * 2.0 + 0.6 * 4.0, 0.5 * 1.0 + 0.5 * 8.0];
        for (got, want) in combined.iter().zip(expected) {
            assert!((got - want).abs() < 1e-4, "got {got}, want {want}");
        }
    }

    #[test]
    fn test_combine_large_batch_accumulates_per_row() {
        let device = Default::default();
        let (batch, num_experts) = (4096, 8);

        // Every row split evenly between two neighbouring experts
        let mut gates = vec![0.0f32; batch * num_experts];
        for b in 0..batch {
            gates[b * num_experts + b % num_experts] = 0.5;
            gates[b * num_experts + (b + 1) % num_experts] = 0.5;
        }
        let gates = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(gates, [batch, num_experts]),
            &device,
        );
        let dispatcher = SparseDispatcher::new(num_experts, gates).unwrap();
        assert_eq!(dispatcher.num_assignments(), 2 * batch);

        let values: Vec<f32> = (0..batch).map(|b| (b % 17) as f32 * 0.1 - 0.8).collect();
        let x = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(values.clone(), [batch, 1]),
            &device,
        );
        let outputs: Vec<_> = dispatcher.dispatch(x).unwrap().into_iter().flatten().collect();

        // log(0.5 * exp(x) + 0.5 * exp(x)) = x
        let combined: Vec<f32> = dispatcher
            .combine(outputs, true)
            .unwrap()
            .into_data()
            .to_vec()
            .unwrap();
        assert_eq!(combined.len(), batch);
        for (got, want) in combined.iter().zip(&values) {
            assert!((got - want).abs() < 1e-4, "got {got}, want {want}");
        }
    }

    #[test]
    fn test_combine_unrouted_row_gets_epsilon() {
        let device = Default::default();
        let gates = Tensor::<TestBackend, 2>::from_floats([[1.0, 0.0], [0.0, 0.0]], &device);
        let dispatcher = SparseDispatcher::new(2, gates).unwrap();

        let combined: Vec<f32> = dispatcher
            .combine(vec![Tensor::zeros([1, 2], &device)], true)
            .unwrap()
            .into_data()
            .to_vec()
            .unwrap();

        assert_eq!(&combined[..2], &[0.0, 0.0]);
        let floor = (COMBINE_EPSILON as f32).ln();
        assert!((combined[2] - floor).abs() < 1e-3);
        assert!(combined.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_combine_rejects_wrong_output_count() {
        let device = Default::default();
        let dispatcher = SparseDispatcher::new(4, gates_4x3(&device)).unwrap();

        let err = dispatcher
            .combine(vec![Tensor::<TestBackend, 2>::zeros([2, 3], &device)], true)
            .unwrap_err();
        assert!(matches!(err, MoeError::ExpertOutputCount { expected: 4, actual: 1 }));
    }

    #[test]
    fn test_rejects_mismatched_gate_columns() {
        let device = Default::default();
        let result = SparseDispatcher::new(3, gates_4x3(&device));
        assert!(matches!(result, Err(MoeError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_all_zero_gates_is_an_error() {
        let device = Default::default();
        let gates = Tensor::<TestBackend, 2>::zeros([2, 3], &device);
        assert!(matches!(SparseDispatcher::new(3, gates), Err(MoeError::EmptyRouting)));
    }
}
