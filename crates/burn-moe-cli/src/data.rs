//! Synthetic classification data
//!
//! Gaussian clusters, one per class, so the router has something to
//! specialize on without any dataset on disk.

use anyhow::{ensure, Result};
use burn::prelude::*;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// One isotropic Gaussian blob per class
pub struct ClusterDataset {
    centers: Vec<Vec<f32>>,
    noise: Normal<f32>,
}

impl ClusterDataset {
    /// Draws class centers with the given spread between them
    ///
    /// # Arguments
    ///
    /// * `input_size` - Feature dimension
    /// * `num_classes` - Number of clusters
    /// * `separation` - Standard deviation of the center coordinates
    /// * `spread` - Standard deviation of points around their center
    pub fn new(
        input_size: usize,
        num_classes: usize,
        separation: f32,
        spread: f32,
        rng: &mut StdRng,
    ) -> Result<Self> {
        ensure!(input_size > 0 && num_classes > 0, "empty dataset shape");
        let center_dist = Normal::new(0.0, separation)?;
        let centers = (0..num_classes)
            .map(|_| (0..input_size).map(|_| center_dist.sample(&mut *rng)).collect())
            .collect();

        Ok(Self {
            centers,
            noise: Normal::new(0.0, spread)?,
        })
    }

    pub fn input_size(&self) -> usize {
        self.centers[0].len()
    }

    pub fn num_classes(&self) -> usize {
        self.centers.len()
    }

    /// Samples a labelled batch
    ///
    /// # Returns
    ///
    /// Features [batch_size, input_size] and labels [batch_size]
    pub fn sample<B: Backend>(
        &self,
        batch_size: usize,
        rng: &mut StdRng,
        device: &B::Device,
    ) -> (Tensor<B, 2>, Tensor<B, 1, Int>) {
        let input_size = self.input_size();
        let mut features = Vec::with_capacity(batch_size * input_size);
        let mut labels = Vec::with_capacity(batch_size);

        for _ in 0..batch_size {
            let class = rng.random_range(0..self.num_classes());
            features.extend(
                self.centers[class]
                    .iter()
                    .map(|c| c + self.noise.sample(&mut *rng)),
            );
            labels.push(class as i64);
        }

        (
            Tensor::from_data(TensorData::new(features, [batch_size, input_size]), device),
            Tensor::from_data(TensorData::new(labels, [batch_size]), device),
        )
    }
}
