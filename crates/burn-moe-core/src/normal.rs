//! Closed-form Gaussian CDF
//!
//! Used by the noisy top-k gate to turn the distance between a clean logit
//! and the top-k threshold into the probability that the expert survives
//! the noise.

use std::f64::consts::SQRT_2;

use burn::prelude::*;

/// Normal distribution parameterized by location and scale
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normal {
    loc: f64,
    scale: f64,
}

impl Normal {
    /// Standard normal N(0, 1)
    pub fn standard() -> Self {
        Self {
            loc: 0.0,
            scale: 1.0,
        }
    }

    /// Elementwise CDF: `0.5 * (1 + erf((x - loc) / (scale * sqrt(2))))`
    pub fn cdf<B: Backend, const D: usize>(&self, value: Tensor<B, D>) -> Tensor<B, D> {
        value
            .sub_scalar(self.loc)
            .div_scalar(self.scale * SQRT_2)
            .erf()
            .add_scalar(1.0)
            .mul_scalar(0.5)
    }
}

impl Default for Normal {
    fn default() -> Self {
        Self::standard()
    }
}
