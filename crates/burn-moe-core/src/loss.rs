//! Load-balancing losses
//!
//! The auxiliary loss penalizes uneven expert usage through the squared
//! coefficient of variation of two per-expert statistics: importance (sum
//! of gate values) and load (number of routed examples, or its smooth
//! estimate under noise).

use burn::prelude::*;

/// Stabilizer added to the squared mean in [`cv_squared`]
pub const CV_EPSILON: f64 = 1e-10;

/// Squared coefficient of variation: `var(x) / (mean(x)^2 + 1e-10)`
///
/// Uses the unbiased sample variance. Returns 0 for vectors with fewer than
/// two elements, so a single-expert layer has no balancing pressure.
///
/// # Returns
///
/// Scalar tensor of shape [1]
pub fn cv_squared<B: Backend>(x: Tensor<B, 1>) -> Tensor<B, 1> {
    let [len] = x.dims();
    if len <= 1 {
        return Tensor::zeros([1], &x.device());
    }

    let mean = x.clone().mean();
    x.var(0) / mean.powf_scalar(2.0).add_scalar(CV_EPSILON)
}

/// `loss_coef * (cv_squared(importance) + cv_squared(load))`
pub fn load_balancing_loss<B: Backend>(
    importance: Tensor<B, 1>,
    load: Tensor<B, 1>,
    loss_coef: f64,
) -> Tensor<B, 1> {
    (cv_squared(importance) + cv_squared(load)).mul_scalar(loss_coef)
}
