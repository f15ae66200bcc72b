use ndarray::{Array2, ArrayView2};

use crate::Result;

/// A classification loss over a batch of logits and integer labels.
pub trait LossFn {
    fn loss(&self, logits: ArrayView2<f32>, labels: &[usize]) -> Result<f32>;
    fn loss_prime(&self, logits: ArrayView2<f32>, labels: &[usize]) -> Result<Array2<f32>>;
}
