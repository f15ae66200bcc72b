use ndarray::{Array2, ArrayView2, Axis};

use super::LossFn;
use crate::{MlErr, Result};

/// Softmax followed by negative log likelihood, averaged over the batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct CrossEntropy;

impl CrossEntropy {
    /// Returns a new `CrossEntropy`.
    pub fn new() -> Self {
        Self
    }
}

impl LossFn for CrossEntropy {
    fn loss(&self, logits: ArrayView2<f32>, labels: &[usize]) -> Result<f32> {
        check_labels(logits, labels)?;
        if labels.is_empty() {
            return Ok(0.);
        }

        let probs = softmax(logits);
        let nll: f32 = labels
            .iter()
            .enumerate()
            .map(|(i, &y)| -probs[[i, y]].max(f32::MIN_POSITIVE).ln())
            .sum();

        Ok(nll / labels.len() as f32)
    }

    fn loss_prime(&self, logits: ArrayView2<f32>, labels: &[usize]) -> Result<Array2<f32>> {
        check_labels(logits, labels)?;

        let mut grad = softmax(logits);
        for (i, &y) in labels.iter().enumerate() {
            grad[[i, y]] -= 1.;
        }

        let n = labels.len().max(1) as f32;
        grad.mapv_inplace(|g| g / n);
        Ok(grad)
    }
}

/// Row-wise, numerically stable softmax.
pub fn softmax(logits: ArrayView2<f32>) -> Array2<f32> {
    let mut out = logits.to_owned();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
        row.mapv_inplace(|x| (x - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|x| x / sum);
    }
    out
}

fn check_labels(logits: ArrayView2<f32>, labels: &[usize]) -> Result<()> {
    if logits.nrows() != labels.len() {
        return Err(MlErr::SizeMismatch {
            what: "labels",
            got: labels.len(),
            expected: logits.nrows(),
        });
    }

    if labels.iter().any(|&y| y >= logits.ncols()) {
        return Err(MlErr::InvalidInput("label out of range of the logits"));
    }

    Ok(())
}
