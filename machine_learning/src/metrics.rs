use std::collections::BTreeSet;

use ndarray::{ArrayView2, Axis};

use crate::{
    Result,
    arch::{Model, loss::LossFn},
    dataset::DataLoader,
};

/// The evaluation metrics of a model over a test set.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Metrics {
    pub loss: f32,
    pub accuracy: f32,
    pub precision: f32,
    pub recall: f32,
    pub f1_score: f32,
}

impl Metrics {
    /// The metrics as an array in `loss, accuracy, precision, recall, f1_score` order.
    pub fn to_array(&self) -> [f32; 5] {
        [
            self.loss,
            self.accuracy,
            self.precision,
            self.recall,
            self.f1_score,
        ]
    }

    /// Averages every metric over `all`, rounding each mean to 4 decimals.
    ///
    /// # Returns
    /// All zeros if `all` is empty.
    pub fn mean(all: &[Metrics]) -> Metrics {
        if all.is_empty() {
            return Metrics::default();
        }

        let n = all.len() as f32;
        let mut sums = [0f32; 5];
        for m in all {
            for (s, v) in sums.iter_mut().zip(m.to_array()) {
                *s += v;
            }
        }

        let [loss, accuracy, precision, recall, f1_score] = sums.map(|s| round4(s / n));
        Metrics {
            loss,
            accuracy,
            precision,
            recall,
            f1_score,
        }
    }
}

fn round4(x: f32) -> f32 {
    (x * 1e4).round() / 1e4
}

/// The index of the largest logit of every row.
pub fn argmax_rows(logits: ArrayView2<f32>) -> Vec<usize> {
    logits
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, &x)| {
                    if x > best.1 { (i, x) } else { best }
                })
                .0
        })
        .collect()
}

/// Macro averaged precision, recall and F1 over the union of the true and predicted labels.
///
/// Undefined ratios count as zero.
pub fn macro_scores(y_true: &[usize], y_pred: &[usize]) -> (f32, f32, f32) {
    let labels: BTreeSet<usize> = y_true.iter().chain(y_pred).copied().collect();
    if labels.is_empty() {
        return (0., 0., 0.);
    }

    let ratio = |num: usize, den: usize| if den == 0 { 0. } else { num as f32 / den as f32 };

    let (mut precision, mut recall, mut f1) = (0., 0., 0.);
    for &label in &labels {
        let tp = y_true
            .iter()
            .zip(y_pred)
            .filter(|&(&t, &p)| t == label && p == label)
            .count();
        let predicted = y_pred.iter().filter(|&&p| p == label).count();
        let actual = y_true.iter().filter(|&&t| t == label).count();

        let p = ratio(tp, predicted);
        let r = ratio(tp, actual);
        precision += p;
        recall += r;
        f1 += if p + r > 0. { 2. * p * r / (p + r) } else { 0. };
    }

    let n = labels.len() as f32;
    (precision / n, recall / n, f1 / n)
}

/// Evaluates `model` over every batch of `loader` in evaluation mode.
///
/// The loss is the mean of the per batch losses.
///
/// # Returns
/// The metrics, all zeros if the loader is empty.
pub fn evaluate<M, L>(model: &mut M, loader: &mut DataLoader, loss_fn: &L) -> Result<Metrics>
where
    M: Model + ?Sized,
    L: LossFn,
{
    model.set_training(false);

    let mut total_loss = 0.;
    let mut n_batches = 0;
    let mut y_true = Vec::with_capacity(loader.dataset().len());
    let mut y_pred = Vec::with_capacity(loader.dataset().len());

    for batch in loader.batches() {
        let out = model.forward(batch.x.view())?;
        total_loss += loss_fn.loss(out.logits.view(), &batch.y)?;
        n_batches += 1;

        y_pred.extend(argmax_rows(out.logits.view()));
        y_true.extend(batch.y);
    }

    if n_batches == 0 {
        return Ok(Metrics::default());
    }

    let correct = y_true.iter().zip(&y_pred).filter(|(t, p)| t == p).count();
    let (precision, recall, f1_score) = macro_scores(&y_true, &y_pred);

    Ok(Metrics {
        loss: total_loss / n_batches as f32,
        accuracy: correct as f32 / y_true.len() as f32,
        precision,
        recall,
        f1_score,
    })
}
