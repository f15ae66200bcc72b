use machine_learning::{
    arch::{
        Model, Output,
        loss::{CrossEntropy, LossFn},
    },
    dataset::{Batch, DataLoader},
    optimization::{Adam, Optimizer, Sgd, clip_grad_norm},
};
use ndarray::Array2;

use crate::{
    Result,
    configs::{ExperimentConfig, OptimizerKind},
};

const MOMENTUM: f32 = 0.9;

/// How a client trains its model locally: `epochs` passes of mini-batch descent on
/// cross-entropy, with a fresh optimizer on every call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalTraining {
    pub epochs: usize,
    pub optimizer: OptimizerKind,
    pub learning_rate: f32,
    pub weight_decay: f32,
    pub clip_norm: Option<f32>,
}

impl LocalTraining {
    pub fn from_config(config: &ExperimentConfig) -> Self {
        let t = &config.tunables;
        Self {
            epochs: config.epochs,
            optimizer: t.optimizer,
            learning_rate: t.learning_rate,
            weight_decay: t.weight_decay,
            clip_norm: Some(t.clip_norm),
        }
    }

    /// Replaces the learning rate and the weight decay.
    pub fn with_rates(self, learning_rate: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            weight_decay,
            ..self
        }
    }

    pub fn without_clipping(self) -> Self {
        Self {
            clip_norm: None,
            ..self
        }
    }

    fn optimizer(&self) -> Box<dyn Optimizer> {
        match self.optimizer {
            OptimizerKind::Sgd => Box::new(Sgd::new(
                self.learning_rate,
                MOMENTUM,
                self.weight_decay,
            )),
            OptimizerKind::Adam => Box::new(Adam::new(self.learning_rate, self.weight_decay)),
        }
    }

    /// Trains `model` on every batch of `loader` for `epochs` passes.
    ///
    /// # Arguments
    /// * `model` - The model to train, in place.
    /// * `loader` - The client's training data.
    /// * `rep_grad` - Called after every forward pass with the epoch, the batch and the output.
    ///   Returns the gradient of any extra loss term with respect to the representation.
    pub fn run<F>(&self, model: &mut dyn Model, loader: &mut DataLoader, mut rep_grad: F) -> Result<()>
    where
        F: FnMut(usize, &Batch, &Output) -> Option<Array2<f32>>,
    {
        let mut optimizer = self.optimizer();
        model.set_training(true);

        for epoch in 0..self.epochs {
            for batch in loader.batches() {
                let out = model.forward(batch.x.view())?;
                let d_logits = CrossEntropy.loss_prime(out.logits.view(), &batch.y)?;
                let d_rep = rep_grad(epoch, &batch, &out);

                let mut grads = model.backward(d_logits.view(), d_rep.as_ref().map(|d| d.view()))?;
                if let Some(max_norm) = self.clip_norm {
                    clip_grad_norm(&mut grads, max_norm);
                }

                optimizer.step(model.state_dict_mut(), &grads)?;
            }
        }

        Ok(())
    }
}
