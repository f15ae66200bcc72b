use ndarray::Zip;

use super::{Optimizer, check_grad};
use crate::{Result, StateDict};

/// Stochastic gradient descent with momentum and L2 weight decay.
#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate: f32,
    momentum: f32,
    weight_decay: f32,
    velocity: StateDict,
}

impl Sgd {
    /// Returns a new `Sgd`.
    ///
    /// # Arguments
    /// * `learning_rate` - The *length* of the steps taken on `step`.
    /// * `momentum` - The fraction of the previous step carried into the next one.
    /// * `weight_decay` - The L2 penalty added to every gradient.
    pub fn new(learning_rate: f32, momentum: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            weight_decay,
            velocity: StateDict::new(),
        }
    }
}

impl Optimizer for Sgd {
    /// Updates the parameters following `v = momentum * v + (g + wd * w)` and `w -= lr * v`.
    fn step(&mut self, params: &mut StateDict, grads: &StateDict) -> Result<()> {
        if self.velocity.is_empty() {
            self.velocity = params.zeros_like();
        }

        let Self {
            learning_rate: lr,
            momentum,
            weight_decay: wd,
            ref mut velocity,
        } = *self;

        for (name, w) in params.iter_mut() {
            let g = grads.require(name)?;
            check_grad(name, w, g)?;
            let v = velocity.require_mut(name)?;

            Zip::from(w).and(g).and(v).for_each(|w, &g, v| {
                *v = momentum * *v + g + wd * *w;
                *w -= lr * *v;
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    fn params() -> StateDict {
        let mut sd = StateDict::new();
        sd.insert("w", array![1.0, -1.0].into_dyn());
        sd
    }

    #[test]
    fn plain_step_moves_against_the_gradient() {
        let mut p = params();
        let mut g = StateDict::new();
        g.insert("w", array![0.5, -0.5].into_dyn());

        Sgd::new(0.1, 0., 0.).step(&mut p, &g).unwrap();
        let w = p.view1("w").unwrap();
        assert!((w[0] - 0.95).abs() < 1e-6);
        assert!((w[1] + 0.95).abs() < 1e-6);
    }

    #[test]
    fn momentum_accumulates_across_steps() {
        let mut p = params();
        let mut g = StateDict::new();
        g.insert("w", array![1.0, 0.0].into_dyn());

        let mut sgd = Sgd::new(1.0, 0.5, 0.);
        sgd.step(&mut p, &g).unwrap();
        sgd.step(&mut p, &g).unwrap();

        // steps of 1.0 then 1.5
        assert!((p.view1("w").unwrap()[0] + 1.5).abs() < 1e-6);
    }

    #[test]
    fn missing_gradient_is_an_error() {
        let mut p = params();
        assert!(Sgd::new(0.1, 0.9, 0.).step(&mut p, &StateDict::new()).is_err());
    }
}
