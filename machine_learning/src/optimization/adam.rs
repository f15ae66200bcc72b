use ndarray::Zip;

use super::{Optimizer, check_grad};
use crate::{Result, StateDict};

const BETA1: f32 = 0.9;
const BETA2: f32 = 0.999;
const EPS: f32 = 1e-8;

/// The Adam optimizer with L2 weight decay folded into the gradient.
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    weight_decay: f32,
    t: i32,
    m: StateDict,
    v: StateDict,
}

impl Adam {
    /// Returns a new `Adam`.
    pub fn new(learning_rate: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            weight_decay,
            t: 0,
            m: StateDict::new(),
            v: StateDict::new(),
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut StateDict, grads: &StateDict) -> Result<()> {
        if self.m.is_empty() {
            self.m = params.zeros_like();
            self.v = params.zeros_like();
        }

        self.t += 1;
        let bias1 = 1. - BETA1.powi(self.t);
        let bias2 = 1. - BETA2.powi(self.t);
        let (lr, wd) = (self.learning_rate, self.weight_decay);

        for (name, w) in params.iter_mut() {
            let g = grads.require(name)?;
            check_grad(name, w, g)?;
            let m = self.m.require_mut(name)?;
            let v = self.v.require_mut(name)?;

            Zip::from(w).and(g).and(m).and(v).for_each(|w, &g, m, v| {
                let g = g + wd * *w;
                *m = BETA1 * *m + (1. - BETA1) * g;
                *v = BETA2 * *v + (1. - BETA2) * g * g;
                *w -= lr * (*m / bias1) / ((*v / bias2).sqrt() + EPS);
            });
        }

        Ok(())
    }
}
