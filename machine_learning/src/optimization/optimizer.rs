use crate::{Result, StateDict};

pub trait Optimizer: Send {
    /// Makes one update step over every parameter in `params` using the matching gradient.
    ///
    /// # Errors
    /// If `grads` is missing a parameter or holds one with a different shape.
    fn step(&mut self, params: &mut StateDict, grads: &StateDict) -> Result<()>;
}
