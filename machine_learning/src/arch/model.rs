use ndarray::{Array2, ArrayView2};

use crate::{Result, StateDict};

/// The result of a forward pass.
#[derive(Debug, Clone)]
pub struct Output {
    /// Unnormalized class scores, `[batch, classes]`.
    pub logits: Array2<f32>,
    /// The representation fed to the classification head, `[batch, rep_dim]`.
    pub rep: Array2<f32>,
}

/// A trainable model whose parameters are exposed as a named, ordered `StateDict`.
pub trait Model: Send {
    /// The model's current parameters.
    fn state_dict(&self) -> &StateDict;

    /// Mutable access to the model's parameters, used by optimizers.
    fn state_dict_mut(&mut self) -> &mut StateDict;

    /// Replaces the model's parameters.
    ///
    /// # Errors
    /// Fails if `state` doesn't hold exactly the model's parameter names with the same shapes.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;

    /// Makes a forward pass, caching what's needed for a later `backward`.
    ///
    /// # Arguments
    /// * `x` - The input batch, `[batch, features]`.
    fn forward(&mut self, x: ArrayView2<f32>) -> Result<Output>;

    /// Backpropagates through the last forward pass.
    ///
    /// # Arguments
    /// * `d_logits` - Gradient of the loss with respect to the logits.
    /// * `d_rep` - Extra gradient with respect to the representation, for losses defined on it.
    ///
    /// # Returns
    /// The gradient of every parameter, with the same names and shapes as `state_dict`.
    fn backward(
        &mut self,
        d_logits: ArrayView2<f32>,
        d_rep: Option<ArrayView2<f32>>,
    ) -> Result<StateDict>;

    /// Switches between training and evaluation mode.
    fn set_training(&mut self, training: bool);
}
