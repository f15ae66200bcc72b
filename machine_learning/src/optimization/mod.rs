mod adam;
mod clip;
mod optimizer;
mod sgd;

pub use adam::Adam;
pub use clip::clip_grad_norm;
pub use optimizer::Optimizer;
pub use sgd::Sgd;

use crate::{MlErr, Result, Tensor};

fn check_grad(name: &str, param: &Tensor, grad: &Tensor) -> Result<()> {
    if param.shape() != grad.shape() {
        return Err(MlErr::ShapeMismatch {
            name: name.to_string(),
            got: grad.shape().to_vec(),
            expected: param.shape().to_vec(),
        });
    }

    Ok(())
}
