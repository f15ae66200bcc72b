use crate::StateDict;

/// Rescales `grads` in place so that their joint euclidean norm is at most `max_norm`.
///
/// # Returns
/// The norm of the gradients before clipping.
pub fn clip_grad_norm(grads: &mut StateDict, max_norm: f32) -> f32 {
    let norm = grads.norm();
    if norm > max_norm {
        grads.scale(max_norm / (norm + 1e-6));
    }

    norm
}
