pub mod arch;
pub mod dataset;
pub mod error;
pub mod metrics;
pub mod optimization;
pub mod partition;
mod tensor;

pub use error::{MlErr, Result};
pub use tensor::{StateDict, Tensor};
