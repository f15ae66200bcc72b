//! The control surface of a training node: admits training requests, runs each one as an
//! isolated task and lets them be stopped.

pub mod admission;
pub mod error;
pub mod registry;
pub mod request;
mod service;

pub use error::StartRejected;
pub use service::{PartitionProvider, TrainingService};
