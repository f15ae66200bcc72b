//! Federated training orchestration.
//!
//! A `Trainer` runs one experiment: every round it selects a fraction of the simulated clients,
//! lets the configured `Algorithm` load each client's state into the client's model variant,
//! trains and evaluates it, reports the metrics through an `EventSink` and finally aggregates
//! whatever the clients produced into the global state of the next round.

pub mod algorithms;
pub mod configs;
pub mod data;
pub mod error;
pub mod events;
pub mod results;
pub mod selection;
mod trainer;

pub use error::{FlError, Result};
pub use trainer::{RunOutcome, Trainer, TrainerState};
