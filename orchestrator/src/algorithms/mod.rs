//! The federated strategies.
//!
//! The round loop only talks to the `Algorithm` trait: each strategy is initialized once per
//! experiment, then for every selected client it loads the client's state into the client's
//! model variant and trains it, and after every round it aggregates what the clients staged.

mod fedproto;
mod fedral;
mod fedssa;
mod lg_fedavg;
mod local;
mod standalone;

use std::collections::BTreeMap;

use machine_learning::{
    StateDict, Tensor, arch::Model, dataset::DataLoader, partition::NodePartitions,
};
use ndarray::Array1;

pub use fedproto::{FedProto, aggregate_prototypes, proximity_grad};
pub use fedral::{FedRal, block_diagonal};
pub use fedssa::FedSsa;
pub use lg_fedavg::LgFedAvg;
pub use local::LocalTraining;
pub use standalone::Standalone;

use crate::{
    Result,
    configs::{AlgorithmKind, ExperimentConfig},
};

/// Per class representation prototypes.
pub type PrototypeTable = BTreeMap<usize, Array1<f32>>;

/// Per class header rows, keyed by parameter name and class.
pub type HeaderTable = BTreeMap<String, BTreeMap<usize, Tensor>>;

/// The shared state produced by an aggregation step.
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregate {
    /// Averaged shared parameters.
    Shared(StateDict),
    Prototypes(PrototypeTable),
    Headers(HeaderTable),
    /// The averaged representation transform.
    Transform(Tensor),
}

impl Aggregate {
    fn name(&self) -> &'static str {
        match self {
            Self::Shared(_) => "shared parameters",
            Self::Prototypes(_) => "prototypes",
            Self::Headers(_) => "class headers",
            Self::Transform(_) => "a transform",
        }
    }
}

/// A federated strategy and the per client state it tracks across rounds.
pub trait Algorithm: Send {
    fn kind(&self) -> AlgorithmKind;

    /// Loads a client's state into the model variant it trains.
    ///
    /// # Arguments
    /// * `round` - The current round.
    /// * `client` - The client about to train.
    /// * `model` - The client's model variant.
    fn load(&mut self, round: usize, client: usize, model: &mut dyn Model) -> Result<()>;

    /// Trains the loaded model on the client's data and keeps what the client contributes.
    fn train(
        &mut self,
        round: usize,
        client: usize,
        model: &mut dyn Model,
        loader: &mut DataLoader,
    ) -> Result<()>;

    /// Combines what the clients of the round staged.
    ///
    /// # Returns
    /// The new global state or `None` when there is nothing to update.
    fn aggregate(&mut self, round: usize, selected: &[usize]) -> Result<Option<Aggregate>>;

    /// Makes an aggregate the global state read by the next round's loads.
    fn apply(&mut self, aggregate: Aggregate) -> Result<()>;
}

/// Initializes the strategy of an experiment.
///
/// # Arguments
/// * `kind` - The strategy.
/// * `config` - The experiment's configuration.
/// * `variants` - The freshly built model variants, client `i` trains `variants[i % len]`.
/// * `partitions` - The clients' data.
pub fn build(
    kind: AlgorithmKind,
    config: &ExperimentConfig,
    variants: &[&dyn Model],
    partitions: &mut dyn NodePartitions,
) -> Result<Box<dyn Algorithm>> {
    let local = LocalTraining::from_config(config);
    let n = config.num_nodes;

    let algorithm: Box<dyn Algorithm> = match kind {
        AlgorithmKind::Standalone => Box::new(Standalone::new(variants, n, local)?),
        AlgorithmKind::LgFedAvg => Box::new(LgFedAvg::new(variants, partitions, local)?),
        AlgorithmKind::FedProto => Box::new(FedProto::new(
            variants,
            n,
            partitions.num_classes(),
            config.proto,
            local.without_clipping(),
        )?),
        AlgorithmKind::FedSsa => Box::new(FedSsa::new(
            variants,
            partitions,
            config.ssa,
            local.with_rates(config.ssa.inner_lr, config.ssa.inner_wd),
        )?),
        AlgorithmKind::FedRal => Box::new(FedRal::new(variants, n, config.ral, local)?),
    };

    Ok(algorithm)
}

/// The state every client starts from: a copy of its variant's initial parameters.
fn initial_states(variants: &[&dyn Model], num_nodes: usize) -> Result<Vec<StateDict>> {
    if variants.is_empty() {
        return Err(crate::FlError::Config("no model variants to train".into()));
    }

    Ok((0..num_nodes)
        .map(|i| variants[i % variants.len()].state_dict().clone())
        .collect())
}

/// Splits the parameter names of `model` into the private ones and the last two, the
/// classification head's weight and bias.
fn split_head(model: &dyn Model) -> (Vec<String>, Vec<String>) {
    let keys: Vec<String> = model.state_dict().keys().map(str::to_string).collect();
    let at = keys.len().saturating_sub(2);
    let shared = keys[at..].to_vec();
    let private = keys[..at].to_vec();
    (private, shared)
}

fn unexpected(kind: AlgorithmKind, aggregate: &Aggregate) -> crate::FlError {
    crate::FlError::Aggregation(format!("{kind} can't apply {}", aggregate.name()))
}
