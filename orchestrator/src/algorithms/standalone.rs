use log::debug;
use machine_learning::{StateDict, arch::Model, dataset::DataLoader};

use super::{Aggregate, Algorithm, LocalTraining, initial_states, unexpected};
use crate::{Result, configs::AlgorithmKind};

/// Every client trains its own copy of its variant, nothing is ever shared.
pub struct Standalone {
    clients: Vec<StateDict>,
    local: LocalTraining,
}

impl Standalone {
    /// Creates a new `Standalone`, client `i` starting from a copy of `variants[i % len]`.
    pub fn new(variants: &[&dyn Model], num_nodes: usize, local: LocalTraining) -> Result<Self> {
        Ok(Self {
            clients: initial_states(variants, num_nodes)?,
            local,
        })
    }

    /// The stored state of a client.
    pub fn client_state(&self, client: usize) -> Option<&StateDict> {
        self.clients.get(client)
    }
}

impl Algorithm for Standalone {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::Standalone
    }

    fn load(&mut self, _round: usize, client: usize, model: &mut dyn Model) -> Result<()> {
        model.load_state_dict(&self.clients[client])?;
        Ok(())
    }

    fn train(
        &mut self,
        _round: usize,
        client: usize,
        model: &mut dyn Model,
        loader: &mut DataLoader,
    ) -> Result<()> {
        self.local.run(model, loader, |_, _, _| None)?;
        self.clients[client] = model.state_dict().clone();
        Ok(())
    }

    fn aggregate(&mut self, round: usize, _selected: &[usize]) -> Result<Option<Aggregate>> {
        debug!(round = round; "standalone clients never aggregate");
        Ok(None)
    }

    fn apply(&mut self, aggregate: Aggregate) -> Result<()> {
        Err(unexpected(self.kind(), &aggregate))
    }
}
