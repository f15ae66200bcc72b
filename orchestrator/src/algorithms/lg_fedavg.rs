use log::debug;
use machine_learning::{
    StateDict, arch::Model, dataset::DataLoader, partition::NodePartitions,
};

use super::{Aggregate, Algorithm, LocalTraining, split_head, unexpected};
use crate::{FlError, Result, configs::AlgorithmKind};

#[derive(Debug, Clone)]
struct LgClient {
    private: StateDict,
    staged: Option<StateDict>,
    samples: usize,
}

/// Clients keep their bodies private and average their classification heads, weighted by how
/// many samples each holds.
pub struct LgFedAvg {
    private_keys: Vec<String>,
    shared_keys: Vec<String>,
    initial: Vec<StateDict>,
    clients: Vec<LgClient>,
    global: Option<StateDict>,
    local: LocalTraining,
}

impl LgFedAvg {
    /// Creates a new `LgFedAvg`.
    ///
    /// The private and shared parameter names come from the first variant, the shared ones being
    /// its last two tensors.
    ///
    /// # Arguments
    /// * `variants` - The model variants.
    /// * `partitions` - The clients' data, used for their sample counts.
    /// * `local` - The local training settings.
    pub fn new(
        variants: &[&dyn Model],
        partitions: &dyn NodePartitions,
        local: LocalTraining,
    ) -> Result<Self> {
        let first = variants
            .first()
            .ok_or_else(|| FlError::Config("no model variants to train".into()))?;
        let (private_keys, shared_keys) = split_head(*first);

        let initial: Vec<StateDict> = variants.iter().map(|v| v.state_dict().clone()).collect();

        let clients = (0..partitions.num_nodes())
            .map(|i| {
                let variant = &initial[i % initial.len()];
                Ok(LgClient {
                    private: variant.subset(private_keys.iter().map(String::as_str))?,
                    staged: None,
                    samples: partitions.sample_counts(i)?.total(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            private_keys,
            shared_keys,
            initial,
            clients,
            global: None,
            local,
        })
    }

    pub fn shared_keys(&self) -> &[String] {
        &self.shared_keys
    }

    pub fn private_keys(&self) -> &[String] {
        &self.private_keys
    }

    /// The current global head, `None` before the first aggregation.
    pub fn global(&self) -> Option<&StateDict> {
        self.global.as_ref()
    }
}

impl Algorithm for LgFedAvg {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::LgFedAvg
    }

    fn load(&mut self, round: usize, client: usize, model: &mut dyn Model) -> Result<()> {
        if round == 0 {
            let variant = &self.initial[client % self.initial.len()];
            model.load_state_dict(variant)?;
            return Ok(());
        }

        if let Some(global) = &self.global {
            let mut state = self.clients[client].private.clone();
            state.merge(global);
            model.load_state_dict(&state)?;
        }

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

        let state = model.state_dict();
        let c = &mut self.clients[client];
        c.private = state.subset(self.private_keys.iter().map(String::as_str))?;
        c.staged = Some(state.subset(self.shared_keys.iter().map(String::as_str))?);
        Ok(())
    }

    /// Averages the staged heads of the selected clients, weighting each by its share of the
    /// selected clients' samples.
    fn aggregate(&mut self, round: usize, selected: &[usize]) -> Result<Option<Aggregate>> {
        if selected.is_empty() {
            return Err(FlError::Aggregation(
                "can't average the heads of an empty selection".into(),
            ));
        }

        let total: usize = selected.iter().map(|&c| self.clients[c].samples).sum();
        if total == 0 {
            return Err(FlError::Aggregation(
                "the selected clients hold no samples".into(),
            ));
        }

        let mut global: Option<StateDict> = None;
        for &c in selected {
            let client = &self.clients[c];
            let Some(staged) = &client.staged else {
                continue;
            };

            let weight = client.samples as f32 / total as f32;
            let acc = global.get_or_insert_with(|| staged.zeros_like());
            acc.scaled_add(weight, staged)?;

            debug!(round = round, client = c, weight = weight; "weighted shared head");
        }

        for client in self.clients.iter_mut() {
            client.staged = None;
        }

        Ok(global.map(Aggregate::Shared))
    }

    fn apply(&mut self, aggregate: Aggregate) -> Result<()> {
        match aggregate {
            Aggregate::Shared(global) => {
                self.global = Some(global);
                Ok(())
            }
            other => Err(unexpected(self.kind(), &other)),
        }
    }
}
