use log::debug;
use machine_learning::{
    StateDict, Tensor,
    arch::{Model, OFT_R},
    dataset::DataLoader,
};
use ndarray::{Array2, ArrayView2, s};

use super::{Aggregate, Algorithm, LocalTraining, initial_states, unexpected};
use crate::{
    FlError, Result,
    configs::{AlgorithmKind, RalConfig},
};

#[derive(Debug, Clone)]
struct RalClient {
    state: StateDict,
    transform: Tensor,
    mask: Tensor,
}

/// Clients share the square transform applied to their representations, optionally compressed
/// to its diagonal blocks before being averaged.
pub struct FedRal {
    clients: Vec<RalClient>,
    global: Tensor,
    config: RalConfig,
    local: LocalTraining,
}

impl FedRal {
    /// Creates a new `FedRal`.
    ///
    /// The global and every local transform start from the first variant's, the masks from all
    /// zeros.
    ///
    /// # Errors
    /// `FlError::Config` if the variants don't carry a transform.
    pub fn new(
        variants: &[&dyn Model],
        num_nodes: usize,
        config: RalConfig,
        local: LocalTraining,
    ) -> Result<Self> {
        let states = initial_states(variants, num_nodes)?;
        let global = variants[0]
            .state_dict()
            .get(OFT_R)
            .cloned()
            .ok_or_else(|| FlError::Config(format!("the model variants have no {OFT_R}")))?;

        let clients = states
            .into_iter()
            .map(|state| RalClient {
                state,
                transform: global.clone(),
                mask: Tensor::zeros(global.raw_dim()),
            })
            .collect();

        Ok(Self {
            clients,
            global,
            config,
            local,
        })
    }

    pub fn global(&self) -> &Tensor {
        &self.global
    }

    /// The client's staged transform.
    pub fn transform(&self, client: usize) -> Option<&Tensor> {
        self.clients.get(client).map(|c| &c.transform)
    }

    /// The entries of the client's transform that survived compression.
    pub fn mask(&self, client: usize) -> Option<&Tensor> {
        self.clients.get(client).map(|c| &c.mask)
    }
}

impl Algorithm for FedRal {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::FedRal
    }

    fn load(&mut self, _round: usize, client: usize, model: &mut dyn Model) -> Result<()> {
        let mut state = self.clients[client].state.clone();
        state.insert(OFT_R, self.global.clone());
        model.load_state_dict(&state)?;
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

        let c = &mut self.clients[client];
        c.state = model.state_dict().clone();
        c.transform = c.state.require(OFT_R)?.clone();

        if self.config.block_num > 1 {
            let r = c.state.view2(OFT_R)?;
            let (masked, mask) = block_diagonal(r, self.config.block_num);

            let masked = masked.into_dyn();
            *model.state_dict_mut().require_mut(OFT_R)? = masked.clone();
            c.transform = masked;
            c.mask = mask.into_dyn();
        }

        Ok(())
    }

    fn aggregate(&mut self, round: usize, selected: &[usize]) -> Result<Option<Aggregate>> {
        if selected.is_empty() {
            return Err(FlError::Aggregation(
                "can't average the transforms of an empty selection".into(),
            ));
        }

        let mut global = Tensor::zeros(self.global.raw_dim());
        for &c in selected {
            global.scaled_add(1. / selected.len() as f32, &self.clients[c].transform);
        }

        debug!(round = round, clients = selected.len(); "averaged transforms");
        Ok(Some(Aggregate::Transform(global)))
    }

    fn apply(&mut self, aggregate: Aggregate) -> Result<()> {
        match aggregate {
            Aggregate::Transform(global) if global.shape() == self.global.shape() => {
                self.global = global;
                Ok(())
            }
            Aggregate::Transform(global) => Err(FlError::Aggregation(format!(
                "transform of shape {:?} doesn't fit {:?}",
                global.shape(),
                self.global.shape()
            ))),
            other => Err(unexpected(self.kind(), &other)),
        }
    }
}

/// Keeps only the `block_num` leading diagonal blocks of a square matrix.
///
/// Blocks are `dim / block_num` wide, so trailing rows and columns are dropped when `block_num`
/// doesn't divide `dim`.
///
/// # Returns
/// The compressed matrix and the binary mask of the kept entries.
pub fn block_diagonal(r: ArrayView2<f32>, block_num: usize) -> (Array2<f32>, Array2<f32>) {
    let mut masked = Array2::zeros(r.raw_dim());
    let mut mask = Array2::zeros(r.raw_dim());

    let size = r.nrows().min(r.ncols()) / block_num.max(1);
    for i in 0..block_num {
        let (start, end) = (i * size, (i + 1) * size);
        if end > r.nrows().min(r.ncols()) || size == 0 {
            break;
        }

        masked
            .slice_mut(s![start..end, start..end])
            .assign(&r.slice(s![start..end, start..end]));
        mask.slice_mut(s![start..end, start..end]).fill(1.);
    }

    (masked, mask)
}
