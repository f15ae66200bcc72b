use std::path::PathBuf;

use machine_learning::{
    arch::{DEFAULT_HIDDEN, DEFAULT_REP_DIM},
    partition::HIGH_PROB,
};

use super::{AlgorithmKind, DatasetKind, ProtoConfig, RalConfig, SsaConfig};
use crate::{FlError, Result, selection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizerKind {
    /// SGD with momentum 0.9 and weight decay.
    #[default]
    Sgd,
    Adam,
}

/// Training knobs with sensible defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Tunables {
    pub batch_size: usize,
    pub learning_rate: f32,
    pub weight_decay: f32,
    pub optimizer: OptimizerKind,
    pub seed: u64,
    /// Index of the device the task was admitted on.
    pub device: usize,
    /// Hidden width of each model variant, client `i` trains variant `i % hidden.len()`.
    pub hidden: Vec<usize>,
    /// Width of the representation feeding the classification head.
    pub rep_dim: usize,
    /// Gradients are rescaled to this norm before every step, except under FedProto.
    pub clip_norm: f32,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            batch_size: 512,
            learning_rate: 1e-2,
            weight_decay: 1e-3,
            optimizer: OptimizerKind::Sgd,
            seed: 42,
            device: 0,
            hidden: DEFAULT_HIDDEN.to_vec(),
            rep_dim: DEFAULT_REP_DIM,
            clip_norm: 50.,
        }
    }
}

/// The configuration of one experiment, immutable for the whole run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentConfig {
    pub task_id: u64,
    /// The dataset name, as given by the user.
    pub data_name: String,
    /// The algorithm name, as given by the user.
    pub algorithm_name: String,
    pub num_nodes: usize,
    /// Fraction of the clients selected every round.
    pub fraction: f64,
    pub classes_per_node: usize,
    /// Lower bound of the per class fractions of the label skewed split.
    pub low_prob: f64,
    pub rounds: usize,
    pub epochs: usize,
    pub tunables: Tunables,
    pub ssa: SsaConfig,
    pub ral: RalConfig,
    pub proto: ProtoConfig,
    /// Where the results log is written.
    pub results_dir: PathBuf,
}

impl ExperimentConfig {
    /// Creates a new `ExperimentConfig` with default tunables and algorithm settings.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: u64,
        data_name: impl Into<String>,
        algorithm_name: impl Into<String>,
        num_nodes: usize,
        fraction: f64,
        classes_per_node: usize,
        low_prob: f64,
        rounds: usize,
        epochs: usize,
    ) -> Self {
        Self {
            task_id,
            data_name: data_name.into(),
            algorithm_name: algorithm_name.into(),
            num_nodes,
            fraction,
            classes_per_node,
            low_prob,
            rounds,
            epochs,
            tunables: Tunables::default(),
            ssa: SsaConfig::default(),
            ral: RalConfig::default(),
            proto: ProtoConfig::default(),
            results_dir: PathBuf::from("results"),
        }
    }

    pub fn with_tunables(mut self, tunables: Tunables) -> Self {
        self.tunables = tunables;
        self
    }

    pub fn with_ssa(mut self, ssa: SsaConfig) -> Self {
        self.ssa = ssa;
        self
    }

    pub fn with_ral(mut self, ral: RalConfig) -> Self {
        self.ral = ral;
        self
    }

    pub fn with_proto(mut self, proto: ProtoConfig) -> Self {
        self.proto = proto;
        self
    }

    pub fn with_results_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.results_dir = dir.into();
        self
    }

    /// Resolves the dataset name.
    pub fn dataset(&self) -> Result<DatasetKind> {
        self.data_name.parse()
    }

    /// Resolves the algorithm name.
    pub fn algorithm(&self) -> Result<AlgorithmKind> {
        self.algorithm_name.parse()
    }

    /// The amount of clients selected every round, `floor(fraction * num_nodes)`.
    pub fn clients_per_round(&self) -> usize {
        selection::clients_per_round(self.num_nodes, self.fraction)
    }

    /// Checks the whole configuration without allocating anything.
    ///
    /// # Returns
    /// The resolved dataset and algorithm or a `FlError::Config` naming the first problem found.
    pub fn validate(&self) -> Result<(DatasetKind, AlgorithmKind)> {
        let dataset = self.dataset()?;
        let algorithm = self.algorithm()?;
        let t = &self.tunables;

        let problem = if self.num_nodes == 0 {
            Some("the number of nodes must be positive".to_string())
        } else if !(self.fraction > 0. && self.fraction <= 1.) {
            Some(format!("fraction must be in (0, 1], got {}", self.fraction))
        } else if self.clients_per_round() == 0 {
            Some(format!(
                "fraction {} of {} nodes selects no client",
                self.fraction, self.num_nodes
            ))
        } else if self.classes_per_node == 0 {
            Some("classes per node must be positive".to_string())
        } else if !(0. ..HIGH_PROB as f64).contains(&self.low_prob) {
            Some(format!(
                "low probability must be in [0, {HIGH_PROB}), got {}",
                self.low_prob
            ))
        } else if t.batch_size == 0 {
            Some("batch size must be positive".to_string())
        } else if t.hidden.is_empty() || t.hidden.contains(&0) || t.rep_dim == 0 {
            Some("model widths must be positive".to_string())
        } else if self.ral.block_num == 0 {
            Some("block_num must be positive".to_string())
        } else if algorithm == AlgorithmKind::FedRal && self.ral.block_num > t.rep_dim {
            // blocks would be empty and the whole transform zeroed
            Some(format!(
                "block_num {} exceeds the representation width {}",
                self.ral.block_num, t.rep_dim
            ))
        } else {
            None
        };

        match problem {
            Some(msg) => Err(FlError::Config(msg)),
            None => Ok((dataset, algorithm)),
        }
    }
}
