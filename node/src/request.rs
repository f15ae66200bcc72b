use std::path::Path;

use orchestrator::configs::{DatasetKind, ExperimentConfig, Tunables};
use serde::{Deserialize, Serialize};

/// A request to run one experiment, in the JSON form the API receives it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainRequest {
    pub task_id: u64,
    pub data_name: String,
    pub algorithm_name: String,
    pub num_nodes: usize,
    pub fraction: f64,
    pub classes_per_node: usize,
    pub low_prob: f64,
    /// The amount of rounds.
    pub num_steps: usize,
    pub epochs: usize,
    /// Overrides the dataset's free memory threshold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_free_memory_gb: Option<f64>,
}

impl TrainRequest {
    /// The canonical name of the requested dataset.
    pub fn normalized_data_name(&self) -> String {
        DatasetKind::normalize(&self.data_name)
    }

    /// The free device memory, in GB, this request needs to start.
    pub fn min_free_memory_gb(&self, dataset: DatasetKind) -> f64 {
        self.min_free_memory_gb
            .unwrap_or_else(|| dataset.min_free_memory_gb())
    }

    /// Builds the experiment this request describes.
    ///
    /// # Arguments
    /// * `tunables` - The training knobs the request doesn't carry.
    /// * `results_dir` - Where the experiment's results log is written.
    pub fn to_config(&self, tunables: Tunables, results_dir: &Path) -> ExperimentConfig {
        ExperimentConfig::new(
            self.task_id,
            self.normalized_data_name(),
            self.algorithm_name.clone(),
            self.num_nodes,
            self.fraction,
            self.classes_per_node,
            self.low_prob,
            self.num_steps,
            self.epochs,
        )
        .with_tunables(tunables)
        .with_results_dir(results_dir)
    }
}
