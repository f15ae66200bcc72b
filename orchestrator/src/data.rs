//! Synthetic client data for demos and tests.

use machine_learning::{
    dataset::Dataset,
    partition::{NodePartitions, Nodes},
};
use rand::{SeedableRng, rngs::StdRng};

use crate::configs::{DatasetKind, ExperimentConfig};

/// How far the samples of a class spread around its center.
const SPREAD: f32 = 1.0;

/// Splits gaussian blobs shaped like `dataset` among the experiment's clients.
///
/// Train, evaluation and test sets share their class centers, each holding `per_class`
/// samples of every class.
///
/// # Arguments
/// * `dataset` - The dataset whose classes and input size are imitated.
/// * `config` - The experiment, for the amount of clients, the skew and the seed.
/// * `per_class` - The amount of samples of every class in each set.
pub fn synthetic_nodes(
    dataset: DatasetKind,
    config: &ExperimentConfig,
    per_class: usize,
) -> machine_learning::Result<Box<dyn NodePartitions>> {
    let mut rng = StdRng::seed_from_u64(config.tunables.seed);
    let classes = dataset.num_classes();

    let all = Dataset::synthetic(classes, per_class * 2, dataset.in_features(), SPREAD, &mut rng)?;
    let half = classes * per_class;
    let train_idx: Vec<usize> = (0..half).collect();
    let test_idx: Vec<usize> = (half..all.len()).collect();

    let train = all.subset(&train_idx)?;
    let test = all.subset(&test_idx)?;

    let nodes = Nodes::split(
        &train,
        &test,
        &test,
        config.num_nodes,
        config.classes_per_node,
        config.low_prob as f32,
        config.tunables.batch_size,
        &mut rng,
    )?;

    Ok(Box::new(nodes))
}
