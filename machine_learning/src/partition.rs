use log::debug;
use rand::{
    Rng,
    seq::{IndexedRandom, SliceRandom},
};
use rand_distr::{Distribution, Uniform};

use crate::{
    MlErr, Result,
    dataset::{DataLoader, Dataset},
};

/// Upper bound of the probabilities drawn for every (class, node) slot.
pub const HIGH_PROB: f32 = 0.6;

/// The amount of samples a node holds in each of its partitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleCounts {
    pub train: usize,
    pub eval: usize,
    pub test: usize,
}

impl SampleCounts {
    pub fn total(&self) -> usize {
        self.train + self.eval + self.test
    }
}

/// Provides the per-node train, evaluation and test data of a federated experiment.
pub trait NodePartitions: Send {
    /// The amount of nodes.
    fn num_nodes(&self) -> usize;

    /// The amount of classes of the underlying dataset.
    fn num_classes(&self) -> usize;

    fn train(&mut self, node: usize) -> Result<&mut DataLoader>;

    fn eval(&mut self, node: usize) -> Result<&mut DataLoader>;

    fn test(&mut self, node: usize) -> Result<&mut DataLoader>;

    /// The amount of samples of each of the node's partitions.
    fn sample_counts(&self, node: usize) -> Result<SampleCounts>;
}

#[derive(Debug, Clone)]
struct NodeData {
    train: DataLoader,
    eval: DataLoader,
    test: DataLoader,
}

/// The label skewed split of a dataset among `N` nodes.
#[derive(Debug, Clone)]
pub struct Nodes {
    nodes: Vec<NodeData>,
    num_classes: usize,
}

/// The classes assigned to every node and the fraction of each class it receives.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassAssignment {
    pub classes: Vec<Vec<usize>>,
    pub probs: Vec<Vec<f32>>,
}

impl Nodes {
    /// Splits the train, evaluation and test sets among `num_nodes` nodes.
    ///
    /// Every node owns `classes_per_node` classes, the same assignment being used for the three
    /// sets.
    ///
    /// # Arguments
    /// * `train` - The full training set.
    /// * `eval` - The full evaluation set.
    /// * `test` - The full test set.
    /// * `num_nodes` - The amount of nodes.
    /// * `classes_per_node` - The amount of classes each node owns.
    /// * `low_prob` - The lower bound of the per class fractions.
    /// * `batch_size` - The batch size of every loader.
    /// * `rng` - A random number generator, also used to seed the train loaders.
    ///
    /// # Errors
    /// `MlErr::Partition` if there aren't enough classes to go around or the three sets don't
    /// share the same classes.
    #[allow(clippy::too_many_arguments)]
    pub fn split<R: Rng>(
        train: &Dataset,
        eval: &Dataset,
        test: &Dataset,
        num_nodes: usize,
        classes_per_node: usize,
        low_prob: f32,
        batch_size: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let num_classes = train.num_classes();
        for (name, set) in [("evaluation", eval), ("test", test)] {
            if set.num_classes() != num_classes {
                return Err(MlErr::Partition(format!(
                    "the {name} set has {} classes but the training set has {num_classes}",
                    set.num_classes()
                )));
            }
        }

        let assignment =
            assign_classes(num_classes, num_nodes, classes_per_node, low_prob, rng)?;

        let train_split = split_indices(train, &assignment, rng);
        let eval_split = split_indices(eval, &assignment, rng);
        let test_split = split_indices(test, &assignment, rng);

        let mut nodes = Vec::with_capacity(num_nodes);
        for ((tr, ev), te) in train_split.iter().zip(&eval_split).zip(&test_split) {
            nodes.push(NodeData {
                train: DataLoader::shuffled(train.subset(tr)?, batch_size, rng.random()),
                eval: DataLoader::sequential(eval.subset(ev)?, batch_size),
                test: DataLoader::sequential(test.subset(te)?, batch_size),
            });
        }

        debug!(
            nodes = num_nodes,
            classes = num_classes;
            "split dataset among nodes"
        );

        Ok(Self { nodes, num_classes })
    }

    fn node(&mut self, node: usize) -> Result<&mut NodeData> {
        let len = self.nodes.len();
        self.nodes.get_mut(node).ok_or(MlErr::SizeMismatch {
            what: "node index",
            got: node,
            expected: len,
        })
    }
}

impl NodePartitions for Nodes {
    fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn train(&mut self, node: usize) -> Result<&mut DataLoader> {
        Ok(&mut self.node(node)?.train)
    }

    fn eval(&mut self, node: usize) -> Result<&mut DataLoader> {
        Ok(&mut self.node(node)?.eval)
    }

    fn test(&mut self, node: usize) -> Result<&mut DataLoader> {
        Ok(&mut self.node(node)?.test)
    }

    fn sample_counts(&self, node: usize) -> Result<SampleCounts> {
        let data = self.nodes.get(node).ok_or(MlErr::SizeMismatch {
            what: "node index",
            got: node,
            expected: self.nodes.len(),
        })?;

        Ok(SampleCounts {
            train: data.train.dataset().len(),
            eval: data.eval.dataset().len(),
            test: data.test.dataset().len(),
        })
    }
}

/// Assigns `classes_per_node` classes to every node.
///
/// Each class is offered `classes_per_node * num_nodes / num_classes` times, each offer with its
/// own fraction drawn from `U(low_prob, HIGH_PROB)` and normalized per class. Nodes pick among
/// the classes with the most offers left.
pub fn assign_classes<R: Rng>(
    num_classes: usize,
    num_nodes: usize,
    classes_per_node: usize,
    low_prob: f32,
    rng: &mut R,
) -> Result<ClassAssignment> {
    if num_classes == 0 {
        return Err(MlErr::Partition("the dataset has no classes".into()));
    }

    let count_per_class = classes_per_node * num_nodes / num_classes;
    let dist = Uniform::new(low_prob, HIGH_PROB)
        .map_err(|_| MlErr::Partition(format!("invalid low probability {low_prob}")))?;

    let mut counts = vec![count_per_class; num_classes];
    let mut offers: Vec<Vec<f32>> = (0..num_classes)
        .map(|_| {
            let probs: Vec<f32> = (0..count_per_class).map(|_| dist.sample(rng)).collect();
            let sum: f32 = probs.iter().sum();
            probs.into_iter().map(|p| p / sum).collect()
        })
        .collect();

    let mut assignment = ClassAssignment {
        classes: Vec::with_capacity(num_nodes),
        probs: Vec::with_capacity(num_nodes),
    };

    for node in 0..num_nodes {
        let mut classes = Vec::with_capacity(classes_per_node);
        for _ in 0..classes_per_node {
            let max = counts.iter().copied().max().unwrap_or(0);
            let candidates: Vec<usize> = (0..num_classes).filter(|&c| counts[c] == max).collect();
            let &c = candidates
                .choose(rng)
                .ok_or_else(|| MlErr::Partition("no class left to assign".into()))?;

            counts[c] = counts[c].saturating_sub(1);
            classes.push(c);
        }

        let probs = classes
            .iter()
            .map(|&c| {
                offers[c].pop().ok_or_else(|| {
                    MlErr::Partition(format!(
                        "class {c} ran out of offers at node {node}, \
                         {classes_per_node} classes per node is too few for {num_nodes} nodes"
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        assignment.classes.push(classes);
        assignment.probs.push(probs);
    }

    Ok(assignment)
}

/// Splits `dataset` following `assignment`: each class's indices are shuffled and every node,
/// in order, takes the next `floor(class_count * p)` of them.
fn split_indices<R: Rng>(
    dataset: &Dataset,
    assignment: &ClassAssignment,
    rng: &mut R,
) -> Vec<Vec<usize>> {
    let mut by_class = dataset.class_indices();
    for idx in by_class.iter_mut() {
        idx.shuffle(rng);
    }

    let totals: Vec<usize> = by_class.iter().map(Vec::len).collect();
    let mut cursors = vec![0; by_class.len()];

    assignment
        .classes
        .iter()
        .zip(&assignment.probs)
        .map(|(classes, probs)| {
            let mut node_idx = Vec::new();
            for (&c, &p) in classes.iter().zip(probs) {
                let take = (totals[c] as f32 * p) as usize;
                let start = cursors[c];
                let end = (start + take).min(totals[c]);
                node_idx.extend_from_slice(&by_class[c][start..end]);
                cursors[c] = end;
            }
            node_idx
        })
        .collect()
}
