use std::collections::BTreeMap;

use log::debug;
use machine_learning::{StateDict, arch::Model, dataset::DataLoader};
use ndarray::{Array1, Array2, ArrayView2, Axis};

use super::{
    Aggregate, Algorithm, LocalTraining, PrototypeTable, initial_states, unexpected,
};
use crate::{Result, configs::{AlgorithmKind, ProtoConfig}};

#[derive(Debug, Clone)]
struct ProtoClient {
    state: StateDict,
    /// How many training samples of each class the client has seen in the first epoch of its
    /// local trainings, accumulated over rounds.
    distribution: Vec<usize>,
    staged: Option<PrototypeTable>,
}

/// Clients share per class prototypes of their representations and pull their own
/// representations towards the global ones.
///
/// The per class denominator of the aggregation weights is only computed at round 0, over the
/// classes of the global table, which is still empty then. Since only classes already in the
/// global table are aggregated, the table never gains a class on its own.
pub struct FedProto {
    clients: Vec<ProtoClient>,
    global: PrototypeTable,
    cross_class: BTreeMap<usize, usize>,
    config: ProtoConfig,
    local: LocalTraining,
}

impl FedProto {
    pub fn new(
        variants: &[&dyn Model],
        num_nodes: usize,
        num_classes: usize,
        config: ProtoConfig,
        local: LocalTraining,
    ) -> Result<Self> {
        let clients = initial_states(variants, num_nodes)?
            .into_iter()
            .map(|state| ProtoClient {
                state,
                distribution: vec![0; num_classes],
                staged: None,
            })
            .collect();

        Ok(Self {
            clients,
            global: PrototypeTable::new(),
            cross_class: BTreeMap::new(),
            config,
            local,
        })
    }

    pub fn global(&self) -> &PrototypeTable {
        &self.global
    }

    /// The per class sample counts a client has accumulated.
    pub fn distribution(&self, client: usize) -> Option<&[usize]> {
        self.clients.get(client).map(|c| c.distribution.as_slice())
    }

    /// The prototypes a client staged in the current round.
    pub fn staged(&self, client: usize) -> Option<&PrototypeTable> {
        self.clients.get(client).and_then(|c| c.staged.as_ref())
    }
}

impl Algorithm for FedProto {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::FedProto
    }

    fn load(&mut self, _round: usize, client: usize, model: &mut dyn Model) -> Result<()> {
        model.load_state_dict(&self.clients[client].state)?;
        Ok(())
    }

    fn train(
        &mut self,
        round: usize,
        client: usize,
        model: &mut dyn Model,
        loader: &mut DataLoader,
    ) -> Result<()> {
        let global = &self.global;
        let weight = self.config.proximity_weight;
        let distribution = &mut self.clients[client].distribution;

        self.local.run(model, loader, |epoch, batch, out| {
            if epoch == 0 {
                for &y in &batch.y {
                    if let Some(count) = distribution.get_mut(y) {
                        *count += 1;
                    }
                }
            }

            match round {
                0 => None,
                _ => proximity_grad(out.rep.view(), &batch.y, global, weight),
            }
        })?;

        let protos = local_prototypes(model, loader)?;
        let c = &mut self.clients[client];
        c.state = model.state_dict().clone();
        c.staged = Some(protos);
        Ok(())
    }

    fn aggregate(&mut self, round: usize, _selected: &[usize]) -> Result<Option<Aggregate>> {
        if self.clients.iter().all(|c| c.staged.is_none()) {
            return Ok(None);
        }

        if round == 0 {
            self.cross_class = self
                .global
                .keys()
                .map(|&cls| {
                    let total = self
                        .clients
                        .iter()
                        .map(|c| c.distribution.get(cls).copied().unwrap_or(0))
                        .sum();
                    (cls, total)
                })
                .collect();
        }

        let contributions: Vec<(&[usize], &PrototypeTable)> = self
            .clients
            .iter()
            .filter_map(|c| c.staged.as_ref().map(|p| (c.distribution.as_slice(), p)))
            .collect();

        let updated = aggregate_prototypes(&self.global, &self.cross_class, &contributions);
        debug!(
            round = round,
            classes = updated.len(),
            contributors = contributions.len();
            "aggregated prototypes"
        );

        self.global = updated;
        for c in self.clients.iter_mut() {
            c.staged = None;
        }

        match self.global.is_empty() {
            true => Ok(None),
            false => Ok(Some(Aggregate::Prototypes(self.global.clone()))),
        }
    }

    fn apply(&mut self, aggregate: Aggregate) -> Result<()> {
        match aggregate {
            Aggregate::Prototypes(table) => {
                self.global = table;
                Ok(())
            }
            other => Err(unexpected(self.kind(), &other)),
        }
    }
}

/// The gradient, with respect to the representations of a batch, of `weight` times the mean
/// euclidean distance between each representation and its class's global prototype.
///
/// # Returns
/// `None` if no sample of the batch has a global prototype.
pub fn proximity_grad(
    rep: ArrayView2<f32>,
    labels: &[usize],
    global: &PrototypeTable,
    weight: f32,
) -> Option<Array2<f32>> {
    let mut grad = Array2::zeros(rep.raw_dim());
    let mut count = 0;

    for (i, y) in labels.iter().enumerate() {
        let Some(proto) = global.get(y) else {
            continue;
        };

        let diff = &rep.row(i) - proto;
        let norm = diff.dot(&diff).sqrt();
        if norm > 0. {
            grad.row_mut(i).assign(&(diff / norm));
        }
        count += 1;
    }

    if count == 0 {
        return None;
    }

    grad.mapv_inplace(|g| g * weight / count as f32);
    Some(grad)
}

/// Recomputes every class prototype already in `global` from the clients' staged prototypes.
///
/// Each contribution is weighted by the client's share of the class's cross client count, then
/// the weighted sum is divided again by the amount of contributors. Classes without a positive
/// cross client count are left as they are.
///
/// # Arguments
/// * `global` - The current global prototypes.
/// * `cross_class` - The per class sample count over every client.
/// * `contributions` - Each contributing client's class distribution and staged prototypes.
pub fn aggregate_prototypes(
    global: &PrototypeTable,
    cross_class: &BTreeMap<usize, usize>,
    contributions: &[(&[usize], &PrototypeTable)],
) -> PrototypeTable {
    let mut updated = global.clone();

    for (&cls, slot) in updated.iter_mut() {
        let denominator = cross_class.get(&cls).copied().unwrap_or(0);
        if denominator == 0 {
            continue;
        }

        let weighted: Vec<Array1<f32>> = contributions
            .iter()
            .filter_map(|(distribution, protos)| {
                let proto = protos.get(&cls)?;
                let count = distribution.get(cls).copied().unwrap_or(0);
                Some(proto * (count as f32 / denominator as f32))
            })
            .collect();

        if let Some(first) = weighted.first() {
            let mut sum = Array1::zeros(first.raw_dim());
            for w in &weighted {
                sum += w;
            }
            *slot = sum / weighted.len() as f32;
        }
    }

    updated
}

/// The mean representation of every class in the client's training data, computed in evaluation
/// mode as the mean over batches of the per batch class means.
fn local_prototypes(model: &mut dyn Model, loader: &mut DataLoader) -> Result<PrototypeTable> {
    model.set_training(false);

    let mut batch_means: BTreeMap<usize, Vec<Array1<f32>>> = BTreeMap::new();
    for batch in loader.batches() {
        let out = model.forward(batch.x.view())?;

        let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, &y) in batch.y.iter().enumerate() {
            by_class.entry(y).or_default().push(i);
        }

        for (cls, rows) in by_class {
            if let Some(mean) = out.rep.select(Axis(0), &rows).mean_axis(Axis(0)) {
                batch_means.entry(cls).or_default().push(mean);
            }
        }
    }

    let protos = batch_means
        .into_iter()
        .filter_map(|(cls, means)| {
            let views: Vec<_> = means.iter().map(|m| m.view()).collect();
            let stacked = ndarray::stack(Axis(0), &views).ok()?;
            Some((cls, stacked.mean_axis(Axis(0))?))
        })
        .collect();

    Ok(protos)
}

#[cfg(test)]
mod tests {
    use machine_learning::{
        arch::{Architecture, Net},
        dataset::Dataset,
    };
    use ndarray::array;
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::configs::OptimizerKind;

    fn local() -> LocalTraining {
        LocalTraining {
            epochs: 2,
            optimizer: OptimizerKind::Sgd,
            learning_rate: 0.05,
            weight_decay: 1e-3,
            clip_norm: None,
        }
    }

    fn setup(num_nodes: usize) -> (Vec<Net>, FedProto, DataLoader) {
        let mut rng = StdRng::seed_from_u64(21);
        let nets = Architecture::new(3, 3)
            .with_hidden(vec![6, 5])
            .with_rep_dim(4)
            .build(&mut rng)
            .unwrap();
        let refs: Vec<&dyn Model> = nets.iter().map(|n| n as &dyn Model).collect();
        let algo = FedProto::new(&refs, num_nodes, 3, ProtoConfig::default(), local()).unwrap();

        let data = Dataset::synthetic(3, 6, 3, 0.3, &mut rng).unwrap();
        (nets, algo, DataLoader::sequential(data, 4))
    }

    #[test]
    fn first_epoch_counts_labels_on_every_training() {
        let (mut nets, mut algo, mut loader) = setup(2);
        let net = &mut nets[0];

        algo.load(0, 0, net).unwrap();
        algo.train(0, 0, net, &mut loader).unwrap();
        assert_eq!(algo.distribution(0).unwrap(), [6, 6, 6]);

        algo.load(1, 0, net).unwrap();
        algo.train(1, 0, net, &mut loader).unwrap();
        assert_eq!(algo.distribution(0).unwrap(), [12, 12, 12]);
        assert_eq!(algo.distribution(1).unwrap(), [0, 0, 0]);
    }

    #[test]
    fn aggregation_never_populates_an_empty_table() {
        let (mut nets, mut algo, mut loader) = setup(2);

        for round in 0..3 {
            for client in 0..2 {
                let net = &mut nets[client];
                algo.load(round, client, net).unwrap();
                algo.train(round, client, net, &mut loader).unwrap();
                assert_eq!(algo.staged(client).unwrap().len(), 3);
            }

            assert_eq!(algo.aggregate(round, &[0, 1]).unwrap(), None);
            assert!(algo.global().is_empty());
            assert!(algo.staged(0).is_none());
        }
    }

    #[test]
    fn aggregation_weights_and_then_divides_by_contributors() {
        let mut global = PrototypeTable::new();
        global.insert(0, array![0.0, 0.0]);
        global.insert(1, array![9.0, 9.0]);

        let cross_class = BTreeMap::from([(0, 4)]);
        let a = PrototypeTable::from([(0, array![2.0, 4.0]), (1, array![1.0, 1.0])]);
        let b = PrototypeTable::from([(0, array![6.0, 8.0])]);
        let (da, db) = (vec![1, 5], vec![3, 0]);

        let updated = aggregate_prototypes(
            &global,
            &cross_class,
            &[(da.as_slice(), &a), (db.as_slice(), &b)],
        );

        // (1/4 * [2, 4] + 3/4 * [6, 8]) / 2
        assert_eq!(updated[&0], array![2.5, 3.5]);
        // no denominator for class 1, left as it was
        assert_eq!(updated[&1], array![9.0, 9.0]);
        assert_eq!(updated.len(), 2);
    }

    #[test]
    fn proximity_grad_averages_unit_directions() {
        let global = PrototypeTable::from([(1, array![0.0, 0.0])]);
        let rep = array![[3.0, 4.0], [5.0, 5.0], [0.0, 2.0]];

        let grad = proximity_grad(rep.view(), &[1, 0, 1], &global, 0.5).unwrap();

        // two terms, each weighted 0.5 / 2
        assert!((grad[[0, 0]] - 0.15).abs() < 1e-6);
        assert!((grad[[0, 1]] - 0.2).abs() < 1e-6);
        assert_eq!(grad.row(1), array![0.0, 0.0]);
        assert!((grad[[2, 1]] - 0.25).abs() < 1e-6);

        assert!(proximity_grad(rep.view(), &[0, 0, 2], &global, 0.5).is_none());
    }
}
