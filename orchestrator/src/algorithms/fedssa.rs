use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use machine_learning::{
    StateDict, Tensor, arch::Model, dataset::DataLoader, partition::NodePartitions,
};

use super::{
    Aggregate, Algorithm, HeaderTable, LocalTraining, initial_states, split_head, unexpected,
};
use crate::{
    FlError, Result,
    configs::{AlgorithmKind, SsaConfig},
};

#[derive(Debug, Clone)]
struct SsaClient {
    state: StateDict,
    /// The classes present in the client's training data, ascending.
    owned: Vec<usize>,
    /// The client's header rows of its owned classes.
    header: HeaderTable,
}

/// Clients share, class by class, the rows of the classification head.
///
/// Every client owns the classes found in its training data. Only owned rows are ever written
/// back or averaged, and classes nobody owns never enter the global table.
pub struct FedSsa {
    shared_keys: Vec<String>,
    clients: Vec<SsaClient>,
    global: HeaderTable,
    config: SsaConfig,
    local: LocalTraining,
}

impl FedSsa {
    /// Creates a new `FedSsa`.
    ///
    /// Both the global table and every client's header start from the first variant's head.
    ///
    /// # Arguments
    /// * `variants` - The model variants.
    /// * `partitions` - The clients' data, scanned for the classes each client owns.
    /// * `config` - The header mixing settings.
    /// * `local` - The local training settings.
    pub fn new(
        variants: &[&dyn Model],
        partitions: &mut dyn NodePartitions,
        config: SsaConfig,
        local: LocalTraining,
    ) -> Result<Self> {
        let first = variants
            .first()
            .ok_or_else(|| FlError::Config("no model variants to train".into()))?;
        let (_, shared_keys) = split_head(*first);
        let init = first.state_dict();

        let states = initial_states(variants, partitions.num_nodes())?;
        let mut clients = Vec::with_capacity(states.len());
        for (i, state) in states.into_iter().enumerate() {
            let owned: Vec<usize> = partitions
                .train(i)?
                .dataset()
                .labels()
                .iter()
                .copied()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();

            let header = header_rows(init, &shared_keys, &owned)?;
            clients.push(SsaClient {
                state,
                owned,
                header,
            });
        }

        let all_owned: Vec<usize> = clients
            .iter()
            .flat_map(|c| c.owned.iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let global = header_rows(init, &shared_keys, &all_owned)?;

        Ok(Self {
            shared_keys,
            clients,
            global,
            config,
            local,
        })
    }

    pub fn global(&self) -> &HeaderTable {
        &self.global
    }

    /// The classes a client owns.
    pub fn owned(&self, client: usize) -> Option<&[usize]> {
        self.clients.get(client).map(|c| c.owned.as_slice())
    }
}

impl Algorithm for FedSsa {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::FedSsa
    }

    fn load(&mut self, round: usize, client: usize, model: &mut dyn Model) -> Result<()> {
        let alpha = self.config.alpha(round);
        let c = &self.clients[client];
        let mut state = c.state.clone();

        for key in &self.shared_keys {
            for &cls in &c.owned {
                let Some(global_row) = self.global.get(key).and_then(|rows| rows.get(&cls)) else {
                    continue;
                };

                let mixed = c.state.row(key, cls)? * alpha + global_row;
                state.set_row(key, cls, &mixed)?;
            }
        }

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

        let state = model.state_dict().clone();
        let c = &mut self.clients[client];
        c.header = header_rows(&state, &self.shared_keys, &c.owned)?;
        c.state = state;
        Ok(())
    }

    /// Replaces every global row with the plain mean of the rows of all the clients owning the
    /// class, whether they were selected or not.
    fn aggregate(&mut self, round: usize, _selected: &[usize]) -> Result<Option<Aggregate>> {
        for (key, rows) in self.global.iter_mut() {
            for (cls, row) in rows.iter_mut() {
                let owners: Vec<&Tensor> = self
                    .clients
                    .iter()
                    .filter_map(|c| c.header.get(key).and_then(|h| h.get(cls)))
                    .collect();

                if owners.is_empty() {
                    continue;
                }

                let mut sum = Tensor::zeros(row.raw_dim());
                for r in &owners {
                    sum += *r;
                }
                *row = sum / owners.len() as f32;
            }
        }

        debug!(
            round = round,
            classes = self.global.values().next().map_or(0, BTreeMap::len);
            "aggregated class headers"
        );

        Ok(Some(Aggregate::Headers(self.global.clone())))
    }

    fn apply(&mut self, aggregate: Aggregate) -> Result<()> {
        match aggregate {
            Aggregate::Headers(table) => {
                self.global = table;
                Ok(())
            }
            other => Err(unexpected(self.kind(), &other)),
        }
    }
}

/// Copies the rows of `classes` of every tensor in `keys`.
fn header_rows(state: &StateDict, keys: &[String], classes: &[usize]) -> Result<HeaderTable> {
    let mut table = HeaderTable::new();
    for key in keys {
        let rows = classes
            .iter()
            .map(|&cls| Ok((cls, state.row(key, cls)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        table.insert(key.clone(), rows);
    }

    Ok(table)
}

#[cfg(test)]
mod tests {
    use machine_learning::{
        arch::{Architecture, FC3_BIAS, FC3_WEIGHT, Net},
        dataset::Dataset,
    };
    use ndarray::{Array2, ArrayD, IxDyn};
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::configs::OptimizerKind;

    /// Two clients over five classes: client 0 holds classes 0 and 1, client 1 holds 1 and 2.
    struct Fixed {
        loaders: Vec<DataLoader>,
    }

    impl NodePartitions for Fixed {
        fn num_nodes(&self) -> usize {
            self.loaders.len()
        }

        fn num_classes(&self) -> usize {
            5
        }

        fn train(&mut self, node: usize) -> machine_learning::Result<&mut DataLoader> {
            Ok(&mut self.loaders[node])
        }

        fn eval(&mut self, node: usize) -> machine_learning::Result<&mut DataLoader> {
            Ok(&mut self.loaders[node])
        }

        fn test(&mut self, node: usize) -> machine_learning::Result<&mut DataLoader> {
            Ok(&mut self.loaders[node])
        }

        fn sample_counts(
            &self,
            node: usize,
        ) -> machine_learning::Result<machine_learning::partition::SampleCounts> {
            Ok(machine_learning::partition::SampleCounts {
                train: self.loaders[node].dataset().len(),
                ..Default::default()
            })
        }
    }

    fn fixed() -> Fixed {
        let loader = |labels: Vec<usize>| {
            let x = Array2::from_shape_fn((labels.len(), 3), |(i, j)| (i + j) as f32 * 0.1);
            DataLoader::sequential(Dataset::new(x, labels, 5).unwrap(), 2)
        };

        Fixed {
            loaders: vec![loader(vec![0, 1, 0, 1]), loader(vec![2, 1, 2, 1])],
        }
    }

    fn setup() -> (Vec<Net>, Fixed, FedSsa) {
        let mut rng = StdRng::seed_from_u64(3);
        let nets = Architecture::new(3, 5)
            .with_hidden(vec![6, 4])
            .with_rep_dim(3)
            .build(&mut rng)
            .unwrap();
        let refs: Vec<&dyn Model> = nets.iter().map(|n| n as &dyn Model).collect();

        let mut parts = fixed();
        let local = LocalTraining {
            epochs: 1,
            optimizer: OptimizerKind::Sgd,
            learning_rate: 5e-3,
            weight_decay: 5e-5,
            clip_norm: Some(50.),
        };
        let algo = FedSsa::new(&refs, &mut parts, SsaConfig::default(), local).unwrap();
        (nets, parts, algo)
    }

    #[test]
    fn owned_classes_come_from_the_training_labels() {
        let (_, _, algo) = setup();

        assert_eq!(algo.owned(0).unwrap(), [0, 1]);
        assert_eq!(algo.owned(1).unwrap(), [1, 2]);

        let classes: Vec<_> = algo.global()[FC3_WEIGHT].keys().copied().collect();
        assert_eq!(classes, [0, 1, 2]);
    }

    #[test]
    fn never_owned_classes_stay_absent() {
        let (mut nets, mut parts, mut algo) = setup();

        for round in 0..3 {
            for client in 0..2 {
                let net = &mut nets[client];
                algo.load(round, client, net).unwrap();
                algo.train(round, client, net, parts.train(client).unwrap())
                    .unwrap();
            }

            let aggregate = algo.aggregate(round, &[0, 1]).unwrap().unwrap();
            algo.apply(aggregate).unwrap();

            for key in [FC3_WEIGHT, FC3_BIAS] {
                assert!(!algo.global()[key].contains_key(&3));
                assert!(!algo.global()[key].contains_key(&4));
            }
        }
    }

    #[test]
    fn shared_class_rows_are_averaged_over_all_owners() {
        let (_, _, mut algo) = setup();

        let row = |v: f32| ArrayD::from_elem(IxDyn(&[3]), v);
        algo.clients[0]
            .header
            .get_mut(FC3_WEIGHT)
            .unwrap()
            .insert(1, row(2.));
        algo.clients[1]
            .header
            .get_mut(FC3_WEIGHT)
            .unwrap()
            .insert(1, row(6.));
        algo.clients[1]
            .header
            .get_mut(FC3_WEIGHT)
            .unwrap()
            .insert(2, row(-1.));

        // client 1 isn't selected but still owns classes 1 and 2
        algo.aggregate(0, &[0]).unwrap();

        assert_eq!(algo.global()[FC3_WEIGHT][&1], row(4.));
        assert_eq!(algo.global()[FC3_WEIGHT][&2], row(-1.));
    }

    #[test]
    fn load_adds_the_decayed_local_row_to_the_global_one() {
        let (mut nets, _, mut algo) = setup();
        let net = &mut nets[1];

        let before = algo.clients[1].state.row(FC3_WEIGHT, 2).unwrap();
        let global = algo.global()[FC3_WEIGHT][&2].clone();
        let untouched = algo.clients[1].state.row(FC3_WEIGHT, 4).unwrap();

        algo.load(0, 1, net).unwrap();
        let loaded = net.state_dict().row(FC3_WEIGHT, 2).unwrap();
        let expected = &before * 0.5 + &global;
        assert!(
            loaded
                .iter()
                .zip(expected.iter())
                .all(|(a, b)| (a - b).abs() < 1e-6)
        );
        assert_eq!(net.state_dict().row(FC3_WEIGHT, 4).unwrap(), untouched);

        // alpha is 0 from decay_rounds on
        algo.load(2, 1, net).unwrap();
        assert_eq!(net.state_dict().row(FC3_WEIGHT, 2).unwrap(), global);
    }
}
