use std::sync::Arc;

use machine_learning::{
    dataset::DataLoader,
    metrics::Metrics,
    partition::{NodePartitions, SampleCounts},
};
use orchestrator::{
    FlError, RunOutcome, Trainer, TrainerState,
    algorithms::block_diagonal,
    configs::{DatasetKind, ExperimentConfig, RalConfig, Tunables},
    data::synthetic_nodes,
    events::{ChannelSink, Event, EventSink},
    selection::ClientSampler,
};
use tempfile::TempDir;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

fn config(algorithm: &str, fraction: f64, dir: &TempDir) -> ExperimentConfig {
    let tunables = Tunables {
        batch_size: 16,
        hidden: vec![8, 6],
        rep_dim: 4,
        ..Tunables::default()
    };

    ExperimentConfig::new(9, "CIFAR100", algorithm, 4, fraction, 25, 0.1, 2, 1)
        .with_tunables(tunables)
        .with_ral(RalConfig { block_num: 2 })
        .with_results_dir(dir.path())
}

fn provider(
    dataset: DatasetKind,
    config: &ExperimentConfig,
) -> machine_learning::Result<Box<dyn NodePartitions>> {
    synthetic_nodes(dataset, config, 2)
}

fn channel() -> (Arc<dyn EventSink>, UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelSink::new(tx)), rx)
}

fn drain(rx: &mut UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(e) = rx.try_recv() {
        events.push(e);
    }
    events
}

fn client_order(events: &[Event]) -> Vec<(usize, usize)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Client(c) => Some((c.round_num, c.client_index)),
            _ => None,
        })
        .collect()
}

fn csv_files(dir: &TempDir) -> Vec<String> {
    std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

#[test]
fn selection_is_reproducible_for_a_fixed_seed() {
    let mut orders = Vec::new();

    for _ in 0..2 {
        let dir = tempfile::tempdir().unwrap();
        let (sink, mut rx) = channel();
        let mut trainer = Trainer::new(
            config("standalone", 0.5, &dir),
            sink,
            CancellationToken::new(),
            provider,
        )
        .unwrap();

        assert_eq!(trainer.run().unwrap(), RunOutcome::Completed);
        assert_eq!(trainer.state(), TrainerState::Completed);

        let events = drain(&mut rx);
        let rounds = events.iter().filter(|e| matches!(e, Event::Round(_))).count();
        assert_eq!(rounds, 2);

        let order = client_order(&events);
        assert_eq!(order.len(), 4);
        for round in 0..2 {
            let clients: Vec<_> = order.iter().filter(|(r, _)| *r == round).collect();
            assert_eq!(clients.len(), 2);
            assert_ne!(clients[0].1, clients[1].1);
        }

        orders.push(order);
    }

    assert_eq!(orders[0], orders[1]);

    let mut sampler = ClientSampler::new(4, 0.5, Tunables::default().seed);
    let expected: Vec<(usize, usize)> = (0..2)
        .flat_map(|r| sampler.sample().into_iter().map(move |c| (r, c)))
        .collect();
    assert_eq!(orders[0], expected);
}

#[test]
fn completed_runs_mark_their_log_as_done() {
    let dir = tempfile::tempdir().unwrap();
    let (sink, _rx) = channel();
    let mut trainer = Trainer::new(
        config("lg-fedavg", 0.5, &dir),
        sink,
        CancellationToken::new(),
        provider,
    )
    .unwrap();

    let path = trainer.results_path().unwrap().to_path_buf();
    trainer.run().unwrap();

    assert!(trainer.results_path().is_none());
    assert!(!path.exists());

    let files = csv_files(&dir);
    assert_eq!(files.len(), 1);
    assert!(files[0].contains("_Done_T9_LG-FedAvg_cifar100_25_N4_C0.5_R2_E1_low0.1"));

    let text = std::fs::read_to_string(dir.path().join(&files[0])).unwrap();
    assert_eq!(text.lines().count(), 3);
    assert_eq!(text.lines().next().unwrap().split(',').count(), 25);
}

#[test]
fn a_failed_rename_still_completes_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let (sink, mut rx) = channel();
    let mut trainer = Trainer::new(
        config("standalone", 0.5, &dir),
        sink,
        CancellationToken::new(),
        provider,
    )
    .unwrap();

    // a non-empty directory where the renamed log would go
    let path = trainer.results_path().unwrap().to_path_buf();
    let name = path.file_name().unwrap().to_str().unwrap();
    let (ts, rest) = name.split_once('_').unwrap();
    let blocked = dir.path().join(format!("{ts}_Done_{rest}"));
    std::fs::create_dir(&blocked).unwrap();
    std::fs::write(blocked.join("keep"), b"x").unwrap();

    assert_eq!(trainer.run().unwrap(), RunOutcome::Completed);
    assert_eq!(trainer.state(), TrainerState::Completed);
    assert_eq!(trainer.rounds().len(), 2);

    let rounds = drain(&mut rx)
        .iter()
        .filter(|e| matches!(e, Event::Round(_)))
        .count();
    assert_eq!(rounds, 2);

    // the log stays where it was, with every round
    assert!(path.exists());
    assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 3);
}

#[test]
fn round_means_are_the_rounded_client_means() {
    let dir = tempfile::tempdir().unwrap();
    let (sink, mut rx) = channel();
    let mut trainer = Trainer::new(
        config("fedssa", 1.0, &dir),
        sink,
        CancellationToken::new(),
        provider,
    )
    .unwrap();
    trainer.run().unwrap();

    let events = drain(&mut rx);
    for round in 0..2 {
        let clients: Vec<Metrics> = events
            .iter()
            .filter_map(|e| match e {
                Event::Client(c) if c.round_num == round => Some(Metrics {
                    loss: c.loss,
                    accuracy: c.accuracy,
                    precision: c.precision,
                    recall: c.recall,
                    f1_score: c.f1_score,
                }),
                _ => None,
            })
            .collect();
        assert_eq!(clients.len(), 4);

        let expected = Metrics::mean(&clients);
        assert_eq!(trainer.rounds()[round].means, expected);

        let Some(Event::Round(r)) = events
            .iter()
            .find(|e| matches!(e, Event::Round(r) if r.round_num == round))
        else {
            panic!("missing round event {round}");
        };
        assert_eq!(r.accuracy, expected.accuracy);
        assert_eq!(r.f1_score, expected.f1_score);
    }
}

#[test]
fn every_algorithm_runs_to_completion() {
    for algorithm in ["Standalone", "LG-FedAvg", "FedProto", "FedSSA", "FedRAL"] {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _rx) = channel();
        let mut trainer = Trainer::new(
            config(algorithm, 0.5, &dir),
            sink,
            CancellationToken::new(),
            provider,
        )
        .unwrap();

        assert_eq!(trainer.algorithm().name(), algorithm);
        assert_eq!(trainer.run().unwrap(), RunOutcome::Completed, "{algorithm}");
        assert_eq!(trainer.rounds().len(), 2);
        assert!(
            trainer
                .rounds()
                .iter()
                .all(|r| r.means.to_array().iter().all(|v| v.is_finite()))
        );
    }
}

/// Cancels the run as soon as the first client reports.
struct CancelOnFirstClient {
    token: CancellationToken,
    inner: ChannelSink,
}

impl EventSink for CancelOnFirstClient {
    fn publish(&self, event: Event) {
        if matches!(event, Event::Client(_)) {
            self.token.cancel();
        }
        self.inner.publish(event);
    }
}

#[test]
fn cancelling_mid_round_abandons_the_round() {
    let dir = tempfile::tempdir().unwrap();
    let token = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink = Arc::new(CancelOnFirstClient {
        token: token.clone(),
        inner: ChannelSink::new(tx),
    });

    let mut trainer =
        Trainer::new(config("fedproto", 1.0, &dir), sink, token, provider).unwrap();
    let path = trainer.results_path().unwrap().to_path_buf();

    assert_eq!(trainer.run().unwrap(), RunOutcome::Cancelled);
    assert_eq!(trainer.state(), TrainerState::Cancelled);

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], Event::Client(c) if c.round_num == 0));
    assert!(trainer.rounds().is_empty());

    // no round row and no rename
    assert!(path.exists());
    assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);
}

#[test]
fn cancelled_before_the_first_round_trains_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (sink, mut rx) = channel();
    let token = CancellationToken::new();
    let mut trainer =
        Trainer::new(config("fedral", 0.5, &dir), sink, token.clone(), provider).unwrap();

    token.cancel();
    assert_eq!(trainer.run().unwrap(), RunOutcome::Cancelled);
    assert!(drain(&mut rx).is_empty());

    // a trainer only runs once
    assert!(matches!(trainer.run(), Err(FlError::Config(_))));
}

#[test]
fn unsupported_dataset_fails_before_loading_any_data() {
    let dir = tempfile::tempdir().unwrap();
    let (sink, _rx) = channel();
    let mut config = config("standalone", 0.5, &dir);
    config.data_name = "mnist".into();

    let mut asked = false;
    let result = Trainer::new(config, sink, CancellationToken::new(), |d, c| {
        asked = true;
        provider(d, c)
    });

    assert!(matches!(result, Err(FlError::Config(msg)) if msg.contains("mnist")));
    assert!(!asked);
    assert!(csv_files(&dir).is_empty());
}

#[test]
fn partitions_must_match_the_experiment() {
    let dir = tempfile::tempdir().unwrap();
    let (sink, _rx) = channel();
    let config = config("standalone", 0.5, &dir);

    let result = Trainer::new(config, sink, CancellationToken::new(), |d, c| {
        let mut fewer = c.clone();
        fewer.num_nodes = 2;
        fewer.classes_per_node = 50;
        synthetic_nodes(d, &fewer, 2)
    });

    assert!(matches!(result, Err(FlError::Config(_))));
}

/// Delegates to real partitions but can't produce any test loader.
struct NoTestData(Box<dyn NodePartitions>);

impl NodePartitions for NoTestData {
    fn num_nodes(&self) -> usize {
        self.0.num_nodes()
    }

    fn num_classes(&self) -> usize {
        self.0.num_classes()
    }

    fn train(&mut self, node: usize) -> machine_learning::Result<&mut DataLoader> {
        self.0.train(node)
    }

    fn eval(&mut self, node: usize) -> machine_learning::Result<&mut DataLoader> {
        self.0.eval(node)
    }

    fn test(&mut self, _node: usize) -> machine_learning::Result<&mut DataLoader> {
        Err(machine_learning::MlErr::Partition("test set unavailable".into()))
    }

    fn sample_counts(&self, node: usize) -> machine_learning::Result<SampleCounts> {
        self.0.sample_counts(node)
    }
}

#[test]
fn training_errors_fail_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let (sink, mut rx) = channel();
    let mut trainer = Trainer::new(
        config("standalone", 0.5, &dir),
        sink,
        CancellationToken::new(),
        |d, c| Ok(Box::new(NoTestData(provider(d, c)?)) as Box<dyn NodePartitions>),
    )
    .unwrap();

    assert!(matches!(trainer.run(), Err(FlError::Training(_))));
    assert_eq!(trainer.state(), TrainerState::Failed);
    assert!(drain(&mut rx).is_empty());
    assert!(trainer.results_path().unwrap().exists());
}

#[test]
fn block_diagonal_mask_keeps_square_over_block_num_entries() {
    let r = ndarray::Array2::<f32>::ones((500, 500));
    for block_num in [2, 5, 100, 500] {
        let (masked, mask) = block_diagonal(r.view(), block_num);
        let size = 500 / block_num;

        assert_eq!(mask.sum() as usize, 500 * 500 / block_num);
        assert_eq!(
            masked.iter().filter(|v| **v != 0.).count(),
            500 * 500 / block_num
        );
        for ((i, j), v) in masked.indexed_iter() {
            assert_eq!(*v != 0., i / size == j / size, "entry ({i}, {j})");
            assert_eq!(*v != 0., mask[[i, j]] == 1.);
        }
    }
}
