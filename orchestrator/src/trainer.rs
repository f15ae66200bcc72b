use std::{fmt, path::Path, sync::Arc};

use log::{debug, error, info};
use machine_learning::{
    arch::{Architecture, Model, Net, loss::CrossEntropy},
    metrics::{Metrics, evaluate},
    partition::NodePartitions,
};
use rand::{SeedableRng, rngs::StdRng};
use tokio_util::sync::CancellationToken;

use crate::{
    FlError, Result,
    algorithms::{self, Algorithm},
    configs::{AlgorithmKind, DatasetKind, ExperimentConfig},
    events::{Event, EventSink},
    results::{ClientRecord, ResultsLog, RoundRecord},
    selection::ClientSampler,
};

/// Where a `Trainer` is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Configured,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl fmt::Display for TrainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Configured => "configured",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };

        f.write_str(s)
    }
}

/// How a run that didn't fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every round ran.
    Completed,
    /// The cancellation token was observed at a round or client boundary.
    Cancelled,
}

/// Runs one federated experiment: selects the clients of every round, trains and evaluates
/// them and lets the algorithm aggregate what they produced.
pub struct Trainer {
    config: ExperimentConfig,
    dataset: DatasetKind,
    algorithm_kind: AlgorithmKind,
    nets: Vec<Net>,
    algorithm: Box<dyn Algorithm>,
    partitions: Box<dyn NodePartitions>,
    sampler: ClientSampler,
    log: Option<ResultsLog>,
    rounds: Vec<RoundRecord>,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
    state: TrainerState,
}

impl Trainer {
    /// Creates a new `Trainer`.
    ///
    /// The configuration is validated before the partitions are requested and before any model
    /// is built.
    ///
    /// # Arguments
    /// * `config` - The experiment's configuration.
    /// * `sink` - Receives the client and round events.
    /// * `cancel` - Polled at every round and client boundary.
    /// * `provider` - Loads and splits the dataset among the clients.
    ///
    /// # Errors
    /// `FlError::Config` for an invalid configuration or partitions that don't match it,
    /// `FlError::Training` if the provider or the models fail and `FlError::Io` if the results
    /// log can't be created.
    pub fn new<P>(
        config: ExperimentConfig,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
        provider: P,
    ) -> Result<Self>
    where
        P: FnOnce(DatasetKind, &ExperimentConfig) -> machine_learning::Result<Box<dyn NodePartitions>>,
    {
        let (dataset, algorithm_kind) = config.validate()?;
        let task = config.task_id;

        info!(
            "[Task-{task}] configuring {algorithm_kind} on {dataset}: N={} F={} R={} E={}",
            config.num_nodes, config.fraction, config.rounds, config.epochs
        );

        let mut partitions = provider(dataset, &config)?;
        check_partitions(dataset, &config, partitions.as_mut())?;

        let t = &config.tunables;
        let mut rng = StdRng::seed_from_u64(t.seed);
        let nets = Architecture::new(dataset.in_features(), dataset.num_classes())
            .with_hidden(t.hidden.clone())
            .with_rep_dim(t.rep_dim)
            .with_low_rank(algorithm_kind == AlgorithmKind::FedRal)
            .build(&mut rng)?;

        let variants: Vec<&dyn Model> = nets.iter().map(|n| n as &dyn Model).collect();
        let algorithm = algorithms::build(algorithm_kind, &config, &variants, partitions.as_mut())?;

        let file_name = ResultsLog::file_name(&config, algorithm_kind.name(), dataset.name());
        let log = ResultsLog::create(&config.results_dir, &file_name, config.num_nodes)?;
        let sampler = ClientSampler::new(config.num_nodes, config.fraction, t.seed);

        debug!(
            variants = nets.len(),
            per_round = sampler.per_round();
            "[Task-{task}] trainer ready"
        );

        Ok(Self {
            config,
            dataset,
            algorithm_kind,
            nets,
            algorithm,
            partitions,
            sampler,
            log: Some(log),
            rounds: Vec::new(),
            sink,
            cancel,
            state: TrainerState::Configured,
        })
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn dataset(&self) -> DatasetKind {
        self.dataset
    }

    pub fn algorithm(&self) -> AlgorithmKind {
        self.algorithm_kind
    }

    /// The records of the rounds that ran to completion.
    pub fn rounds(&self) -> &[RoundRecord] {
        &self.rounds
    }

    /// The path of the results log, `None` once a completed run has marked it as done.
    pub fn results_path(&self) -> Option<&Path> {
        self.log.as_ref().map(ResultsLog::path)
    }

    /// Runs every round of the experiment unless cancelled.
    ///
    /// On completion the results log is renamed to mark it as done, a failed rename is only
    /// logged. Cancelled and failed runs leave the log as it is.
    ///
    /// # Returns
    /// How the run ended or the error that aborted it, in which case the trainer is `Failed`.
    pub fn run(&mut self) -> Result<RunOutcome> {
        let task = self.config.task_id;
        if self.state != TrainerState::Configured {
            return Err(FlError::Config(format!(
                "task {task} can't run while {}",
                self.state
            )));
        }

        self.state = TrainerState::Running;
        let result = self.run_rounds();
        if let Ok(RunOutcome::Completed) = result {
            // a log that can't be renamed doesn't fail a completed run
            if let Some(log) = self.log.take() {
                if let Err(e) = log.mark_done() {
                    error!(error:% = e; "[Task-{task}] failed to mark the results log as done");
                }
            }
        }

        match &result {
            Ok(RunOutcome::Completed) => {
                self.state = TrainerState::Completed;
                info!("[Task-{task}] training finished");
            }
            Ok(RunOutcome::Cancelled) => {
                self.state = TrainerState::Cancelled;
                info!("[Task-{task}] training cancelled");
            }
            Err(e) => {
                self.state = TrainerState::Failed;
                error!("[Task-{task}] training failed: {e}");
            }
        }

        result
    }

    fn run_rounds(&mut self) -> Result<RunOutcome> {
        let task = self.config.task_id;

        for round in 0..self.config.rounds {
            if self.cancel.is_cancelled() {
                info!("[Task-{task}] cancellation observed before round {round}");
                return Ok(RunOutcome::Cancelled);
            }

            let selected = self.sampler.sample();
            info!("[Task-{task}] round {round}: selected clients {selected:?}");

            let mut records = Vec::with_capacity(selected.len());
            for &client in &selected {
                if self.cancel.is_cancelled() {
                    info!("[Task-{task}] cancellation observed in round {round}, abandoning it");
                    return Ok(RunOutcome::Cancelled);
                }

                let metrics = self.train_client(round, client)?;
                info!(
                    "[Task-{task}] round {round} client {client}: loss={:.4} accuracy={:.4} f1={:.4}",
                    metrics.loss, metrics.accuracy, metrics.f1_score
                );

                self.sink.publish(Event::client(task, round, client, &metrics));
                records.push(ClientRecord::new(round, client, metrics));
            }

            if self.cancel.is_cancelled() {
                info!("[Task-{task}] cancellation observed in round {round}, abandoning it");
                return Ok(RunOutcome::Cancelled);
            }

            let all: Vec<Metrics> = records.iter().map(|r| r.metrics).collect();
            let record = RoundRecord {
                round,
                means: Metrics::mean(&all),
            };

            info!(
                "[Task-{task}] round {round} means: loss={} accuracy={} precision={} recall={} f1={}",
                record.means.loss,
                record.means.accuracy,
                record.means.precision,
                record.means.recall,
                record.means.f1_score
            );
            self.sink.publish(Event::round(task, round, &record.means));

            if let Some(log) = self.log.as_mut() {
                log.append(&record, &records)?;
            }
            self.rounds.push(record);

            if let Some(aggregate) = self.algorithm.aggregate(round, &selected)? {
                debug!(round = round; "[Task-{task}] applying the aggregate");
                self.algorithm.apply(aggregate)?;
            }
        }

        Ok(RunOutcome::Completed)
    }

    /// Loads, trains and evaluates one client on its model variant.
    fn train_client(&mut self, round: usize, client: usize) -> Result<Metrics> {
        let variants = self.nets.len();
        let net = &mut self.nets[client % variants];

        self.algorithm.load(round, client, net)?;
        let loader = self.partitions.train(client)?;
        self.algorithm.train(round, client, net, loader)?;

        let test = self.partitions.test(client)?;
        Ok(evaluate(net, test, &CrossEntropy)?)
    }
}

/// Checks that the partitions fit the experiment and the dataset's models.
fn check_partitions(
    dataset: DatasetKind,
    config: &ExperimentConfig,
    partitions: &mut dyn NodePartitions,
) -> Result<()> {
    if partitions.num_nodes() != config.num_nodes {
        return Err(FlError::Config(format!(
            "the partitions hold {} nodes but the experiment has {}",
            partitions.num_nodes(),
            config.num_nodes
        )));
    }

    if partitions.num_classes() != dataset.num_classes() {
        return Err(FlError::Config(format!(
            "the partitions hold {} classes but {dataset} has {}",
            partitions.num_classes(),
            dataset.num_classes()
        )));
    }

    let in_features = partitions.train(0)?.dataset().in_features();
    if in_features != dataset.in_features() {
        return Err(FlError::Config(format!(
            "the partitions hold {in_features} features per sample but {dataset} has {}",
            dataset.in_features()
        )));
    }

    Ok(())
}
