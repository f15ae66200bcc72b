use std::{path::PathBuf, sync::Arc};

use log::{error, info, warn};
use machine_learning::partition::NodePartitions;
use orchestrator::{
    RunOutcome, Trainer,
    configs::{DatasetKind, ExperimentConfig, Tunables},
    events::{Event, EventSink, TaskStatus},
};
use tokio::{runtime::Handle, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    StartRejected,
    admission::{self, DeviceProbe},
    registry::{TaskHandle, TaskRegistry},
    request::TrainRequest,
};

/// Loads and splits a dataset among the clients of an experiment.
pub type PartitionProvider = Arc<
    dyn Fn(DatasetKind, &ExperimentConfig) -> machine_learning::Result<Box<dyn NodePartitions>>
        + Send
        + Sync,
>;

/// Starts and stops training tasks, each on its own blocking worker of a tokio runtime.
pub struct TrainingService {
    runtime: Handle,
    registry: Arc<TaskRegistry>,
    probe: Arc<dyn DeviceProbe>,
    sink: Arc<dyn EventSink>,
    provider: PartitionProvider,
    tunables: Tunables,
    results_dir: PathBuf,
}

impl TrainingService {
    /// Creates a new `TrainingService`.
    ///
    /// # Arguments
    /// * `runtime` - The runtime the tasks are spawned on.
    /// * `probe` - Reports the free memory of the devices.
    /// * `sink` - Receives the events of every task.
    /// * `provider` - Provides the clients' data of every experiment.
    pub fn new(
        runtime: Handle,
        probe: Arc<dyn DeviceProbe>,
        sink: Arc<dyn EventSink>,
        provider: PartitionProvider,
    ) -> Self {
        Self {
            runtime,
            registry: Arc::new(TaskRegistry::new()),
            probe,
            sink,
            provider,
            tunables: Tunables::default(),
            results_dir: PathBuf::from("results"),
        }
    }

    /// Replaces the training knobs every task runs with.
    pub fn with_tunables(mut self, tunables: Tunables) -> Self {
        self.tunables = tunables;
        self
    }

    pub fn with_results_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.results_dir = dir.into();
        self
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Starts a training task.
    ///
    /// The task publishes `IN_PROGRESS`, runs the experiment and then publishes `SUCCESS`,
    /// `CANCELLED` or `FAILED`. It leaves the registry once it finishes.
    ///
    /// # Arguments
    /// * `request` - The experiment to run.
    ///
    /// # Returns
    /// A handle resolving to the task's final status, or why the task was not started.
    pub fn start(&self, request: TrainRequest) -> Result<JoinHandle<TaskStatus>, StartRejected> {
        let task_id = request.task_id;
        if self.registry.contains(task_id) {
            return Err(StartRejected::AlreadyRunning(task_id));
        }

        let config = request.to_config(self.tunables.clone(), &self.results_dir);
        let (dataset, _) = config.validate()?;

        let required = request.min_free_memory_gb(dataset);
        admission::admit(self.probe.as_ref(), config.tunables.device, required)?;

        let handle = self
            .registry
            .register(task_id)
            .ok_or(StartRejected::AlreadyRunning(task_id))?;

        let sink = Arc::clone(&self.sink);
        let provider = Arc::clone(&self.provider);
        let token = handle.token().clone();
        let task = self
            .runtime
            .spawn_blocking(move || run_task(config, sink, provider, token));

        let registry = Arc::clone(&self.registry);
        let reaper = self.runtime.spawn(reap(task_id, task, registry, handle));

        info!("[Task-{task_id}] training task started");
        Ok(reaper)
    }

    /// Signals a task to stop and forgets it, so that its id can be started again.
    ///
    /// # Returns
    /// Whether a running task was found.
    pub fn stop(&self, task_id: u64) -> bool {
        match self.registry.remove(task_id) {
            Some(handle) => {
                handle.cancel();
                info!("[Task-{task_id}] stop requested");
                true
            }
            None => {
                warn!("[Task-{task_id}] stop requested but the task isn't running");
                false
            }
        }
    }
}

/// Runs one experiment to its end and publishes its lifecycle.
fn run_task(
    config: ExperimentConfig,
    sink: Arc<dyn EventSink>,
    provider: PartitionProvider,
    token: CancellationToken,
) -> TaskStatus {
    let task_id = config.task_id;
    sink.publish(Event::status(task_id, TaskStatus::InProgress, "training started"));

    let result = Trainer::new(config, Arc::clone(&sink), token.clone(), |d, c| provider(d, c))
        .and_then(|mut trainer| trainer.run());

    let (status, message) = match result {
        Ok(RunOutcome::Completed) if !token.is_cancelled() => {
            (TaskStatus::Success, "training finished".to_string())
        }
        Ok(_) => (TaskStatus::Cancelled, "training stopped by the user".to_string()),
        Err(e) => {
            error!("[Task-{task_id}] {e}");
            (TaskStatus::Failed, format!("training failed: {e}"))
        }
    };

    sink.publish(Event::status(task_id, status, message));
    status
}

/// Waits for a task and removes its registration.
async fn reap(
    task_id: u64,
    task: JoinHandle<TaskStatus>,
    registry: Arc<TaskRegistry>,
    handle: TaskHandle,
) -> TaskStatus {
    let status = match task.await {
        Ok(status) => status,
        Err(e) => {
            error!("[Task-{task_id}] training task panicked: {e}");
            TaskStatus::Failed
        }
    };

    registry.release(task_id, &handle);
    info!("[Task-{task_id}] training task ended: {status:?}");
    status
}
