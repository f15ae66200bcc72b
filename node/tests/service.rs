use std::{sync::Arc, time::Duration};

use machine_learning::partition::NodePartitions;
use node::{
    PartitionProvider, StartRejected, TrainingService,
    admission::FixedProbe,
    request::TrainRequest,
};
use orchestrator::{
    configs::{DatasetKind, ExperimentConfig, Tunables},
    data::synthetic_nodes,
    events::{ChannelSink, Event, TaskStatus},
};
use tempfile::TempDir;
use tokio::{
    runtime::Handle,
    sync::mpsc::{self, UnboundedReceiver},
};

fn request(task_id: u64, data_name: &str, rounds: usize) -> TrainRequest {
    TrainRequest {
        task_id,
        data_name: data_name.into(),
        algorithm_name: "LG-FedAvg".into(),
        num_nodes: 4,
        fraction: 0.5,
        classes_per_node: 25,
        low_prob: 0.1,
        num_steps: rounds,
        epochs: 1,
        min_free_memory_gb: None,
    }
}

fn service(free_gb: f64, dir: &TempDir) -> (TrainingService, UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let provider: PartitionProvider =
        Arc::new(|d: DatasetKind, c: &ExperimentConfig| synthetic_nodes(d, c, 2));
    let tunables = Tunables {
        batch_size: 16,
        hidden: vec![8, 6],
        rep_dim: 4,
        ..Tunables::default()
    };

    let service = TrainingService::new(
        Handle::current(),
        Arc::new(FixedProbe::new(free_gb)),
        Arc::new(ChannelSink::new(tx)),
        provider,
    )
    .with_tunables(tunables)
    .with_results_dir(dir.path());

    (service, rx)
}

fn statuses(rx: &mut UnboundedReceiver<Event>) -> Vec<TaskStatus> {
    let mut out = Vec::new();
    while let Ok(e) = rx.try_recv() {
        if let Event::Status(s) = e {
            out.push(s.status);
        }
    }
    out
}

#[tokio::test(flavor = "multi_thread")]
async fn finished_tasks_report_success_and_leave_the_registry() {
    let dir = tempfile::tempdir().unwrap();
    let (service, mut rx) = service(8.0, &dir);

    let task = service.start(request(1, "CIFAR100", 2)).unwrap();
    assert_eq!(task.await.unwrap(), TaskStatus::Success);

    assert_eq!(
        statuses(&mut rx),
        [TaskStatus::InProgress, TaskStatus::Success]
    );
    assert!(service.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_ids_are_rejected_while_running() {
    let dir = tempfile::tempdir().unwrap();
    let (service, _rx) = service(8.0, &dir);

    let task = service.start(request(2, "cifar100", 10_000)).unwrap();
    assert!(matches!(
        service.start(request(2, "cifar100", 1)),
        Err(StartRejected::AlreadyRunning(2))
    ));

    assert!(service.stop(2));
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn stopped_tasks_report_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let (service, mut rx) = service(8.0, &dir);

    let task = service.start(request(3, "cifar100", 10_000)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(service.stop(3));
    assert!(!service.registry().contains(3));
    assert_eq!(task.await.unwrap(), TaskStatus::Cancelled);
    assert_eq!(
        statuses(&mut rx),
        [TaskStatus::InProgress, TaskStatus::Cancelled]
    );

    // stopping twice is a no-op
    assert!(!service.stop(3));
}

#[tokio::test(flavor = "multi_thread")]
async fn admission_and_config_failures_never_start_a_task() {
    let dir = tempfile::tempdir().unwrap();
    let (service, mut rx) = service(4.0, &dir);

    assert!(matches!(
        service.start(request(4, "tiny-imagenet", 1)),
        Err(StartRejected::ResourceUnavailable(_))
    ));

    let mut lowered = request(4, "Tiny_Imagenet", 1);
    lowered.min_free_memory_gb = Some(2.0);
    lowered.num_nodes = 0;
    assert!(matches!(
        service.start(lowered),
        Err(StartRejected::Config(_))
    ));

    assert!(matches!(
        service.start(request(5, "mnist", 1)),
        Err(StartRejected::Config(_))
    ));

    assert!(service.registry().is_empty());
    assert!(statuses(&mut rx).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_tasks_report_failed() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let provider: PartitionProvider = Arc::new(
        |_: DatasetKind, _: &ExperimentConfig| -> machine_learning::Result<Box<dyn NodePartitions>> {
            Err(machine_learning::MlErr::Partition("no data".into()))
        },
    );

    let service = TrainingService::new(
        Handle::current(),
        Arc::new(FixedProbe::new(8.0)),
        Arc::new(ChannelSink::new(tx)),
        provider,
    )
    .with_results_dir(dir.path());

    let task = service.start(request(6, "cifar100", 1)).unwrap();
    assert_eq!(task.await.unwrap(), TaskStatus::Failed);

    let failed = std::iter::from_fn(|| rx.try_recv().ok())
        .find_map(|e| match e {
            Event::Status(s) if s.status == TaskStatus::Failed => Some(s.message),
            _ => None,
        })
        .unwrap();
    assert!(failed.contains("no data"));
}
