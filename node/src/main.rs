use std::{env, fs, io, sync::Arc};

use log::{error, info};
use node::{PartitionProvider, TrainingService, admission::FixedProbe, request::TrainRequest};
use orchestrator::{
    configs::{DatasetKind, ExperimentConfig},
    data::synthetic_nodes,
    events::LogSink,
};
use tokio::{runtime::Handle, signal};

const DEFAULT_RESULTS_DIR: &str = "results";
const SAMPLES_PER_CLASS: usize = 4;

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let path = env::var("REQUEST")
        .ok()
        .or_else(|| env::args().nth(1))
        .ok_or_else(|| io::Error::other("pass the request path as REQUEST or first argument"))?;

    let request: TrainRequest = serde_json::from_str(&fs::read_to_string(&path)?)?;
    let task_id = request.task_id;
    info!("loaded request for task {task_id} from {path}");

    let free_gb = match env::var("FREE_MEMORY_GB") {
        Ok(v) => v.parse::<f64>().map_err(io::Error::other)?,
        Err(_) => f64::INFINITY,
    };

    let provider: PartitionProvider = Arc::new(|dataset: DatasetKind, config: &ExperimentConfig| {
        synthetic_nodes(dataset, config, SAMPLES_PER_CLASS)
    });
    let service = TrainingService::new(
        Handle::current(),
        Arc::new(FixedProbe::new(free_gb)),
        Arc::new(LogSink),
        provider,
    )
    .with_results_dir(env::var("RESULTS_DIR").unwrap_or_else(|_| DEFAULT_RESULTS_DIR.to_string()));

    let mut task = match service.start(request) {
        Ok(task) => task,
        Err(e) => {
            error!("task {task_id} rejected: {e}");
            return Err(io::Error::other(e));
        }
    };

    tokio::select! {
        status = &mut task => {
            let status = status.map_err(io::Error::other)?;
            info!("task {task_id} finished with status {status:?}");
        }
        _ = signal::ctrl_c() => {
            info!("received SIGTERM, stopping task {task_id}");
            service.stop(task_id);
            let status = task.await.map_err(io::Error::other)?;
            info!("task {task_id} finished with status {status:?}");
        }
    }

    Ok(())
}
