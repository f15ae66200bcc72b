use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use chrono::Local;
use log::info;
use machine_learning::metrics::Metrics;

use crate::configs::ExperimentConfig;

const METRICS: [&str; 5] = ["loss", "accuracy", "precision", "recall", "f1_score"];

/// The mean metrics over the clients that completed a round.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundRecord {
    pub round: usize,
    pub means: Metrics,
}

/// The metrics of one client in one round.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRecord {
    pub round: usize,
    pub client: usize,
    pub metrics: Metrics,
    /// Local time formatted as `%Y-%m-%d %H:%M:%S`.
    pub timestamp: String,
}

impl ClientRecord {
    pub fn new(round: usize, client: usize, metrics: Metrics) -> Self {
        Self {
            round,
            client,
            metrics,
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

/// A CSV file with one row per round: the round's means followed by the most recent metrics of
/// every client, zeros for the clients not selected yet.
#[derive(Debug)]
pub struct ResultsLog {
    path: PathBuf,
    latest: Vec<Metrics>,
}

impl ResultsLog {
    /// The file name of an experiment's log,
    /// `{timestamp}_T{task}_{algorithm}_{dataset}_{cpn}_N{N}_C{F}_R{R}_E{E}_low{low}.csv`.
    pub fn file_name(config: &ExperimentConfig, algorithm: &str, dataset: &str) -> String {
        format!(
            "{}_T{}_{algorithm}_{dataset}_{}_N{}_C{}_R{}_E{}_low{}.csv",
            Local::now().format("%Y%m%d%H%M%S"),
            config.task_id,
            config.classes_per_node,
            config.num_nodes,
            config.fraction,
            config.rounds,
            config.epochs,
            config.low_prob,
        )
    }

    /// Creates the log file and writes its header.
    ///
    /// # Arguments
    /// * `dir` - The directory of the log, created if missing.
    /// * `file_name` - The name of the log file.
    /// * `num_nodes` - The amount of clients of the experiment.
    pub fn create(dir: &Path, file_name: &str, num_nodes: usize) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(file_name);

        let mut header: Vec<String> = METRICS.iter().map(|m| format!("mean_{m}")).collect();
        for client in 0..num_nodes {
            header.extend(METRICS.iter().map(|m| format!("{client}_{m}")));
        }

        let mut w = BufWriter::new(File::create(&path)?);
        writeln!(w, "{}", header.join(","))?;
        w.flush()?;

        info!("results log created: {}", path.display());
        Ok(Self {
            path,
            latest: vec![Metrics::default(); num_nodes],
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends the row of a finished round.
    ///
    /// # Arguments
    /// * `round` - The means of the round.
    /// * `clients` - The records of the clients that trained in the round.
    pub fn append(&mut self, round: &RoundRecord, clients: &[ClientRecord]) -> io::Result<()> {
        for c in clients {
            if let Some(slot) = self.latest.get_mut(c.client) {
                *slot = c.metrics;
            }
        }

        let row: Vec<String> = std::iter::once(&round.means)
            .chain(&self.latest)
            .flat_map(|m| m.to_array())
            .map(|v| format!("{v:?}"))
            .collect();

        let mut f = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(f, "{}", row.join(","))?;
        f.flush()
    }

    /// Renames the log to `{timestamp}_Done_{rest}`, keeping its contents.
    ///
    /// # Returns
    /// The new path of the log.
    pub fn mark_done(self) -> io::Result<PathBuf> {
        let name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();

        let done = match name.split_once('_') {
            Some((ts, rest)) => format!("{ts}_Done_{rest}"),
            None => format!("Done_{name}"),
        };

        let new_path = self.path.with_file_name(done);
        fs::rename(&self.path, &new_path)?;

        info!("results log renamed to: {}", new_path.display());
        Ok(new_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(x: f32) -> Metrics {
        Metrics {
            loss: x,
            accuracy: x,
            precision: x,
            recall: x,
            f1_score: x,
        }
    }

    #[test]
    fn rows_carry_the_latest_metrics_of_every_client() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = ResultsLog::create(dir.path(), "20260101000000_T1_x.csv", 3).unwrap();

        let r0 = RoundRecord {
            round: 0,
            means: metrics(0.5),
        };
        log.append(&r0, &[ClientRecord::new(0, 1, metrics(0.5))]).unwrap();

        let r1 = RoundRecord {
            round: 1,
            means: metrics(0.25),
        };
        log.append(&r1, &[ClientRecord::new(1, 2, metrics(0.25))]).unwrap();

        let text = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<_> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("mean_loss,mean_accuracy,"));
        assert!(lines[0].ends_with("2_recall,2_f1_score"));
        assert_eq!(lines[0].split(',').count(), 20);

        let last: Vec<&str> = lines[2].split(',').collect();
        assert_eq!(last[0], "0.25");
        assert_eq!(last[5], "0.0");
        assert_eq!(last[10], "0.5");
        assert_eq!(last[15], "0.25");
    }

    #[test]
    fn done_logs_keep_their_contents() {
        let dir = tempfile::tempdir().unwrap();
        let log = ResultsLog::create(dir.path(), "20260101000000_T1_x.csv", 1).unwrap();
        let before = fs::read_to_string(log.path()).unwrap();

        let done = log.mark_done().unwrap();
        assert_eq!(done.file_name().unwrap(), "20260101000000_Done_T1_x.csv");
        assert_eq!(fs::read_to_string(done).unwrap(), before);
    }

    #[test]
    fn file_name_lists_the_experiment() {
        let config = ExperimentConfig::new(9, "cifar100", "FedSSA", 10, 0.1, 20, 0.4, 3, 2);
        let name = ResultsLog::file_name(&config, "FedSSA", "cifar100");
        let (ts, rest) = name.split_once('_').unwrap();

        assert_eq!(ts.len(), 14);
        assert_eq!(rest, "T9_FedSSA_cifar100_20_N10_C0.1_R3_E2_low0.4.csv");
    }
}
