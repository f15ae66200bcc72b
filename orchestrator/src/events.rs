//! Telemetry emitted while an experiment runs.
//!
//! Events serialize to the JSON published on the `task:experiment:{round,client,status}:{id}`
//! channels.

use chrono::Local;
use log::{info, warn};
use machine_learning::metrics::Metrics;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

/// The lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    InProgress,
    Success,
    Cancelled,
    Failed,
}

/// The metrics of one client after its local training in one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEvent {
    pub task_id: u64,
    pub round_num: usize,
    pub client_index: usize,
    pub loss: f32,
    pub accuracy: f32,
    pub precision: f32,
    pub recall: f32,
    pub f1_score: f32,
    pub timestamp: String,
}

/// The mean metrics of a finished round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundEvent {
    pub task_id: u64,
    pub round_num: usize,
    pub loss: f32,
    pub accuracy: f32,
    pub precision: f32,
    pub recall: f32,
    pub f1_score: f32,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub task_id: u64,
    pub status: TaskStatus,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Client(ClientEvent),
    Round(RoundEvent),
    Status(StatusEvent),
}

/// The current local time in ISO 8601.
pub fn iso_now() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

impl Event {
    pub fn client(task_id: u64, round_num: usize, client_index: usize, m: &Metrics) -> Self {
        Self::Client(ClientEvent {
            task_id,
            round_num,
            client_index,
            loss: m.loss,
            accuracy: m.accuracy,
            precision: m.precision,
            recall: m.recall,
            f1_score: m.f1_score,
            timestamp: iso_now(),
        })
    }

    pub fn round(task_id: u64, round_num: usize, m: &Metrics) -> Self {
        Self::Round(RoundEvent {
            task_id,
            round_num,
            loss: m.loss,
            accuracy: m.accuracy,
            precision: m.precision,
            recall: m.recall,
            f1_score: m.f1_score,
            timestamp: iso_now(),
        })
    }

    pub fn status(task_id: u64, status: TaskStatus, message: impl Into<String>) -> Self {
        Self::Status(StatusEvent {
            task_id,
            status,
            message: message.into(),
            timestamp: iso_now(),
        })
    }

    pub fn task_id(&self) -> u64 {
        match self {
            Self::Client(e) => e.task_id,
            Self::Round(e) => e.task_id,
            Self::Status(e) => e.task_id,
        }
    }

    /// The pub/sub channel the event belongs to.
    pub fn channel(&self) -> String {
        let kind = match self {
            Self::Client(_) => "client",
            Self::Round(_) => "round",
            Self::Status(_) => "status",
        };

        format!("task:experiment:{kind}:{}", self.task_id())
    }

    /// The JSON payload of the event.
    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            Self::Client(e) => serde_json::to_string(e),
            Self::Round(e) => serde_json::to_string(e),
            Self::Status(e) => serde_json::to_string(e),
        }
    }
}

/// Receives the events of running experiments.
///
/// Publishing never fails the experiment, sinks log their own delivery problems.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);
}

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, event: Event) {
        match event.to_json() {
            Ok(json) => info!("{} {json}", event.channel()),
            Err(e) => warn!("failed to serialize event for {}: {e}", event.channel()),
        }
    }
}

/// Forwards every event to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: UnboundedSender<Event>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<Event>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, event: Event) {
        if let Err(e) = self.tx.send(event) {
            warn!("event receiver dropped, discarding {}", e.0.channel());
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    #[test]
    fn client_event_uses_camel_case_keys() {
        let m = Metrics {
            loss: 1.5,
            accuracy: 0.25,
            precision: 0.5,
            recall: 0.5,
            f1_score: 0.5,
        };
        let event = Event::client(7, 3, 2, &m);
        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();

        assert_eq!(event.channel(), "task:experiment:client:7");
        assert_eq!(json["taskId"], 7);
        assert_eq!(json["roundNum"], 3);
        assert_eq!(json["clientIndex"], 2);
        assert_eq!(json["f1Score"], 0.5);
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn status_is_screaming_snake_case() {
        let event = Event::status(1, TaskStatus::InProgress, "started");
        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();

        assert_eq!(event.channel(), "task:experiment:status:1");
        assert_eq!(json["status"], "IN_PROGRESS");
        assert_eq!(json["message"], "started");
    }

    #[test]
    fn channel_sink_forwards_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ChannelSink::new(tx);

        sink.publish(Event::status(1, TaskStatus::Success, "done"));
        assert!(matches!(rx.try_recv(), Ok(Event::Status(_))));

        drop(rx);
        sink.publish(Event::status(1, TaskStatus::Failed, "nobody listens"));
    }
}
