use std::fmt;

use machine_learning::MlErr;

/// The result type used across the orchestrator.
pub type Result<T> = std::result::Result<T, FlError>;

/// All errors that can occur while setting up or running an experiment.
#[derive(Debug)]
pub enum FlError {
    /// Invalid configuration, caught before any data is loaded or any model is built.
    Config(String),
    /// The model or the data partitions failed during training or evaluation.
    Training(MlErr),
    /// An aggregation step was asked to combine nothing.
    Aggregation(String),
    /// Writing the results log failed.
    Io(std::io::Error),
}

impl fmt::Display for FlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "invalid config: {msg}"),
            Self::Training(e) => write!(f, "training error: {e}"),
            Self::Aggregation(msg) => write!(f, "aggregation error: {msg}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for FlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Training(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MlErr> for FlError {
    fn from(e: MlErr) -> Self {
        Self::Training(e)
    }
}

impl From<std::io::Error> for FlError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
