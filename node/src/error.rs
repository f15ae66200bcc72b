use std::{error::Error, fmt};

use orchestrator::FlError;

/// Why a training request was not started.
#[derive(Debug)]
pub enum StartRejected {
    /// The device is missing or doesn't have enough free memory.
    ResourceUnavailable(String),
    /// A task with the same id is still registered.
    AlreadyRunning(u64),
    /// The request doesn't describe a valid experiment.
    Config(FlError),
}

impl fmt::Display for StartRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartRejected::ResourceUnavailable(msg) => write!(f, "resource unavailable: {msg}"),
            StartRejected::AlreadyRunning(id) => write!(f, "task {id} is already running"),
            StartRejected::Config(e) => write!(f, "{e}"),
        }
    }
}

impl Error for StartRejected {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StartRejected::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<FlError> for StartRejected {
    fn from(e: FlError) -> Self {
        StartRejected::Config(e)
    }
}
