use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug, Clone, PartialEq)]
pub enum MlErr {
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    ShapeMismatch {
        name: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    MissingParam {
        name: String,
    },
    UnexpectedParam {
        name: String,
    },
    InvalidInput(&'static str),
    Partition(String),
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MlErr::SizeMismatch {
                what,
                got,
                expected,
            } => format!("There's a size mismatch in {what}, got {got} and expected {expected}"),
            MlErr::ShapeMismatch {
                name,
                got,
                expected,
            } => format!(
                "Parameter {name} has shape {got:?} but the model expects {expected:?}"
            ),
            MlErr::MissingParam { name } => format!("Parameter {name} is missing from the state"),
            MlErr::UnexpectedParam { name } => {
                format!("Parameter {name} is not part of the model")
            }
            MlErr::InvalidInput(msg) => format!("Invalid input: {msg}"),
            MlErr::Partition(msg) => format!("Failed to partition the dataset: {msg}"),
        };

        write!(f, "{s}")
    }
}

impl Error for MlErr {}
