mod algorithm;
mod dataset;
mod experiment;

pub use algorithm::{AlgorithmKind, ProtoConfig, RalConfig, SsaConfig};
pub use dataset::DatasetKind;
pub use experiment::{ExperimentConfig, OptimizerKind, Tunables};
