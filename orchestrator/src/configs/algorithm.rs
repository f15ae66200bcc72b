use std::{f64::consts::PI, fmt, str::FromStr};

use crate::FlError;

/// The federated algorithms an experiment can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgorithmKind {
    /// Every client trains alone, nothing is aggregated.
    Standalone,
    /// The classification head is averaged, weighted by sample count.
    LgFedAvg,
    /// Per class representation prototypes are averaged.
    FedProto,
    /// Per class header rows are averaged.
    FedSsa,
    /// The representation transform is averaged.
    FedRal,
}

impl AlgorithmKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Standalone => "Standalone",
            Self::LgFedAvg => "LG-FedAvg",
            Self::FedProto => "FedProto",
            Self::FedSsa => "FedSSA",
            Self::FedRal => "FedRAL",
        }
    }
}

impl FromStr for AlgorithmKind {
    type Err = FlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();

        match key.as_str() {
            "standalone" => Ok(Self::Standalone),
            "lgfedavg" => Ok(Self::LgFedAvg),
            "fedproto" => Ok(Self::FedProto),
            "fedssa" => Ok(Self::FedSsa),
            "fedral" => Ok(Self::FedRal),
            _ => Err(FlError::Config(format!("unknown algorithm {s:?}"))),
        }
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// FedSSA settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SsaConfig {
    /// Learning rate of the local training, used instead of the experiment's.
    pub inner_lr: f32,
    /// Weight decay of the local training, used instead of the experiment's.
    pub inner_wd: f32,
    /// The round from which the local header stops contributing to the loaded one.
    pub decay_rounds: usize,
    /// The initial weight of the local header.
    pub miu_0: f32,
}

impl Default for SsaConfig {
    fn default() -> Self {
        Self {
            inner_lr: 5e-3,
            inner_wd: 5e-5,
            decay_rounds: 2,
            miu_0: 0.5,
        }
    }
}

impl SsaConfig {
    /// The weight of a client's local header row at `round`.
    ///
    /// `miu_0 * cos(round * pi / (2 * decay_rounds))` before `decay_rounds` and exactly `0`
    /// from then on.
    pub fn alpha(&self, round: usize) -> f32 {
        if round >= self.decay_rounds {
            return 0.;
        }

        let angle = round as f64 * PI / (2. * self.decay_rounds as f64);
        (self.miu_0 as f64 * angle.cos()) as f32
    }
}

/// FedRAL settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RalConfig {
    /// The amount of diagonal blocks the transform is compressed to, `1` disables compression.
    pub block_num: usize,
}

impl Default for RalConfig {
    fn default() -> Self {
        Self { block_num: 500 }
    }
}

/// FedProto settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtoConfig {
    /// The weight of the distance to the global prototypes in the local loss.
    pub proximity_weight: f32,
}

impl Default for ProtoConfig {
    fn default() -> Self {
        Self {
            proximity_weight: 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithm_names_are_loose() {
        assert_eq!("lg_fedavg".parse::<AlgorithmKind>().unwrap(), AlgorithmKind::LgFedAvg);
        assert_eq!("FedSSA".parse::<AlgorithmKind>().unwrap(), AlgorithmKind::FedSsa);
        assert!("fedavg".parse::<AlgorithmKind>().is_err());
    }

    #[test]
    fn alpha_decays_to_zero_and_stays_there() {
        let ssa = SsaConfig::default();

        assert_eq!(ssa.alpha(0), 0.5);
        assert!((ssa.alpha(1) - 0.5 * (PI / 4.).cos() as f32).abs() < 1e-6);
        assert_eq!(ssa.alpha(2), 0.);
        assert!((3..50).all(|r| ssa.alpha(r) == 0.));
    }
}
