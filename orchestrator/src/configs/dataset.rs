use std::{fmt, str::FromStr};

use crate::FlError;

/// The datasets an experiment can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetKind {
    Cifar100,
    TinyImagenet,
}

impl DatasetKind {
    /// Normalizes a user facing dataset name into the canonical one.
    ///
    /// `CIFAR100` (any case) becomes `cifar100` and `Tiny-Imagenet`, `tiny_imagenet` or
    /// `tinyimagenet` (any case) become `tiny-imagenet`. Any other name is returned trimmed.
    pub fn normalize(name: &str) -> String {
        let s = name.trim();
        if s.eq_ignore_ascii_case("cifar100") {
            return "cifar100".to_string();
        }

        match s.to_ascii_lowercase().as_str() {
            "tiny-imagenet" | "tiny_imagenet" | "tinyimagenet" => "tiny-imagenet".to_string(),
            _ => s.to_string(),
        }
    }

    /// The canonical name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cifar100 => "cifar100",
            Self::TinyImagenet => "tiny-imagenet",
        }
    }

    pub fn num_classes(&self) -> usize {
        match self {
            Self::Cifar100 => 100,
            Self::TinyImagenet => 200,
        }
    }

    /// The side of the square input images.
    pub fn input_size(&self) -> usize {
        match self {
            Self::Cifar100 => 32,
            Self::TinyImagenet => 64,
        }
    }

    /// The amount of features of a flattened RGB input image.
    pub fn in_features(&self) -> usize {
        self.input_size() * self.input_size() * 3
    }

    /// The free device memory, in GB, needed to admit a task on this dataset.
    pub fn min_free_memory_gb(&self) -> f64 {
        match self {
            Self::Cifar100 => 3.0,
            Self::TinyImagenet => 5.5,
        }
    }
}

impl FromStr for DatasetKind {
    type Err = FlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Self::normalize(s).as_str() {
            "cifar100" => Ok(Self::Cifar100),
            "tiny-imagenet" => Ok(Self::TinyImagenet),
            _ => Err(FlError::Config(format!(
                "unsupported dataset {s:?}, only CIFAR100 / Tiny-Imagenet are supported"
            ))),
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
