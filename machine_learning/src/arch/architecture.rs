use rand::Rng;

use super::{Net, NetSpec};
use crate::{MlErr, Result};

/// Hidden widths of the five default model variants.
pub const DEFAULT_HIDDEN: [usize; 5] = [2000, 1500, 1000, 800, 500];

/// Width of the representation every variant exposes to its classification head.
pub const DEFAULT_REP_DIM: usize = 500;

/// Describes a family of architecturally distinct `Net` variants that share their input,
/// representation and output widths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Architecture {
    in_features: usize,
    out_dim: usize,
    hidden: Vec<usize>,
    rep_dim: usize,
    low_rank: bool,
}

impl Architecture {
    /// Creates a new `Architecture` with the default variant widths.
    ///
    /// # Arguments
    /// * `in_features` - The amount of input features of every variant.
    /// * `out_dim` - The amount of classes.
    pub fn new(in_features: usize, out_dim: usize) -> Self {
        Self {
            in_features,
            out_dim,
            hidden: DEFAULT_HIDDEN.to_vec(),
            rep_dim: DEFAULT_REP_DIM,
            low_rank: false,
        }
    }

    /// Replaces the hidden widths, one per variant.
    pub fn with_hidden(mut self, hidden: Vec<usize>) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn with_rep_dim(mut self, rep_dim: usize) -> Self {
        self.rep_dim = rep_dim;
        self
    }

    /// Makes every variant carry the square `oft.r` transform on its representation.
    pub fn with_low_rank(mut self, low_rank: bool) -> Self {
        self.low_rank = low_rank;
        self
    }

    /// The amount of variants.
    pub fn variants(&self) -> usize {
        self.hidden.len()
    }

    pub fn rep_dim(&self) -> usize {
        self.rep_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// The dimensions of the `i`-th variant.
    pub fn spec(&self, i: usize) -> Option<NetSpec> {
        self.hidden.get(i).map(|&hidden| NetSpec {
            in_features: self.in_features,
            hidden,
            rep_dim: self.rep_dim,
            out_dim: self.out_dim,
            low_rank: self.low_rank,
        })
    }

    /// Builds one freshly initialized `Net` per variant.
    ///
    /// # Arguments
    /// * `rng` - A random number generator used to initialize the parameters.
    ///
    /// # Returns
    /// The variants, in order, or an error if there are none or any dimension is zero.
    pub fn build<R: Rng>(&self, rng: &mut R) -> Result<Vec<Net>> {
        if self.hidden.is_empty() {
            return Err(MlErr::InvalidInput("an architecture needs at least one variant"));
        }

        (0..self.variants())
            .filter_map(|i| self.spec(i))
            .map(|spec| Net::new(spec, rng))
            .collect()
    }
}
