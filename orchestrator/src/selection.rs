use rand::{SeedableRng, rngs::StdRng, seq::index};

/// The amount of clients selected every round, `floor(fraction * num_nodes)`.
pub fn clients_per_round(num_nodes: usize, fraction: f64) -> usize {
    (fraction * num_nodes as f64).floor().max(0.) as usize
}

/// Draws the clients of every round, uniformly and without replacement.
///
/// The generator is seeded once, so the same seed, amount of nodes and fraction reproduce the
/// same sequence of selections.
#[derive(Debug, Clone)]
pub struct ClientSampler {
    rng: StdRng,
    num_nodes: usize,
    per_round: usize,
}

impl ClientSampler {
    /// Creates a new `ClientSampler`.
    ///
    /// # Arguments
    /// * `num_nodes` - The amount of clients to choose from.
    /// * `fraction` - The fraction of clients selected every round.
    /// * `seed` - The seed of the selection sequence.
    pub fn new(num_nodes: usize, fraction: f64, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            num_nodes,
            per_round: clients_per_round(num_nodes, fraction).min(num_nodes),
        }
    }

    pub fn per_round(&self) -> usize {
        self.per_round
    }

    /// Selects the clients of the next round, in the order they should train.
    pub fn sample(&mut self) -> Vec<usize> {
        index::sample(&mut self.rng, self.num_nodes, self.per_round).into_vec()
    }
}
