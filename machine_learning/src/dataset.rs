use ndarray::{Array2, ArrayView2, Axis};
use ndarray_rand::{RandomExt, rand_distr::StandardNormal};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use rand_distr::{Distribution, Normal};

use crate::{MlErr, Result};

/// An in-memory labelled dataset, one sample per row of `features`.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    features: Array2<f32>,
    labels: Vec<usize>,
    num_classes: usize,
}

/// An owned mini-batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub x: Array2<f32>,
    pub y: Vec<usize>,
}

impl Dataset {
    /// Creates a new `Dataset`.
    ///
    /// # Errors
    /// If the amount of rows and labels differ or any label is not below `num_classes`.
    pub fn new(features: Array2<f32>, labels: Vec<usize>, num_classes: usize) -> Result<Self> {
        if features.nrows() != labels.len() {
            return Err(MlErr::SizeMismatch {
                what: "dataset labels",
                got: labels.len(),
                expected: features.nrows(),
            });
        }

        if labels.iter().any(|&y| y >= num_classes) {
            return Err(MlErr::InvalidInput("dataset label out of range"));
        }

        Ok(Self {
            features,
            labels,
            num_classes,
        })
    }

    /// Generates `per_class` samples of every class around a random gaussian center.
    ///
    /// # Arguments
    /// * `num_classes` - The amount of classes.
    /// * `per_class` - The amount of samples of each class.
    /// * `in_features` - The dimension of every sample.
    /// * `spread` - The standard deviation of the samples around their center.
    /// * `rng` - A random number generator.
    pub fn synthetic<R: Rng>(
        num_classes: usize,
        per_class: usize,
        in_features: usize,
        spread: f32,
        rng: &mut R,
    ) -> Result<Self> {
        let noise =
            Normal::new(0., spread).map_err(|_| MlErr::InvalidInput("invalid synthetic spread"))?;

        let centers: Array2<f32> =
            Array2::random_using((num_classes, in_features), StandardNormal, rng) * 3.;

        let n = num_classes * per_class;
        let mut features = Array2::zeros((n, in_features));
        let mut labels = Vec::with_capacity(n);

        for (i, mut row) in features.axis_iter_mut(Axis(0)).enumerate() {
            let class = i % num_classes.max(1);
            for (x, &c) in row.iter_mut().zip(centers.row(class)) {
                *x = c + noise.sample(rng);
            }
            labels.push(class);
        }

        Self::new(features, labels, num_classes)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn in_features(&self) -> usize {
        self.features.ncols()
    }

    pub fn features(&self) -> ArrayView2<'_, f32> {
        self.features.view()
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Copies the samples at `indices`, in that order, into a new `Dataset`.
    pub fn subset(&self, indices: &[usize]) -> Result<Dataset> {
        if let Some(&i) = indices.iter().find(|&&i| i >= self.len()) {
            return Err(MlErr::SizeMismatch {
                what: "dataset index",
                got: i,
                expected: self.len(),
            });
        }

        Ok(Self {
            features: self.features.select(Axis(0), indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
            num_classes: self.num_classes,
        })
    }

    /// The indices of the samples of every class, indexed by class.
    pub fn class_indices(&self) -> Vec<Vec<usize>> {
        let mut by_class = vec![Vec::new(); self.num_classes];
        for (i, &y) in self.labels.iter().enumerate() {
            by_class[y].push(i);
        }
        by_class
    }
}

/// Iterates a `Dataset` in mini-batches, reshuffling every pass when built with `shuffled`.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: Dataset,
    batch_size: usize,
    rng: Option<StdRng>,
}

impl DataLoader {
    /// Returns a loader yielding the samples in their stored order.
    pub fn sequential(dataset: Dataset, batch_size: usize) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            rng: None,
        }
    }

    /// Returns a loader yielding the samples in a new random order on every pass.
    pub fn shuffled(dataset: Dataset, batch_size: usize, seed: u64) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            rng: Some(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Starts a new pass over the dataset.
    pub fn batches(&mut self) -> Batches<'_> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if let Some(rng) = self.rng.as_mut() {
            order.shuffle(rng);
        }

        Batches {
            dataset: &self.dataset,
            order,
            batch_size: self.batch_size,
            cursor: 0,
        }
    }
}

/// One pass of a `DataLoader`.
pub struct Batches<'a> {
    dataset: &'a Dataset,
    order: Vec<usize>,
    batch_size: usize,
    cursor: usize,
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.cursor >= self.order.len() {
            return None;
        }

        let end = (self.cursor + self.batch_size).min(self.order.len());
        let idx = &self.order[self.cursor..end];
        self.cursor = end;

        Some(Batch {
            x: self.dataset.features.select(Axis(0), idx),
            y: idx.iter().map(|&i| self.dataset.labels[i]).collect(),
        })
    }
}
