use ndarray::{ArrayD, ArrayView1, ArrayView2, Axis, Ix1, Ix2};

use crate::{MlErr, Result};

/// A dense, dynamically shaped tensor of parameters.
pub type Tensor = ArrayD<f32>;

/// An ordered mapping from parameter names to tensors.
///
/// The insertion order is the model's parameter registration order, which the federated
/// algorithms rely on (e.g. "the last two tensors are the classification head").
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDict {
    entries: Vec<(String, Tensor)>,
}

impl StateDict {
    /// Creates a new empty `StateDict`.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts a tensor, replacing (in place, keeping the order) any tensor with the same name.
    ///
    /// # Arguments
    /// * `name` - The parameter's name.
    /// * `tensor` - The parameter's value.
    ///
    /// # Returns
    /// The previous tensor stored under `name`, if any.
    pub fn insert<S: Into<String>>(&mut self, name: S, tensor: Tensor) -> Option<Tensor> {
        let name = name.into();

        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some((_, slot)) => Some(std::mem::replace(slot, tensor)),
            None => {
                self.entries.push((name, tensor));
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, t)| t)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == name)
            .map(|(_, t)| t)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Returns the tensor stored under `name` or a `MissingParam` error.
    pub fn require(&self, name: &str) -> Result<&Tensor> {
        self.get(name).ok_or_else(|| MlErr::MissingParam {
            name: name.to_string(),
        })
    }

    /// Returns the tensor stored under `name` mutably or a `MissingParam` error.
    pub fn require_mut(&mut self, name: &str) -> Result<&mut Tensor> {
        self.get_mut(name).ok_or_else(|| MlErr::MissingParam {
            name: name.to_string(),
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().map(|(k, t)| (k.as_str(), t))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Tensor)> {
        self.entries.iter_mut().map(|(k, t)| (k.as_str(), t))
    }

    /// Copies the tensors named in `keys` into a new `StateDict`, in the order of `keys`.
    ///
    /// # Errors
    /// `MissingParam` if any of the keys is not present.
    pub fn subset<'a, I>(&self, keys: I) -> Result<StateDict>
    where
        I: IntoIterator<Item = &'a str>,
    {
        keys.into_iter()
            .map(|k| Ok((k.to_string(), self.require(k)?.clone())))
            .collect()
    }

    /// Overwrites (or appends) every tensor of `other` into `self`.
    pub fn merge(&mut self, other: &StateDict) {
        for (k, t) in other.iter() {
            self.insert(k, t.clone());
        }
    }

    /// Views a parameter as a matrix.
    pub fn view2(&self, name: &str) -> Result<ArrayView2<'_, f32>> {
        let t = self.require(name)?;
        t.view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| MlErr::ShapeMismatch {
                name: name.to_string(),
                got: t.shape().to_vec(),
                expected: vec![0, 0],
            })
    }

    /// Views a parameter as a vector.
    pub fn view1(&self, name: &str) -> Result<ArrayView1<'_, f32>> {
        let t = self.require(name)?;
        t.view()
            .into_dimensionality::<Ix1>()
            .map_err(|_| MlErr::ShapeMismatch {
                name: name.to_string(),
                got: t.shape().to_vec(),
                expected: vec![0],
            })
    }

    /// Returns an owned copy of the `row`-th slice along the first axis of a parameter.
    ///
    /// For a `[out, in]` weight this is the row feeding output unit `row`, for a bias it is a
    /// scalar tensor.
    pub fn row(&self, name: &str, row: usize) -> Result<Tensor> {
        let t = self.require(name)?;
        check_row(t, row)?;
        Ok(t.index_axis(Axis(0), row).to_owned())
    }

    /// Overwrites the `row`-th slice along the first axis of a parameter.
    pub fn set_row(&mut self, name: &str, row: usize, value: &Tensor) -> Result<()> {
        let t = self.require_mut(name)?;
        check_row(t, row)?;

        let mut slot = t.index_axis_mut(Axis(0), row);
        if slot.shape() != value.shape() {
            return Err(MlErr::ShapeMismatch {
                name: name.to_string(),
                got: value.shape().to_vec(),
                expected: slot.shape().to_vec(),
            });
        }

        slot.assign(value);
        Ok(())
    }

    /// Returns a `StateDict` with the same names and shapes, filled with zeros.
    pub fn zeros_like(&self) -> StateDict {
        self.iter()
            .map(|(k, t)| (k.to_string(), Tensor::zeros(t.raw_dim())))
            .collect()
    }

    /// Computes `self += alpha * other`, tensor by tensor.
    ///
    /// # Errors
    /// `MissingParam` or `ShapeMismatch` if `other` doesn't have every tensor of `self` with the
    /// same shape.
    pub fn scaled_add(&mut self, alpha: f32, other: &StateDict) -> Result<()> {
        for (k, t) in self.entries.iter_mut() {
            let o = other.require(k)?;
            if o.shape() != t.shape() {
                return Err(MlErr::ShapeMismatch {
                    name: k.clone(),
                    got: o.shape().to_vec(),
                    expected: t.shape().to_vec(),
                });
            }

            t.scaled_add(alpha, o);
        }

        Ok(())
    }

    /// Multiplies every tensor by `alpha`.
    pub fn scale(&mut self, alpha: f32) {
        for (_, t) in self.entries.iter_mut() {
            t.mapv_inplace(|x| x * alpha);
        }
    }

    /// The euclidean norm of all the tensors concatenated.
    pub fn norm(&self) -> f32 {
        self.entries
            .iter()
            .flat_map(|(_, t)| t.iter())
            .map(|x| x * x)
            .sum::<f32>()
            .sqrt()
    }
}

fn check_row(t: &Tensor, row: usize) -> Result<()> {
    let rows = t.shape().first().copied().unwrap_or(0);
    if row >= rows {
        return Err(MlErr::SizeMismatch {
            what: "tensor rows",
            got: row,
            expected: rows,
        });
    }

    Ok(())
}

impl FromIterator<(String, Tensor)> for StateDict {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        let mut sd = StateDict::new();
        for (k, t) in iter {
            sd.insert(k, t);
        }
        sd
    }
}

impl IntoIterator for StateDict {
    type Item = (String, Tensor);
    type IntoIter = std::vec::IntoIter<(String, Tensor)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
