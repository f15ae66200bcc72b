use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_rand::{
    RandomExt,
    rand_distr::{StandardNormal, Uniform},
};
use rand::Rng;

use super::{Model, Output};
use crate::{MlErr, Result, StateDict};

pub const FC1_WEIGHT: &str = "fc1.weight";
pub const FC1_BIAS: &str = "fc1.bias";
pub const FC2_WEIGHT: &str = "fc2.weight";
pub const FC2_BIAS: &str = "fc2.bias";
pub const FC3_WEIGHT: &str = "fc3.weight";
pub const FC3_BIAS: &str = "fc3.bias";
pub const OFT_R: &str = "oft.r";

/// Dimensions of a `Net`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetSpec {
    pub in_features: usize,
    pub hidden: usize,
    pub rep_dim: usize,
    pub out_dim: usize,
    /// Whether the net carries the square `oft.r` transform on its representation.
    pub low_rank: bool,
}

/// A fully connected classifier: `fc1 -> relu -> fc2 -> relu -> [rep + rep·R] -> fc3`.
///
/// Weights are stored `[out, in]`, so row `c` of `fc3.weight` (and entry `c` of `fc3.bias`)
/// belongs to class `c`.
#[derive(Debug, Clone)]
pub struct Net {
    spec: NetSpec,
    params: StateDict,
    training: bool,
    cache: Option<Cache>,
}

/// Forward metadata needed by `backward`.
#[derive(Debug, Clone)]
struct Cache {
    x: Array2<f32>,
    z1: Array2<f32>,
    a1: Array2<f32>,
    z2: Array2<f32>,
    rep: Array2<f32>,
    total: Array2<f32>,
}

impl Net {
    /// Creates a new `Net` with randomly initialized parameters.
    ///
    /// # Arguments
    /// * `spec` - The dimensions of the net.
    /// * `rng` - A random number generator.
    ///
    /// # Returns
    /// A new `Net` or an error if any dimension is zero.
    pub fn new<R: Rng>(spec: NetSpec, rng: &mut R) -> Result<Self> {
        let NetSpec {
            in_features,
            hidden,
            rep_dim,
            out_dim,
            low_rank,
        } = spec;

        if [in_features, hidden, rep_dim, out_dim].contains(&0) {
            return Err(MlErr::InvalidInput("net dimensions must be non-zero"));
        }

        let mut params = StateDict::new();
        for (w, b, fan_in, fan_out) in [
            (FC1_WEIGHT, FC1_BIAS, in_features, hidden),
            (FC2_WEIGHT, FC2_BIAS, hidden, rep_dim),
            (FC3_WEIGHT, FC3_BIAS, rep_dim, out_dim),
        ] {
            let bound = 1. / (fan_in as f32).sqrt();
            let dist = Uniform::new_inclusive(-bound, bound)
                .map_err(|_| MlErr::InvalidInput("invalid initialization bounds"))?;

            params.insert(w, Array2::random_using((fan_out, fan_in), &dist, rng).into_dyn());
            params.insert(b, Array1::random_using(fan_out, &dist, rng).into_dyn());
        }

        if low_rank {
            let r: Array2<f32> = Array2::random_using((rep_dim, rep_dim), StandardNormal, rng);
            params.insert(OFT_R, r.into_dyn());
        }

        Ok(Self {
            spec,
            params,
            training: true,
            cache: None,
        })
    }

    pub fn spec(&self) -> NetSpec {
        self.spec
    }

    pub fn is_training(&self) -> bool {
        self.training
    }
}

impl Model for Net {
    fn state_dict(&self) -> &StateDict {
        &self.params
    }

    fn state_dict_mut(&mut self) -> &mut StateDict {
        &mut self.params
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        for (name, current) in self.params.iter() {
            let new = state.require(name)?;
            if new.shape() != current.shape() {
                return Err(MlErr::ShapeMismatch {
                    name: name.to_string(),
                    got: new.shape().to_vec(),
                    expected: current.shape().to_vec(),
                });
            }
        }

        if let Some(name) = state.keys().find(|k| !self.params.contains(k)) {
            return Err(MlErr::UnexpectedParam {
                name: name.to_string(),
            });
        }

        for (name, current) in self.params.iter_mut() {
            current.assign(state.require(name)?);
        }
        self.cache = None;
        Ok(())
    }

    fn forward(&mut self, x: ArrayView2<f32>) -> Result<Output> {
        if x.ncols() != self.spec.in_features {
            return Err(MlErr::SizeMismatch {
                what: "input features",
                got: x.ncols(),
                expected: self.spec.in_features,
            });
        }

        let p = &self.params;
        let z1 = linear(p.view2(FC1_WEIGHT)?, p.view1(FC1_BIAS)?, x);
        let a1 = z1.mapv(relu);
        let z2 = linear(p.view2(FC2_WEIGHT)?, p.view1(FC2_BIAS)?, a1.view());
        let rep = z2.mapv(relu);

        let total = match self.spec.low_rank {
            true => &rep + &rep.dot(&p.view2(OFT_R)?),
            false => rep.clone(),
        };

        let logits = linear(p.view2(FC3_WEIGHT)?, p.view1(FC3_BIAS)?, total.view());

        self.cache = Some(Cache {
            x: x.to_owned(),
            z1,
            a1,
            z2,
            rep: rep.clone(),
            total,
        });

        Ok(Output { logits, rep })
    }

    fn backward(
        &mut self,
        d_logits: ArrayView2<f32>,
        d_rep: Option<ArrayView2<f32>>,
    ) -> Result<StateDict> {
        let cache = self
            .cache
            .as_ref()
            .ok_or(MlErr::InvalidInput("backward called before forward"))?;

        let batch = cache.x.nrows();
        if d_logits.dim() != (batch, self.spec.out_dim) {
            return Err(MlErr::SizeMismatch {
                what: "logits gradient",
                got: d_logits.len(),
                expected: batch * self.spec.out_dim,
            });
        }

        let p = &self.params;
        let mut grads = StateDict::new();

        let d_w3 = d_logits.t().dot(&cache.total);
        let d_b3 = d_logits.sum_axis(Axis(0));
        let d_total = d_logits.dot(&p.view2(FC3_WEIGHT)?);

        let (mut d_rep_total, d_r) = match self.spec.low_rank {
            true => {
                let r = p.view2(OFT_R)?;
                let d_r = cache.rep.t().dot(&d_total);
                (&d_total + &d_total.dot(&r.t()), Some(d_r))
            }
            false => (d_total, None),
        };

        if let Some(extra) = d_rep {
            if extra.dim() != d_rep_total.dim() {
                return Err(MlErr::SizeMismatch {
                    what: "representation gradient",
                    got: extra.len(),
                    expected: d_rep_total.len(),
                });
            }
            d_rep_total += &extra;
        }

        let mut d_z2 = d_rep_total;
        d_z2.zip_mut_with(&cache.z2, |d, &z| *d *= relu_prime(z));
        let d_w2 = d_z2.t().dot(&cache.a1);
        let d_b2 = d_z2.sum_axis(Axis(0));

        let mut d_z1 = d_z2.dot(&p.view2(FC2_WEIGHT)?);
        d_z1.zip_mut_with(&cache.z1, |d, &z| *d *= relu_prime(z));
        let d_w1 = d_z1.t().dot(&cache.x);
        let d_b1 = d_z1.sum_axis(Axis(0));

        grads.insert(FC1_WEIGHT, d_w1.into_dyn());
        grads.insert(FC1_BIAS, d_b1.into_dyn());
        grads.insert(FC2_WEIGHT, d_w2.into_dyn());
        grads.insert(FC2_BIAS, d_b2.into_dyn());
        grads.insert(FC3_WEIGHT, d_w3.into_dyn());
        grads.insert(FC3_BIAS, d_b3.into_dyn());
        if let Some(d_r) = d_r {
            grads.insert(OFT_R, d_r.into_dyn());
        }

        Ok(grads)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

fn linear(w: ArrayView2<f32>, b: ArrayView1<f32>, x: ArrayView2<f32>) -> Array2<f32> {
    x.dot(&w.t()) + &b
}

fn relu(z: f32) -> f32 {
    z.max(0.)
}

fn relu_prime(z: f32) -> f32 {
    if z > 0. { 1. } else { 0. }
}
