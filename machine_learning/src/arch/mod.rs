mod architecture;
pub mod loss;
mod model;
mod net;

pub use architecture::{Architecture, DEFAULT_HIDDEN, DEFAULT_REP_DIM};
pub use model::{Model, Output};
pub use net::{
    FC1_BIAS, FC1_WEIGHT, FC2_BIAS, FC2_WEIGHT, FC3_BIAS, FC3_WEIGHT, Net, NetSpec, OFT_R,
};
