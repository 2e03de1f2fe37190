mod builder;
mod covariance;
pub mod design;
mod mapping;
mod random_effects;
mod term;

pub use builder::{MixedModel, MixedModelBuilder};
pub use covariance::{
    block_lambdat, n_template_params, template_matrix, template_param_index, CovarianceBlock,
};
pub use mapping::{FnMapping, LambdaIndex, ThetaMapping};
pub use random_effects::{RandomEffects, RandomTerm, TermInfo};
pub use term::{indicator_transposed, khatri_rao, z_section};
