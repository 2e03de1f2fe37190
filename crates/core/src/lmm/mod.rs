mod fit;
mod pls;
mod result;

pub use fit::{minimize, FitOptions};
pub use pls::{PlsCache, PlsEvaluator, PlsInputs, PlsSolution};
pub use result::{FitResult, NamedEffect, RandomEffectBlock, TermCovariance};
