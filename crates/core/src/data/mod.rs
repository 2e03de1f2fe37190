mod factor;

pub use factor::FactorColumn;
