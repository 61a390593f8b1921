//! Likelihood-free Bayesian inference with an adaptive ABC-SMC sampler, and parameter
//! transformations between a bounded model space and an unconstrained search space.

pub mod abc_smc;
pub mod controller;
pub mod distributions;
pub mod error;
pub mod math;
pub mod transformation;
pub mod transformed;

pub use error::{Error, Result};
