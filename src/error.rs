//! Error type shared by the transforms, the adapters and the samplers.

use thiserror::Error;

/// Everything that can go wrong in this crate.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// `ask` and `tell` were called out of order, or after the sampler finished.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// Two objects that must agree on the number of parameters do not.
    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    /// A setting the current step depends on has not been provided.
    #[error("missing configuration: {0}")]
    MissingConfig(&'static str),

    /// A setting was given a value outside of its valid range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Construction-time validation failed.
    #[error("validation error: {0}")]
    Validation(String),

    /// A numerical quantity became unusable (zero weight mass, NaN, ...).
    #[error("numerical degeneracy: {0}")]
    Degenerate(String),

    /// The optional capability is not implemented by this object.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// The rejection loop in `ask` hit its attempt cap without finding a
    /// point of finite prior density.
    #[error("no proposal with finite prior density after {attempts} attempts")]
    ProposalExhausted { attempts: usize },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Fails with [`Error::DimensionMismatch`] unless `found == expected`.
pub(crate) fn check_dimension(expected: usize, found: usize) -> Result<()> {
    if expected == found {
        Ok(())
    } else {
        Err(Error::DimensionMismatch { expected, found })
    }
}
