use crate::core::geometry::cell::DegenerateCellError;
use thiserror::Error;

/// Errors detected while building a search structure.
///
/// All of these are reported synchronously from `prepare`; no partially
/// usable structure is ever returned alongside an error.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PrepareError {
    #[error("cutoff radius must be positive and finite (got {cutoff})")]
    InvalidCutoff { cutoff: f64 },

    #[error("requested neighbor count {k} is outside the supported range [1, {max_k}]")]
    InvalidK { k: usize, max_k: usize },

    #[error("particle set is empty")]
    EmptyParticleSet,

    #[error(transparent)]
    DegenerateCell(#[from] DegenerateCellError),

    #[error("construction was cancelled before the search structure was complete")]
    Cancelled,
}

/// Errors detected while issuing a query against a prepared structure.
///
/// A failed query leaves the structure fully usable for subsequent calls.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueryError {
    #[error("particle index {index} is out of range for {count} particles")]
    IndexOutOfRange { index: usize, count: usize },
}
