use thiserror::Error;

use crate::{FnId, VarId};

/// Errors raised by tape, pool and backward operations
#[derive(Debug, Error, PartialEq)]
pub enum TapeError {
  /// The handle refers to a slot that was released, evicted or reused
  #[error("stale variable handle {0:?}")]
  StaleVariable(VarId),

  #[error("stale function handle {0:?}")]
  StaleFunction(FnId),

  /// Gradient or value tensors disagree on their extent
  #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
  ShapeMismatch {
    expected: (usize, usize),
    actual: (usize, usize),
  },

  /// A dense tensor was required but the variable holds sparse data
  #[error("variable {0:?} holds sparse data")]
  SparseValue(VarId),

  #[error("index ({row}, {col}) out of range for shape {shape:?}")]
  IndexOutOfRange {
    row: usize,
    col: usize,
    shape: (usize, usize),
  },

  /// Releasing a node that a live function still lists as an input
  #[error("variable {var:?} is still consumed by {consumers} function input(s)")]
  StillConsumed { var: VarId, consumers: u32 },

  #[error("invalid distribution parameters: {0}")]
  Distribution(String),

  #[error("backend failure: {0}")]
  Backend(String),
}

pub type Result<T> = std::result::Result<T, TapeError>;
