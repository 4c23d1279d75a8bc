//!
//! Backend contract consumed by the core
//!
//! The core never performs arithmetic itself beyond what is listed here; the
//! concrete kernels live with the backend and with the functions built on it.
//!

use std::fmt::Debug;

/// A dense, row/column addressed matrix of `f32`
pub trait Tensor: Clone + Debug {
  /// Sparse companion type used for one-hot (categorical) inputs
  type Sparse: SparseTensor<Dense = Self>;

  /// Allocate a zero-filled tensor
  fn alloc(rows: usize, cols: usize) -> Self;

  fn alloc_ones(rows: usize, cols: usize) -> Self;

  /// (rows, cols)
  fn dims(&self) -> (usize, usize);

  fn set_all(&mut self, value: f32);

  /// Multiply every element by a constant in place
  fn scale_mut(&mut self, factor: f32);

  /// Caller guarantees `row < rows` and `col < cols`
  fn get_at(&self, row: usize, col: usize) -> f32;

  fn set_at(&mut self, row: usize, col: usize, value: f32);

  /// Elementwise `self += other`; shapes are checked by the caller
  fn accumulate(&mut self, other: &Self);
}

/// A sparse matrix that can represent one-hot rows
pub trait SparseTensor: Clone + Debug {
  type Dense;

  /// Build `ids.len()` rows with a single `1.0` at column `ids[row]`; the caller
  /// guarantees every id is below `cols`
  fn one_hot(ids: &[usize], cols: usize) -> crate::Result<Self>;

  fn dims(&self) -> (usize, usize);

  fn get_at(&self, row: usize, col: usize) -> f32;

  fn to_dense(&self) -> Self::Dense;
}
