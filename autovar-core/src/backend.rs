//!
//! nalgebra backed tensors: `DMatrix<f32>` dense, `CsrMatrix<f32>` sparse
//!

use nalgebra::DMatrix;
use nalgebra_sparse::CsrMatrix;

use crate::error::{Result, TapeError};
use crate::tensor::{SparseTensor, Tensor};

impl Tensor for DMatrix<f32> {
  type Sparse = CsrMatrix<f32>;

  #[inline]
  fn alloc(rows: usize, cols: usize) -> Self {
    DMatrix::zeros(rows, cols)
  }

  #[inline]
  fn alloc_ones(rows: usize, cols: usize) -> Self {
    DMatrix::from_element(rows, cols, 1.0)
  }

  #[inline]
  fn dims(&self) -> (usize, usize) {
    (self.nrows(), self.ncols())
  }

  #[inline]
  fn set_all(&mut self, value: f32) {
    self.fill(value);
  }

  #[inline]
  fn scale_mut(&mut self, factor: f32) {
    *self *= factor;
  }

  #[inline]
  fn get_at(&self, row: usize, col: usize) -> f32 {
    self[(row, col)]
  }

  #[inline]
  fn set_at(&mut self, row: usize, col: usize, value: f32) {
    self[(row, col)] = value;
  }

  #[inline]
  fn accumulate(&mut self, other: &Self) {
    *self += other;
  }
}

impl SparseTensor for CsrMatrix<f32> {
  type Dense = DMatrix<f32>;

  /// One stored value per row, so the row offsets are just 0..=n
  fn one_hot(ids: &[usize], cols: usize) -> Result<Self> {
    let rows = ids.len();
    CsrMatrix::try_from_csr_data(
      rows,
      cols,
      (0..=rows).collect(),
      ids.to_vec(),
      vec![1.0; rows],
    )
    .map_err(|e| TapeError::Backend(e.to_string()))
  }

  #[inline]
  fn dims(&self) -> (usize, usize) {
    (self.nrows(), self.ncols())
  }

  fn get_at(&self, row: usize, col: usize) -> f32 {
    self
      .get_entry(row, col)
      .map(|entry| entry.into_value())
      .unwrap_or(0.0)
  }

  fn to_dense(&self) -> DMatrix<f32> {
    DMatrix::from(self)
  }
}
