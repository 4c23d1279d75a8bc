//! Minimal host tensors and a recording function for unit tests

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Result;
use crate::function::Function;
use crate::tensor::{SparseTensor, Tensor};
use crate::variable::{VarId, Variables};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Grid {
  rows: usize,
  cols: usize,
  data: Vec<f32>,
}

impl Grid {
  pub(crate) fn filled(rows: usize, cols: usize, value: f32) -> Self {
    Self {
      rows,
      cols,
      data: vec![value; rows * cols],
    }
  }
}

impl Tensor for Grid {
  type Sparse = OneHot;

  fn alloc(rows: usize, cols: usize) -> Self {
    Self::filled(rows, cols, 0.0)
  }

  fn alloc_ones(rows: usize, cols: usize) -> Self {
    Self::filled(rows, cols, 1.0)
  }

  fn dims(&self) -> (usize, usize) {
    (self.rows, self.cols)
  }

  fn set_all(&mut self, value: f32) {
    self.data.iter_mut().for_each(|x| *x = value);
  }

  fn scale_mut(&mut self, factor: f32) {
    self.data.iter_mut().for_each(|x| *x *= factor);
  }

  fn get_at(&self, row: usize, col: usize) -> f32 {
    self.data[row * self.cols + col]
  }

  fn set_at(&mut self, row: usize, col: usize, value: f32) {
    self.data[row * self.cols + col] = value;
  }

  fn accumulate(&mut self, other: &Self) {
    for (x, y) in self.data.iter_mut().zip(&other.data) {
      *x += y;
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OneHot {
  ids: Vec<usize>,
  cols: usize,
}

impl SparseTensor for OneHot {
  type Dense = Grid;

  fn one_hot(ids: &[usize], cols: usize) -> Result<Self> {
    Ok(Self {
      ids: ids.to_vec(),
      cols,
    })
  }

  fn dims(&self) -> (usize, usize) {
    (self.ids.len(), self.cols)
  }

  fn get_at(&self, row: usize, col: usize) -> f32 {
    if self.ids[row] == col {
      1.0
    } else {
      0.0
    }
  }

  fn to_dense(&self) -> Grid {
    let mut dense = Grid::alloc(self.ids.len(), self.cols);
    for (row, &col) in self.ids.iter().enumerate() {
      dense.set_at(row, col, 1.0);
    }
    dense
  }
}

pub(crate) type Calls = Rc<RefCell<Vec<Grid>>>;

/// Passes the upstream gradient unchanged to every input and records it
pub(crate) struct Recorder {
  inputs: Vec<VarId>,
  calls: Calls,
}

impl Recorder {
  pub(crate) fn new(inputs: Vec<VarId>) -> (Self, Calls) {
    let calls = Calls::default();
    (
      Self {
        inputs,
        calls: calls.clone(),
      },
      calls,
    )
  }
}

impl Function<Grid> for Recorder {
  fn inputs(&self) -> &[VarId] {
    &self.inputs
  }

  fn backward(&self, upstream: &Grid, vars: &mut Variables<Grid>) -> Result<()> {
    self.calls.borrow_mut().push(upstream.clone());
    for &input in &self.inputs {
      if vars.wants_grad(input)? {
        vars.accumulate_grad(input, upstream)?;
      }
    }
    Ok(())
  }

  fn name(&self) -> &'static str {
    "recorder"
  }
}
