//!
//! # autovar-matrix
//!
//! Dense and sparse tensor backend for the differentiation core, built on
//! nalgebra and nalgebra-sparse, plus the everyday functions (add, matmul,
//! activations, embedding lookup) expressed against the core's `Function`
//! contract.
//!

use nalgebra::DMatrix;
use nalgebra_sparse::CsrMatrix;

use smallvec::{smallvec, SmallVec};

use lib_autovar_core::{FnId, Function, Result, TapeError, Tensor, Value, VarId, Variables};

pub type Matrix = DMatrix<f32>;

pub type SparseMatrix = CsrMatrix<f32>;

pub type Tape = lib_autovar_core::Tape<Matrix>;

/// Sparse x dense
pub fn sparse_dense_dot(a: &SparseMatrix, b: &Matrix) -> Matrix {
  a * b
}

/// Dense x sparse, through `(Bᵀ·Aᵀ)ᵀ` since only sparse-left products exist
pub fn dense_sparse_dot(a: &Matrix, b: &SparseMatrix) -> Matrix {
  (&b.transpose() * &a.transpose()).transpose()
}

pub fn sparse_sparse_dot(a: &SparseMatrix, b: &SparseMatrix) -> SparseMatrix {
  a * b
}

pub fn sparse_transpose(a: &SparseMatrix) -> SparseMatrix {
  a.transpose()
}

pub fn sparse_from_dense(a: &Matrix) -> SparseMatrix {
  CsrMatrix::from(a)
}

/// Product of a value (dense or sparse) with a dense right-hand side
fn value_dot(a: &Value<Matrix>, b: &Matrix) -> Matrix {
  match a {
    Value::Dense(a) => a * b,
    Value::Sparse(a) => sparse_dense_dot(a, b),
  }
}

/// Gradient contributions computed before any of them is written
type Contributions = SmallVec<[(VarId, Matrix); 2]>;

/// Local derivative rule of a function
trait Pullback {
  fn pullback(&self, upstream: &Matrix, vars: &Variables<Matrix>) -> Result<Contributions>;
}

macro_rules! function {
  ($name:ident, $label:literal) => {
    impl Function<Matrix> for $name {
      fn inputs(&self) -> &[VarId] {
        &self.inputs
      }

      fn backward(&self, upstream: &Matrix, vars: &mut Variables<Matrix>) -> Result<()> {
        // read phase, then write phase, so inputs can be read while computing
        for (var, grad) in self.pullback(upstream, vars)? {
          vars.accumulate_grad(var, &grad)?;
        }
        Ok(())
      }

      fn name(&self) -> &'static str {
        $label
      }
    }
  };
}

/// Elementwise a + b
pub struct Add {
  inputs: [VarId; 2],
}

impl Pullback for Add {
  fn pullback(&self, upstream: &Matrix, vars: &Variables<Matrix>) -> Result<Contributions> {
    let [a, b] = self.inputs;
    let mut grads = Contributions::new();
    if vars.wants_grad(a)? {
      grads.push((a, upstream.clone()));
    }
    if vars.wants_grad(b)? {
      grads.push((b, upstream.clone()));
    }
    Ok(grads)
  }
}

function!(Add, "add");

/// Elementwise a - b
pub struct Sub {
  inputs: [VarId; 2],
}

impl Pullback for Sub {
  fn pullback(&self, upstream: &Matrix, vars: &Variables<Matrix>) -> Result<Contributions> {
    let [a, b] = self.inputs;
    let mut grads = Contributions::new();
    if vars.wants_grad(a)? {
      grads.push((a, upstream.clone()));
    }
    if vars.wants_grad(b)? {
      grads.push((b, -upstream));
    }
    Ok(grads)
  }
}

function!(Sub, "sub");

/// Matrix product a · b
pub struct MatMul {
  inputs: [VarId; 2],
}

impl Pullback for MatMul {
  fn pullback(&self, upstream: &Matrix, vars: &Variables<Matrix>) -> Result<Contributions> {
    let [a, b] = self.inputs;
    let mut grads = Contributions::new();
    if vars.wants_grad(a)? {
      grads.push((a, upstream * vars.dense(b)?.transpose()));
    }
    if vars.wants_grad(b)? {
      grads.push((b, vars.dense(a)?.transpose() * upstream));
    }
    Ok(grads)
  }
}

function!(MatMul, "matmul");

/// Elementwise a ∘ b
pub struct Hadamard {
  inputs: [VarId; 2],
}

impl Pullback for Hadamard {
  fn pullback(&self, upstream: &Matrix, vars: &Variables<Matrix>) -> Result<Contributions> {
    let [a, b] = self.inputs;
    let mut grads = Contributions::new();
    if vars.wants_grad(a)? {
      grads.push((a, upstream.component_mul(vars.dense(b)?)));
    }
    if vars.wants_grad(b)? {
      grads.push((b, upstream.component_mul(vars.dense(a)?)));
    }
    Ok(grads)
  }
}

function!(Hadamard, "hadamard");

pub struct Sin {
  inputs: [VarId; 1],
}

impl Pullback for Sin {
  fn pullback(&self, upstream: &Matrix, vars: &Variables<Matrix>) -> Result<Contributions> {
    let [a] = self.inputs;
    if !vars.wants_grad(a)? {
      return Ok(Contributions::new());
    }
    let cos = vars.dense(a)?.map(f32::cos);
    Ok(smallvec![(a, upstream.component_mul(&cos))])
  }
}

function!(Sin, "sin");

/// Natural logarithm
pub struct Log {
  inputs: [VarId; 1],
}

impl Pullback for Log {
  fn pullback(&self, upstream: &Matrix, vars: &Variables<Matrix>) -> Result<Contributions> {
    let [a] = self.inputs;
    if !vars.wants_grad(a)? {
      return Ok(Contributions::new());
    }
    Ok(smallvec![(a, upstream.component_div(vars.dense(a)?))])
  }
}

function!(Log, "log");

pub struct MulScalar {
  inputs: [VarId; 1],
  factor: f32,
}

impl Pullback for MulScalar {
  fn pullback(&self, upstream: &Matrix, vars: &Variables<Matrix>) -> Result<Contributions> {
    let [a] = self.inputs;
    if !vars.wants_grad(a)? {
      return Ok(Contributions::new());
    }
    let mut grad = upstream.clone();
    Tensor::scale_mut(&mut grad, self.factor);
    Ok(smallvec![(a, grad)])
  }
}

function!(MulScalar, "mul_scalar");

/// Row lookup: one-hot ids (usually sparse) times a dense weight
///
/// The ids never receive a gradient
pub struct Embed {
  inputs: [VarId; 2],
}

impl Pullback for Embed {
  fn pullback(&self, upstream: &Matrix, vars: &Variables<Matrix>) -> Result<Contributions> {
    let [ids, weight] = self.inputs;
    if !vars.wants_grad(weight)? {
      return Ok(Contributions::new());
    }
    let grad = match vars.data(ids)? {
      Value::Dense(ids) => ids.transpose() * upstream,
      Value::Sparse(ids) => sparse_dense_dot(&sparse_transpose(ids), upstream),
    };
    Ok(smallvec![(weight, grad)])
  }
}

function!(Embed, "embed");

fn same_shape(a: &Matrix, b: &Matrix) -> Result<()> {
  if a.shape() != b.shape() {
    return Err(TapeError::ShapeMismatch {
      expected: a.shape(),
      actual: b.shape(),
    });
  }
  Ok(())
}

/// Inner dimensions of a product must agree
fn chains(left: (usize, usize), right: &Matrix) -> Result<()> {
  if left.1 != right.nrows() {
    return Err(TapeError::ShapeMismatch {
      expected: (left.1, right.ncols()),
      actual: right.shape(),
    });
  }
  Ok(())
}

/// Register `function`, take an output node of the value's shape from the
/// pool and stamp the function as its creator
fn emit<F>(tape: &mut Tape, function: F, value: Matrix) -> Result<VarId>
where
  F: Function<Matrix> + 'static,
{
  let f: FnId = tape.register(function)?;
  let out = tape.acquire(value.nrows(), value.ncols());
  tape.dense_mut(out)?.copy_from(&value);
  tape.set_creator(out, f)?;
  Ok(out)
}

/// Extension trait providing graph-building operations on a matrix tape
///
/// Every output comes from the tape's pool and has its function as creator
pub trait TapeExt {
  /// Element-wise addition
  fn add(&mut self, a: VarId, b: VarId) -> Result<VarId>;
  /// Element-wise subtraction
  fn sub(&mut self, a: VarId, b: VarId) -> Result<VarId>;
  /// Matrix multiplication
  fn matmul(&mut self, a: VarId, b: VarId) -> Result<VarId>;
  /// Element-wise multiplication
  fn hadamard(&mut self, a: VarId, b: VarId) -> Result<VarId>;
  fn sin(&mut self, a: VarId) -> Result<VarId>;
  fn log(&mut self, a: VarId) -> Result<VarId>;
  /// Multiply all elements by a constant
  fn mul_scalar(&mut self, a: VarId, factor: f32) -> Result<VarId>;
  /// Select rows of `weight` by the one-hot rows of `ids`
  fn embed(&mut self, ids: VarId, weight: VarId) -> Result<VarId>;
}

impl TapeExt for Tape {
  fn add(&mut self, a: VarId, b: VarId) -> Result<VarId> {
    let (x, y) = (self.dense(a)?, self.dense(b)?);
    same_shape(x, y)?;
    let value = x + y;
    emit(self, Add { inputs: [a, b] }, value)
  }

  fn sub(&mut self, a: VarId, b: VarId) -> Result<VarId> {
    let (x, y) = (self.dense(a)?, self.dense(b)?);
    same_shape(x, y)?;
    let value = x - y;
    emit(self, Sub { inputs: [a, b] }, value)
  }

  fn matmul(&mut self, a: VarId, b: VarId) -> Result<VarId> {
    let (x, y) = (self.dense(a)?, self.dense(b)?);
    chains(x.shape(), y)?;
    let value = x * y;
    emit(self, MatMul { inputs: [a, b] }, value)
  }

  fn hadamard(&mut self, a: VarId, b: VarId) -> Result<VarId> {
    let (x, y) = (self.dense(a)?, self.dense(b)?);
    same_shape(x, y)?;
    let value = x.component_mul(y);
    emit(self, Hadamard { inputs: [a, b] }, value)
  }

  fn sin(&mut self, a: VarId) -> Result<VarId> {
    let value = self.dense(a)?.map(f32::sin);
    emit(self, Sin { inputs: [a] }, value)
  }

  fn log(&mut self, a: VarId) -> Result<VarId> {
    let value = self.dense(a)?.map(f32::ln);
    emit(self, Log { inputs: [a] }, value)
  }

  fn mul_scalar(&mut self, a: VarId, factor: f32) -> Result<VarId> {
    let value = self.dense(a)? * factor;
    emit(self, MulScalar { inputs: [a], factor }, value)
  }

  fn embed(&mut self, ids: VarId, weight: VarId) -> Result<VarId> {
    let (lookup, w) = (self.data(ids)?, self.dense(weight)?);
    chains(lookup.dims(), w)?;
    let value = value_dot(lookup, w);
    emit(self, Embed { inputs: [ids, weight] }, value)
  }
}
