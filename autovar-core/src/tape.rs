use rand::Rng;
use rand_distr::{Distribution, Normal};

use tracing::debug;

use crate::config::TapeConfig;
use crate::error::{Result, TapeError};
use crate::function::{FnId, Function, Functions};
use crate::pool::Pool;
use crate::tensor::{SparseTensor, Tensor};
use crate::variable::{Value, VarId, Variable, Variables};

/// The execution context of a graph.
///
/// A `Tape` owns every node (in an arena addressed by [`VarId`]), every
/// registered function, the shape-keyed [`Pool`] that recycles nodes, the
/// identity counter and the current epoch. Nothing is global: independent
/// tapes can live side by side, one per training run or per worker thread.
pub struct Tape<T: Tensor> {
  pub(crate) vars: Variables<T>,
  pub(crate) functions: Functions<T>,
  pub(crate) pool: Pool,
  pub(crate) epoch: u64,
  config: TapeConfig,
}

impl<T: Tensor> Tape<T> {
  pub fn new() -> Self {
    Self::with_config(TapeConfig::default())
  }

  pub fn with_config(config: TapeConfig) -> Self {
    Self {
      vars: Variables::new(),
      functions: Functions::new(),
      pool: Pool::new(config.pool_capacity),
      epoch: 0,
      config,
    }
  }

  #[inline]
  pub fn config(&self) -> &TapeConfig {
    &self.config
  }

  /// Read-only view of the node arena
  #[inline]
  pub fn vars(&self) -> &Variables<T> {
    &self.vars
  }

  #[inline]
  pub fn pool(&self) -> &Pool {
    &self.pool
  }

  #[inline]
  pub fn epoch(&self) -> u64 {
    self.epoch
  }

  /// Start a new forward/backward cycle; fan-out bookkeeping from earlier
  /// epochs is ignored from now on
  pub fn begin_epoch(&mut self) -> u64 {
    self.epoch += 1;
    self.epoch
  }

  pub fn function_count(&self) -> usize {
    self.functions.len()
  }

  fn insert(&mut self, data: Value<T>, creator: Option<FnId>) -> VarId {
    let id = self.vars.next_id();
    self.vars.insert(Variable::with_value(id, data, creator))
  }

  fn check_creator(&self, f: FnId) -> Result<()> {
    if self.functions.contains(f) {
      Ok(())
    } else {
      Err(TapeError::StaleFunction(f))
    }
  }

  /// Zeroed leaf of the given shape, seed all ones
  pub fn var(&mut self, rows: usize, cols: usize) -> VarId {
    self.insert(Value::Dense(T::alloc(rows, cols)), None)
  }

  /// Leaf with an explicit gradient flag; negative dimensions are taken by
  /// absolute value
  pub fn var_with_grad(&mut self, rows: i64, cols: i64, tracks_gradient: bool) -> VarId {
    let rows = rows.unsigned_abs() as usize;
    let cols = cols.unsigned_abs() as usize;
    let var = self.var(rows, cols);
    if let Ok(node) = self.vars.get_mut(var) {
      node.tracks_gradient = tracks_gradient;
    }
    var
  }

  /// Leaf wrapping an existing tensor
  pub fn var_from(&mut self, data: T) -> VarId {
    self.insert(Value::Dense(data), None)
  }

  pub fn var_from_fn(&mut self, f: FnId, rows: usize, cols: usize) -> Result<VarId> {
    self.check_creator(f)?;
    Ok(self.insert(Value::Dense(T::alloc(rows, cols)), Some(f)))
  }

  pub fn var_from_fn_tensor(&mut self, f: FnId, data: T) -> Result<VarId> {
    self.check_creator(f)?;
    Ok(self.insert(Value::Dense(data), Some(f)))
  }

  /// Sparse one-hot leaf: row `i` has a single one at column `ids[i]`
  ///
  /// Sparse leaves hold categorical indices, so they never track gradients
  pub fn sparse_var(&mut self, ids: &[usize], cols: usize) -> Result<VarId> {
    if let Some((row, &col)) = ids.iter().enumerate().find(|(_, col)| **col >= cols) {
      return Err(TapeError::IndexOutOfRange {
        row,
        col,
        shape: (ids.len(), cols),
      });
    }
    let data = T::Sparse::one_hot(ids, cols)?;
    let var = self.insert(Value::Sparse(data), None);
    self.vars.get_mut(var)?.tracks_gradient = false;
    Ok(var)
  }

  /// Copy construction: a distinct node with the same tensors, flags and
  /// creator
  pub fn copy_var(&mut self, src: VarId) -> Result<VarId> {
    let id = self.vars.next_id();
    let copy = self.vars.get(src)?.duplicate(id);
    Ok(self.vars.insert(copy))
  }

  /// Copy assignment: overwrite `dst` with the contents of `src`
  ///
  /// `dst` is re-stamped with a new id, so the old handle goes stale and the
  /// returned one must be used instead. Registrations on `dst` are kept.
  pub fn assign(&mut self, dst: VarId, src: VarId) -> Result<VarId> {
    self.vars.get(dst)?;
    let id = self.vars.next_id();
    let mut copy = self.vars.get(src)?.duplicate(id);
    let node = self.vars.get_mut(dst)?;
    copy.fan_out.consumers = node.fan_out.consumers;
    *node = copy;
    Ok(VarId::new(dst.slot() as u32, id))
  }

  /// Take a zeroed node of shape (rows, cols) from the pool
  pub fn acquire(&mut self, rows: usize, cols: usize) -> VarId {
    self.pool.acquire(&mut self.vars, rows, cols)
  }

  /// Hand a node back to the pool
  ///
  /// Fails if a live function still lists the node as an input
  pub fn release(&mut self, var: VarId) -> Result<()> {
    self.pool.release(&mut self.vars, var)
  }

  /// Store a function and count one consumer edge on each of its inputs
  ///
  /// The edge counts even if the function's output later stops tracking
  /// gradients. Backward never descends into such an output, so its inputs
  /// wait forever for that contribution and nothing above them receives a
  /// gradient. Mark stop-gradient nodes before building on them, or build the
  /// stopped branch from a separate leaf.
  pub fn register<F>(&mut self, function: F) -> Result<FnId>
  where
    F: Function<T> + 'static,
  {
    for &input in function.inputs() {
      self.vars.get(input)?;
    }
    for &input in function.inputs() {
      self.vars.get_mut(input)?.fan_out.consumers += 1;
    }
    Ok(self.functions.insert(Box::new(function)))
  }

  /// Drop a function, giving up its claim on its inputs; outputs that still
  /// name it as creator behave as leaves afterwards
  pub fn release_function(&mut self, f: FnId) -> Result<()> {
    let function = self.functions.remove(f).ok_or(TapeError::StaleFunction(f))?;
    for &input in function.inputs() {
      if let Ok(node) = self.vars.get_mut(input) {
        node.fan_out.consumers = node.fan_out.consumers.saturating_sub(1);
      }
    }
    Ok(())
  }

  pub fn set_creator(&mut self, var: VarId, f: FnId) -> Result<()> {
    self.check_creator(f)?;
    self.vars.get_mut(var)?.creator = Some(f);
    Ok(())
  }

  pub fn set_name(&mut self, var: VarId, name: impl Into<String>) -> Result<()> {
    self.vars.get_mut(var)?.name = Some(name.into());
    Ok(())
  }

  /// Replace the gradient used to start a backward pass from `var`
  pub fn set_seed(&mut self, var: VarId, seed: T) -> Result<()> {
    let node = self.vars.get_mut(var)?;
    let expected = node.grad.dims();
    let actual = seed.dims();
    if expected != actual {
      return Err(TapeError::ShapeMismatch { expected, actual });
    }
    node.seed = seed;
    Ok(())
  }

  /// Turning tracking off on a node that has a creator prunes that branch
  /// from backward, but the creator's inputs still count the edge as a
  /// pending consumer (see [`Tape::register`])
  pub fn set_tracks_gradient(&mut self, var: VarId, tracks_gradient: bool) -> Result<()> {
    self.vars.get_mut(var)?.tracks_gradient = tracks_gradient;
    Ok(())
  }

  #[inline]
  pub fn get(&self, var: VarId) -> Result<&Variable<T>> {
    self.vars.get(var)
  }

  #[inline]
  pub fn data(&self, var: VarId) -> Result<&Value<T>> {
    self.vars.data(var)
  }

  #[inline]
  pub fn dense(&self, var: VarId) -> Result<&T> {
    self.vars.dense(var)
  }

  /// Mutable dense value, for optimizer updates and data loading
  pub fn dense_mut(&mut self, var: VarId) -> Result<&mut T> {
    self.vars.get_mut(var)?.dense_mut(var)
  }

  #[inline]
  pub fn grad(&self, var: VarId) -> Result<&T> {
    self.vars.grad(var)
  }

  /// Scalar at (0, 0) of the node's value
  pub fn value(&self, var: VarId) -> Result<f32> {
    self.vars.get(var)?.value()
  }

  /// Clear value, gradient, fan-out bookkeeping and the creator link
  pub fn zeros(&mut self, var: VarId) -> Result<()> {
    self.vars.get_mut(var)?.reset();
    Ok(())
  }

  /// Fill the value with ones and clear the gradient
  pub fn ones(&mut self, var: VarId) -> Result<()> {
    let node = self.vars.get_mut(var)?;
    node.dense_mut(var)?.set_all(1.0);
    node.zero_grad();
    Ok(())
  }

  pub fn zero_grad(&mut self, var: VarId) -> Result<()> {
    self.vars.get_mut(var)?.zero_grad();
    Ok(())
  }

  /// Cut the node off from everything upstream of it
  pub fn unchain(&mut self, var: VarId) -> Result<()> {
    self.vars.get_mut(var)?.creator = None;
    Ok(())
  }

  /// Overwrite every element of the value with a draw from N(mean, stddev)
  pub fn randoms<R>(&mut self, var: VarId, mean: f32, stddev: f32, rng: &mut R) -> Result<()>
  where
    R: Rng + ?Sized,
  {
    // Normal::new only rejects a non-finite deviation
    if !(stddev >= 0.0) {
      return Err(TapeError::Distribution(format!(
        "standard deviation {stddev} must be non-negative"
      )));
    }
    let normal = Normal::new(mean, stddev).map_err(|e| TapeError::Distribution(e.to_string()))?;
    let data = self.vars.get_mut(var)?.dense_mut(var)?;
    let (rows, cols) = data.dims();
    for row in 0..rows {
      for col in 0..cols {
        data.set_at(row, col, normal.sample(rng));
      }
    }
    Ok(())
  }

  /// Overwrite the value with a keep-mask: each element is `0.0` with
  /// probability `p` and `1.0` otherwise
  pub fn binominal_randoms<R>(&mut self, var: VarId, p: f32, rng: &mut R) -> Result<()>
  where
    R: Rng + ?Sized,
  {
    if !(0.0..=1.0).contains(&p) {
      return Err(TapeError::Distribution(format!(
        "probability {p} outside [0, 1]"
      )));
    }
    let data = self.vars.get_mut(var)?.dense_mut(var)?;
    let (rows, cols) = data.dims();
    for row in 0..rows {
      for col in 0..cols {
        let keep = if rng.random::<f32>() < p { 0.0 } else { 1.0 };
        data.set_at(row, col, keep);
      }
    }
    Ok(())
  }

  /// Tear down the graph below `root`.
  ///
  /// Every reachable function is released, and every non-leaf node whose last
  /// consumer went away with it is handed back to the pool. Leaves are kept,
  /// as are nodes still consumed by functions outside this graph. Returns the
  /// number of nodes released.
  pub fn release_graph(&mut self, root: VarId) -> Result<usize> {
    self.vars.get(root)?;
    let mut released = 0;
    let mut stack = vec![root];

    while let Some(var) = stack.pop() {
      let Ok(node) = self.vars.get(var) else {
        continue;
      };
      if node.fan_out.consumers > 0 || self.pool.is_free(var) {
        continue;
      }
      let Some(creator) = node.creator else {
        continue;
      };
      if let Some(function) = self.functions.remove(creator) {
        for &input in function.inputs() {
          if let Ok(input_node) = self.vars.get_mut(input) {
            input_node.fan_out.consumers = input_node.fan_out.consumers.saturating_sub(1);
          }
          stack.push(input);
        }
      }
      self.pool.release(&mut self.vars, var)?;
      released += 1;
    }

    debug!(root = ?root, released, "graph released");
    Ok(released)
  }
}

impl<T: Tensor> Default for Tape<T> {
  fn default() -> Self {
    Self::new()
  }
}
