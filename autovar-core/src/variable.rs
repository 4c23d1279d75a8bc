use std::mem;

use tracing::trace;

use crate::error::{Result, TapeError};
use crate::function::FnId;
use crate::tensor::{SparseTensor, Tensor};

/// Handle to a node living in a [`Tape`](crate::Tape)
///
/// `slot` locates the physical storage, `id` is the node's identity; once the
/// slot is recycled the old handle stops resolving
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId {
  slot: u32,
  id: u64,
}

impl VarId {
  #[inline(always)]
  pub(crate) fn new(slot: u32, id: u64) -> Self {
    Self { slot, id }
  }

  #[inline(always)]
  pub fn slot(&self) -> usize {
    self.slot as usize
  }

  #[inline(always)]
  pub fn id(&self) -> u64 {
    self.id
  }
}

/// Value held by a node, dense or sparse but never both
#[derive(Debug, Clone)]
pub enum Value<T: Tensor> {
  Dense(T),
  Sparse(T::Sparse),
}

impl<T: Tensor> Value<T> {
  pub fn dims(&self) -> (usize, usize) {
    match self {
      Value::Dense(t) => t.dims(),
      Value::Sparse(s) => s.dims(),
    }
  }

  #[inline]
  pub fn is_sparse(&self) -> bool {
    matches!(self, Value::Sparse(_))
  }

  pub fn as_dense(&self) -> Option<&T> {
    match self {
      Value::Dense(t) => Some(t),
      Value::Sparse(_) => None,
    }
  }

  pub fn as_sparse(&self) -> Option<&T::Sparse> {
    match self {
      Value::Dense(_) => None,
      Value::Sparse(s) => Some(s),
    }
  }

  /// Dense copy of the value, converting sparse data if needed
  pub fn to_dense(&self) -> T {
    match self {
      Value::Dense(t) => t.clone(),
      Value::Sparse(s) => s.to_dense(),
    }
  }

  fn get_at(&self, row: usize, col: usize) -> f32 {
    match self {
      Value::Dense(t) => t.get_at(row, col),
      Value::Sparse(s) => s.get_at(row, col),
    }
  }
}

/// Per-epoch fan-out bookkeeping
///
/// `consumers` counts live function input edges and is owned by registration;
/// the rest is armed lazily the first time a backward pass reaches the node in
/// a given epoch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct FanOut {
  pub(crate) consumers: u32,
  pub(crate) pending_consumers: u32,
  pub(crate) epoch_tag: Option<u64>,
  pub(crate) is_final_contribution: bool,
}

impl FanOut {
  #[inline]
  pub(crate) fn arm(&mut self, epoch: u64) {
    self.epoch_tag = Some(epoch);
    self.pending_consumers = self.consumers;
    self.is_final_contribution = false;
  }

  /// Forget epoch state; registrations are left alone
  #[inline]
  pub(crate) fn reset(&mut self) {
    self.pending_consumers = 0;
    self.epoch_tag = None;
    self.is_final_contribution = false;
  }

  /// Record one arriving contribution, returning true when the caller is the
  /// one that must invoke the creator
  pub(crate) fn contribute(&mut self, epoch: u64) -> bool {
    if self.epoch_tag != Some(epoch) {
      self.arm(epoch);
    }
    self.pending_consumers = self.pending_consumers.saturating_sub(1);
    if self.pending_consumers > 0 || self.is_final_contribution {
      return false;
    }
    self.is_final_contribution = true;
    true
  }
}

/// A node in the computation graph
#[derive(Debug)]
pub struct Variable<T: Tensor> {
  pub(crate) id: u64,
  pub(crate) data: Value<T>,
  pub(crate) grad: T,
  pub(crate) seed: T,
  pub(crate) creator: Option<FnId>,
  pub(crate) tracks_gradient: bool,
  pub(crate) name: Option<String>,
  pub(crate) fan_out: FanOut,
}

impl<T: Tensor> Variable<T> {
  /// Wrap an existing value, deriving gradient and seed from its extent
  pub(crate) fn with_value(id: u64, data: Value<T>, creator: Option<FnId>) -> Self {
    let (rows, cols) = data.dims();
    Self {
      id,
      data,
      grad: T::alloc(rows, cols),
      seed: T::alloc_ones(rows, cols),
      creator,
      tracks_gradient: true,
      name: None,
      fan_out: FanOut::default(),
    }
  }

  pub(crate) fn zeroed(id: u64, rows: usize, cols: usize) -> Self {
    Self::with_value(id, Value::Dense(T::alloc(rows, cols)), None)
  }

  /// Copy construction: same tensors, flags and creator under a new identity
  pub(crate) fn duplicate(&self, id: u64) -> Self {
    Self {
      id,
      data: self.data.clone(),
      grad: self.grad.clone(),
      seed: self.seed.clone(),
      creator: self.creator,
      tracks_gradient: self.tracks_gradient,
      name: self.name.clone(),
      fan_out: FanOut::default(),
    }
  }

  #[inline]
  pub fn id(&self) -> u64 {
    self.id
  }

  #[inline]
  pub fn data(&self) -> &Value<T> {
    &self.data
  }

  #[inline]
  pub fn grad(&self) -> &T {
    &self.grad
  }

  #[inline]
  pub fn seed(&self) -> &T {
    &self.seed
  }

  #[inline]
  pub fn creator(&self) -> Option<FnId> {
    self.creator
  }

  #[inline]
  pub fn is_leaf(&self) -> bool {
    self.creator.is_none()
  }

  #[inline]
  pub fn tracks_gradient(&self) -> bool {
    self.tracks_gradient
  }

  #[inline]
  pub fn is_sparse(&self) -> bool {
    self.data.is_sparse()
  }

  pub fn name(&self) -> Option<&str> {
    self.name.as_deref()
  }

  pub fn dims(&self) -> (usize, usize) {
    self.data.dims()
  }

  /// Live function input edges pointing at this node
  pub fn consumers(&self) -> u32 {
    self.fan_out.consumers
  }

  /// Contributions still owed in the epoch this node was last armed for
  pub fn pending_consumers(&self) -> u32 {
    self.fan_out.pending_consumers
  }

  pub fn epoch_tag(&self) -> Option<u64> {
    self.fan_out.epoch_tag
  }

  pub fn is_final_contribution(&self) -> bool {
    self.fan_out.is_final_contribution
  }

  /// Scalar at (0, 0), intended for loss nodes
  pub fn value(&self) -> Result<f32> {
    let shape = self.data.dims();
    if shape.0 == 0 || shape.1 == 0 {
      return Err(TapeError::IndexOutOfRange {
        row: 0,
        col: 0,
        shape,
      });
    }
    Ok(self.data.get_at(0, 0))
  }

  /// Clear value and gradient, epoch bookkeeping and the creator link
  pub(crate) fn reset(&mut self) {
    if let Value::Dense(data) = &mut self.data {
      data.set_all(0.0);
    }
    self.grad.set_all(0.0);
    self.fan_out.reset();
    self.creator = None;
  }

  /// Reset for a new owner: everything `reset` clears, plus the flags and
  /// seed a fresh node starts with, under a new identity
  pub(crate) fn recycle(&mut self, id: u64) {
    self.reset();
    let (rows, cols) = self.data.dims();
    self.seed = T::alloc_ones(rows, cols);
    self.tracks_gradient = true;
    self.name = None;
    self.id = id;
  }

  pub(crate) fn zero_grad(&mut self) {
    self.grad.set_all(0.0);
  }

  /// Start a backward pass from this node
  pub(crate) fn seed_grad(&mut self) {
    self.grad.clone_from(&self.seed);
  }

  /// Temporarily move the gradient out so it can be handed to the creator
  /// while the node arena is borrowed mutably
  pub(crate) fn take_grad(&mut self) -> T {
    mem::replace(&mut self.grad, T::alloc(0, 0))
  }

  pub(crate) fn restore_grad(&mut self, grad: T) {
    self.grad = grad;
  }

  pub(crate) fn dense_mut(&mut self, var: VarId) -> Result<&mut T> {
    match &mut self.data {
      Value::Dense(t) => Ok(t),
      Value::Sparse(_) => Err(TapeError::SparseValue(var)),
    }
  }
}

/// Arena of nodes, indexed by [`VarId`]
///
/// Also owns the identity counter; ids are strictly increasing for the
/// lifetime of the arena
#[derive(Debug)]
pub struct Variables<T: Tensor> {
  slots: Vec<Option<Variable<T>>>,
  vacant: Vec<u32>,
  next_id: u64,
}

impl<T: Tensor> Variables<T> {
  pub(crate) fn new() -> Self {
    Self {
      slots: Vec::new(),
      vacant: Vec::new(),
      next_id: 0,
    }
  }

  #[inline]
  pub(crate) fn next_id(&mut self) -> u64 {
    let id = self.next_id;
    self.next_id += 1;
    id
  }

  pub(crate) fn insert(&mut self, var: Variable<T>) -> VarId {
    let id = var.id;
    match self.vacant.pop() {
      Some(slot) => {
        self.slots[slot as usize] = Some(var);
        VarId::new(slot, id)
      }
      None => {
        let slot = self.slots.len() as u32;
        self.slots.push(Some(var));
        VarId::new(slot, id)
      }
    }
  }

  pub(crate) fn remove(&mut self, var: VarId) -> Result<Variable<T>> {
    self.get(var)?;
    self.vacant.push(var.slot);
    trace!(slot = var.slot, id = var.id, "slot vacated");
    self.slots[var.slot()].take().ok_or(TapeError::StaleVariable(var))
  }

  /// Occupant of a slot regardless of which identity it currently carries
  pub(crate) fn slot_mut(&mut self, slot: u32) -> Option<&mut Variable<T>> {
    self.slots.get_mut(slot as usize).and_then(Option::as_mut)
  }

  pub(crate) fn slot(&self, slot: u32) -> Option<&Variable<T>> {
    self.slots.get(slot as usize).and_then(Option::as_ref)
  }

  pub fn contains(&self, var: VarId) -> bool {
    self.get(var).is_ok()
  }

  pub fn get(&self, var: VarId) -> Result<&Variable<T>> {
    match self.slot(var.slot) {
      Some(v) if v.id == var.id => Ok(v),
      _ => Err(TapeError::StaleVariable(var)),
    }
  }

  pub fn get_mut(&mut self, var: VarId) -> Result<&mut Variable<T>> {
    match self.slot_mut(var.slot) {
      Some(v) if v.id == var.id => Ok(v),
      _ => Err(TapeError::StaleVariable(var)),
    }
  }

  pub fn data(&self, var: VarId) -> Result<&Value<T>> {
    Ok(&self.get(var)?.data)
  }

  /// Dense value of a node, failing on sparse nodes
  pub fn dense(&self, var: VarId) -> Result<&T> {
    self
      .get(var)?
      .data
      .as_dense()
      .ok_or(TapeError::SparseValue(var))
  }

  pub fn grad(&self, var: VarId) -> Result<&T> {
    Ok(&self.get(var)?.grad)
  }

  /// Whether a function should bother computing a contribution for `var`
  pub fn wants_grad(&self, var: VarId) -> Result<bool> {
    Ok(self.get(var)?.tracks_gradient)
  }

  /// Add a local-derivative contribution into the gradient of `var`
  ///
  /// Nodes that do not track gradients are left untouched
  pub fn accumulate_grad(&mut self, var: VarId, contribution: &T) -> Result<()> {
    let node = self.get_mut(var)?;
    if !node.tracks_gradient {
      return Ok(());
    }
    let expected = node.grad.dims();
    let actual = contribution.dims();
    if expected != actual {
      return Err(TapeError::ShapeMismatch { expected, actual });
    }
    node.grad.accumulate(contribution);
    Ok(())
  }

  /// Number of occupied slots
  pub fn len(&self) -> usize {
    self.slots.len() - self.vacant.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
