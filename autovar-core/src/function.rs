use crate::error::Result;
use crate::tensor::Tensor;
use crate::variable::{VarId, Variables};

/// Handle to a function registered on a [`Tape`](crate::Tape)
///
/// Nodes refer to their creator through this handle only; it carries no
/// ownership, and once the function is released the handle simply stops
/// resolving
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FnId {
  slot: u32,
  generation: u32,
}

impl FnId {
  #[inline(always)]
  pub fn slot(&self) -> usize {
    self.slot as usize
  }
}

/// The operator side of the graph.
///
/// A function holds the handles of its inputs, in order, and knows how to push
/// a gradient arriving at its output back into those inputs. Concrete
/// functions (add, matmul, activations...) live with the tensor backend.
pub trait Function<T: Tensor> {
  /// Ordered input handles; a node may appear more than once
  fn inputs(&self) -> &[VarId];

  /// Deposit local-derivative contributions into each input's gradient,
  /// typically via [`Variables::accumulate_grad`]
  ///
  /// Called at most once per epoch for a given output, after every
  /// contribution to that output has arrived
  fn backward(&self, upstream: &T, vars: &mut Variables<T>) -> Result<()>;

  /// Label used in traces
  fn name(&self) -> &'static str {
    "function"
  }
}

struct FnSlot<T: Tensor> {
  generation: u32,
  function: Option<Box<dyn Function<T>>>,
}

/// Arena of registered functions
pub(crate) struct Functions<T: Tensor> {
  slots: Vec<FnSlot<T>>,
  vacant: Vec<u32>,
}

impl<T: Tensor> Functions<T> {
  pub(crate) fn new() -> Self {
    Self {
      slots: Vec::new(),
      vacant: Vec::new(),
    }
  }

  pub(crate) fn insert(&mut self, function: Box<dyn Function<T>>) -> FnId {
    match self.vacant.pop() {
      Some(slot) => {
        let entry = &mut self.slots[slot as usize];
        entry.generation += 1;
        entry.function = Some(function);
        FnId {
          slot,
          generation: entry.generation,
        }
      }
      None => {
        let slot = self.slots.len() as u32;
        self.slots.push(FnSlot {
          generation: 0,
          function: Some(function),
        });
        FnId {
          slot,
          generation: 0,
        }
      }
    }
  }

  pub(crate) fn get(&self, id: FnId) -> Option<&dyn Function<T>> {
    self
      .slots
      .get(id.slot())
      .filter(|entry| entry.generation == id.generation)
      .and_then(|entry| entry.function.as_deref())
  }

  pub(crate) fn contains(&self, id: FnId) -> bool {
    self.get(id).is_some()
  }

  pub(crate) fn remove(&mut self, id: FnId) -> Option<Box<dyn Function<T>>> {
    let entry = self
      .slots
      .get_mut(id.slot())
      .filter(|entry| entry.generation == id.generation)?;
    let function = entry.function.take()?;
    self.vacant.push(id.slot);
    Some(function)
  }

  pub(crate) fn len(&self) -> usize {
    self.slots.len() - self.vacant.len()
  }
}
