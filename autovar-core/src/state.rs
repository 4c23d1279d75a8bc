use serde::{Deserialize, Serialize};

use crate::error::{Result, TapeError};
use crate::tape::Tape;
use crate::tensor::Tensor;
use crate::variable::{Value, VarId, Variable};

/// Persistable part of a node
///
/// Graph linkage (creator, fan-out counters, epoch tags) is deliberately
/// absent: a restored node is always a leaf with fresh bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableState<T> {
  /// Identity the node had when it was captured
  pub id: u64,
  pub data: T,
  pub grad: T,
  pub seed: T,
  pub tracks_gradient: bool,
}

impl<T: Tensor> Tape<T> {
  /// Capture a node for persistence; sparse values are stored densified
  pub fn snapshot(&self, var: VarId) -> Result<VariableState<T>> {
    let node = self.vars.get(var)?;
    Ok(VariableState {
      id: node.id,
      data: node.data.to_dense(),
      grad: node.grad.clone(),
      seed: node.seed.clone(),
      tracks_gradient: node.tracks_gradient,
    })
  }

  /// Bring a captured node back as a new leaf under a fresh id
  pub fn restore(&mut self, state: VariableState<T>) -> Result<VarId> {
    let expected = state.data.dims();
    for actual in [state.grad.dims(), state.seed.dims()] {
      if actual != expected {
        return Err(TapeError::ShapeMismatch { expected, actual });
      }
    }

    let id = self.vars.next_id();
    let mut node = Variable::with_value(id, Value::Dense(state.data), None);
    node.grad = state.grad;
    node.seed = state.seed;
    node.tracks_gradient = state.tracks_gradient;
    Ok(self.vars.insert(node))
  }
}
