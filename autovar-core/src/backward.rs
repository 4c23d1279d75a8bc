//!
//! Reverse traversal of the creator graph
//!
//! The walk is a depth first pass from the root along creator -> inputs
//! edges. A node's creator runs once every consumer edge counted against the
//! node has delivered its contribution in the current epoch, and never more
//! than once per epoch.
//!

use bit_set::BitSet;

use tracing::{debug, trace};

use crate::error::{Result, TapeError};
use crate::function::FnId;
use crate::tape::Tape;
use crate::tensor::Tensor;
use crate::variable::VarId;

impl<T: Tensor> Tape<T> {
  /// Seed the gradient of `root` and propagate it to everything upstream
  pub fn backward(&mut self, root: VarId) -> Result<()> {
    self.vars.get_mut(root)?.seed_grad();

    // linear dfs, inputs pushed in reverse so the first input is walked first
    let mut stack = Vec::with_capacity(64);
    stack.push(root);
    while let Some(var) = stack.pop() {
      if let Some(creator) = self.arrive(var)? {
        self.propagate(var, creator, &mut stack)?;
      }
    }
    Ok(())
  }

  /// Register one contribution arriving at `var`, returning its creator if
  /// this arrival is the one that completes the fan-in
  fn arrive(&mut self, var: VarId) -> Result<Option<FnId>> {
    let epoch = self.epoch;
    let node = self.vars.get_mut(var)?;

    // leaves, cut nodes and nodes whose creator was released end the walk
    let creator = match node.creator {
      Some(creator) if self.functions.contains(creator) => creator,
      _ => return Ok(None),
    };

    if node.fan_out.contribute(epoch) {
      return Ok(Some(creator));
    }
    if node.fan_out.pending_consumers > 0 {
      debug!(
        var = ?var,
        name = node.name.as_deref().unwrap_or_default(),
        pending = node.fan_out.pending_consumers,
        "deferring until remaining consumers contribute"
      );
    }
    Ok(None)
  }

  fn propagate(&mut self, var: VarId, creator: FnId, stack: &mut Vec<VarId>) -> Result<()> {
    let function = self
      .functions
      .get(creator)
      .ok_or(TapeError::StaleFunction(creator))?;
    let name = self.vars.get(var)?.name.as_deref().unwrap_or_default();
    trace!(var = ?var, name, function = function.name(), "invoking creator");

    let upstream = self.vars.get_mut(var)?.take_grad();
    let result = function.backward(&upstream, &mut self.vars);
    self.vars.get_mut(var)?.restore_grad(upstream);
    result?;

    for &input in function.inputs().iter().rev() {
      if self.vars.get(input)?.tracks_gradient {
        stack.push(input);
      }
    }
    Ok(())
  }

  /// Clear the gradient and the fan-out bookkeeping of `root` and of every
  /// node reachable through creator -> inputs, tracked or not
  pub fn zero_grads(&mut self, root: VarId) -> Result<()> {
    let mut visited = BitSet::new();
    let mut stack = vec![root];
    while let Some(var) = stack.pop() {
      // a slot is visited once, a dag can reach it along many paths
      if !visited.insert(var.slot()) {
        continue;
      }
      let node = self.vars.get_mut(var)?;
      node.zero_grad();
      node.fan_out.reset();
      if let Some(function) = node.creator.and_then(|c| self.functions.get(c)) {
        stack.extend(function.inputs().iter().copied());
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{Calls, Grid, Recorder};

  /// Register a recorder over `inputs` and give it a fresh 1x1 output
  fn op(tape: &mut Tape<Grid>, inputs: Vec<VarId>) -> (VarId, FnId, Calls) {
    let (f, calls) = Recorder::new(inputs);
    let f = tape.register(f).unwrap();
    let out = tape.var_from_fn(f, 1, 1).unwrap();
    (out, f, calls)
  }

  fn grad(tape: &Tape<Grid>, var: VarId) -> f32 {
    tape.grad(var).unwrap().get_at(0, 0)
  }

  #[test]
  fn leaf_only_takes_its_seed() {
    let mut tape: Tape<Grid> = Tape::new();
    let a = tape.var(1, 1);
    let b = tape.var(1, 1);
    tape.set_seed(a, Grid::filled(1, 1, 3.0)).unwrap();
    tape.backward(a).unwrap();
    assert_eq!(grad(&tape, a), 3.0);
    assert_eq!(grad(&tape, b), 0.0);
  }

  #[test]
  fn chain() {
    let mut tape: Tape<Grid> = Tape::new();
    let a = tape.var(1, 1);
    let (b, _, calls_b) = op(&mut tape, vec![a]);
    let (c, _, calls_c) = op(&mut tape, vec![b]);

    tape.backward(c).unwrap();
    assert_eq!(grad(&tape, c), 1.0);
    assert_eq!(grad(&tape, b), 1.0);
    assert_eq!(grad(&tape, a), 1.0);
    assert_eq!(calls_c.borrow().len(), 1);
    assert_eq!(calls_b.borrow().len(), 1);
  }

  #[test]
  fn root_grad_is_overwritten_not_accumulated() {
    let mut tape: Tape<Grid> = Tape::new();
    let a = tape.var(1, 1);
    tape.backward(a).unwrap();
    tape.backward(a).unwrap();
    assert_eq!(grad(&tape, a), 1.0);
  }

  #[test]
  fn zero_grads_clears_the_subgraph() {
    let mut tape: Tape<Grid> = Tape::new();
    let a = tape.var(1, 1);
    let (b, _, _) = op(&mut tape, vec![a]);
    let (c, _, _) = op(&mut tape, vec![b]);
    // a pass through c leaves b armed for the current epoch
    tape.backward(c).unwrap();
    assert_eq!(tape.get(b).unwrap().epoch_tag(), Some(0));

    tape.zero_grads(c).unwrap();
    for var in [a, b, c] {
      let node = tape.get(var).unwrap();
      assert_eq!(grad(&tape, var), 0.0);
      assert_eq!(node.pending_consumers(), 0);
      assert_eq!(node.epoch_tag(), None);
      assert!(!node.is_final_contribution());
    }
  }

  #[test]
  fn zero_grads_ignores_tracking_flag() {
    let mut tape: Tape<Grid> = Tape::new();
    let a = tape.var(1, 1);
    let (b, _, _) = op(&mut tape, vec![a]);
    let (c, _, _) = op(&mut tape, vec![b]);
    tape.backward(c).unwrap();
    tape.set_tracks_gradient(b, false).unwrap();
    tape.zero_grads(c).unwrap();
    assert_eq!(grad(&tape, a), 0.0);
    assert_eq!(grad(&tape, b), 0.0);
  }

  #[test]
  fn unchain_cuts_propagation() {
    let mut tape: Tape<Grid> = Tape::new();
    let a = tape.var(1, 1);
    let (b, _, calls_b) = op(&mut tape, vec![a]);
    let (c, _, _) = op(&mut tape, vec![b]);

    tape.unchain(b).unwrap();
    tape.backward(c).unwrap();
    assert_eq!(grad(&tape, b), 1.0);
    assert_eq!(grad(&tape, a), 0.0);
    assert!(calls_b.borrow().is_empty());
  }

  #[test]
  fn non_tracking_inputs_are_pruned() {
    let mut tape: Tape<Grid> = Tape::new();
    let a = tape.var(1, 1);
    let (b, _, calls_b) = op(&mut tape, vec![a]);
    let x = tape.var(1, 1);
    let (c, _, _) = op(&mut tape, vec![b, x]);
    tape.set_tracks_gradient(b, false).unwrap();

    tape.backward(c).unwrap();
    assert_eq!(grad(&tape, b), 0.0);
    assert_eq!(grad(&tape, x), 1.0);
    assert_eq!(grad(&tape, a), 0.0);
    assert!(calls_b.borrow().is_empty());
  }

  #[test]
  fn stopped_consumer_still_counts() {
    // y = h + stop(g(h)): the stopped branch never reports back to h
    let mut tape: Tape<Grid> = Tape::new();
    let x = tape.var(1, 1);
    let (h, _, calls_h) = op(&mut tape, vec![x]);
    tape.set_name(h, "hidden").unwrap();
    let (g, _, _) = op(&mut tape, vec![h]);
    let (y, _, _) = op(&mut tape, vec![h, g]);
    tape.set_tracks_gradient(g, false).unwrap();
    assert_eq!(tape.get(h).unwrap().consumers(), 2);

    tape.backward(y).unwrap();
    assert_eq!(grad(&tape, h), 1.0);
    assert_eq!(tape.get(h).unwrap().pending_consumers(), 1);
    assert!(calls_h.borrow().is_empty());
    assert_eq!(grad(&tape, x), 0.0);

    // marking the branch before building on it keeps the count honest
    let x = tape.var(1, 1);
    let (h, _, calls_h) = op(&mut tape, vec![x]);
    let g = tape.var(1, 1);
    tape.set_tracks_gradient(g, false).unwrap();
    let (y, _, _) = op(&mut tape, vec![h, g]);
    tape.backward(y).unwrap();
    assert_eq!(calls_h.borrow().len(), 1);
    assert_eq!(grad(&tape, x), 1.0);
  }

  #[test]
  fn fan_out_waits_for_every_consumer() {
    let mut tape: Tape<Grid> = Tape::new();
    let root = tape.var(1, 1);
    let (a, _, calls_a) = op(&mut tape, vec![root]);
    let (b, _, _) = op(&mut tape, vec![a]);
    let (c, _, _) = op(&mut tape, vec![a]);
    assert_eq!(tape.get(a).unwrap().consumers(), 2);

    tape.set_seed(b, Grid::filled(1, 1, 2.0)).unwrap();
    tape.backward(b).unwrap();
    assert!(calls_a.borrow().is_empty());
    assert_eq!(tape.get(a).unwrap().pending_consumers(), 1);
    assert_eq!(grad(&tape, a), 2.0);
    assert_eq!(grad(&tape, root), 0.0);

    tape.set_seed(c, Grid::filled(1, 1, 5.0)).unwrap();
    tape.backward(c).unwrap();
    // a's creator saw the sum of both contributions, exactly once
    assert_eq!(*calls_a.borrow(), vec![Grid::filled(1, 1, 7.0)]);
    assert_eq!(grad(&tape, root), 7.0);
    assert!(tape.get(a).unwrap().is_final_contribution());

    // further arrivals in the same epoch are ignored
    tape.backward(c).unwrap();
    assert_eq!(calls_a.borrow().len(), 1);
  }

  #[test]
  fn diamond_propagates_once() {
    let mut tape: Tape<Grid> = Tape::new();
    let x = tape.var(1, 1);
    let (a, _, calls_a) = op(&mut tape, vec![x]);
    let (b, _, _) = op(&mut tape, vec![a]);
    let (c, _, _) = op(&mut tape, vec![a]);
    let (d, _, _) = op(&mut tape, vec![b, c]);

    tape.backward(d).unwrap();
    assert_eq!(*calls_a.borrow(), vec![Grid::filled(1, 1, 2.0)]);
    assert_eq!(grad(&tape, x), 2.0);
  }

  #[test]
  fn repeated_input_counts_twice() {
    let mut tape: Tape<Grid> = Tape::new();
    let x = tape.var(1, 1);
    let (a, _, calls_a) = op(&mut tape, vec![x]);
    let (sq, _, _) = op(&mut tape, vec![a, a]);

    tape.backward(sq).unwrap();
    assert_eq!(calls_a.borrow().len(), 1);
    assert_eq!(grad(&tape, a), 2.0);
    assert_eq!(grad(&tape, x), 2.0);
  }

  #[test]
  fn new_epoch_rearms_fan_out() {
    let mut tape: Tape<Grid> = Tape::new();
    let x = tape.var(1, 1);
    let (a, _, calls_a) = op(&mut tape, vec![x]);
    let (b, _, _) = op(&mut tape, vec![a]);

    tape.backward(b).unwrap();
    tape.backward(b).unwrap();
    assert_eq!(calls_a.borrow().len(), 1);

    tape.begin_epoch();
    tape.zero_grad(a).unwrap();
    tape.backward(b).unwrap();
    assert_eq!(calls_a.borrow().len(), 2);
    assert_eq!(tape.get(a).unwrap().epoch_tag(), Some(1));
  }

  #[test]
  fn zero_grads_allows_another_pass() {
    let mut tape: Tape<Grid> = Tape::new();
    let x = tape.var(1, 1);
    let (a, _, calls_a) = op(&mut tape, vec![x]);
    let (b, _, _) = op(&mut tape, vec![a]);
    let (c, _, _) = op(&mut tape, vec![a, b]);

    tape.backward(c).unwrap();
    assert_eq!(grad(&tape, x), 2.0);

    tape.zero_grads(c).unwrap();
    tape.backward(c).unwrap();
    assert_eq!(calls_a.borrow().len(), 2);
    assert_eq!(grad(&tape, x), 2.0);
  }

  #[test]
  fn released_creator_behaves_as_leaf() {
    let mut tape: Tape<Grid> = Tape::new();
    let x = tape.var(1, 1);
    let (a, f, calls_a) = op(&mut tape, vec![x]);
    tape.release_function(f).unwrap();
    tape.backward(a).unwrap();
    assert!(calls_a.borrow().is_empty());
    assert_eq!(grad(&tape, x), 0.0);
  }

  #[test]
  fn stale_root_is_rejected() {
    let mut tape: Tape<Grid> = Tape::with_config(Default::default());
    let a = tape.acquire(1, 1);
    tape.release(a).unwrap();
    let b = tape.acquire(1, 1);
    assert_eq!(tape.backward(a).unwrap_err(), TapeError::StaleVariable(a));
    tape.backward(b).unwrap();
  }
}
