//!
//! Shape-keyed recycling of nodes
//!
//! The pool never owns node memory itself, the arena does; it only remembers
//! which slots it has handed out and which are free to hand out again.
//!

use rustc_hash::FxHashMap;

use tracing::debug;

use crate::error::{Result, TapeError};
use crate::tensor::Tensor;
use crate::variable::{VarId, Value, Variable, Variables};

/// Counters describing pool traffic since the tape was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
  /// Acquisitions that had to allocate a fresh node
  pub allocations: u64,
  /// Acquisitions served from a free entry
  pub reuses: u64,
  /// Releases that dropped the node because the pool was over capacity
  pub evictions: u64,
}

#[derive(Debug)]
pub struct Pool {
  /// slot -> in use
  entries: FxHashMap<u32, bool>,
  capacity: usize,
  stats: PoolStats,
}

impl Pool {
  pub(crate) fn new(capacity: usize) -> Self {
    Self {
      entries: FxHashMap::default(),
      capacity,
      stats: PoolStats::default(),
    }
  }

  /// Entries tracked, free or in use
  pub fn tracked(&self) -> usize {
    self.entries.len()
  }

  pub fn in_use(&self) -> usize {
    self.entries.values().filter(|in_use| **in_use).count()
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn stats(&self) -> PoolStats {
    self.stats
  }

  /// Whether `var` is tracked and currently marked free
  pub fn is_free(&self, var: VarId) -> bool {
    self.entries.get(&(var.slot() as u32)) == Some(&false)
  }

  /// Hand out a zeroed dense node of the given shape, reusing a free entry
  /// when one matches exactly
  ///
  /// A reused node keeps its slot but is stamped with a fresh id
  pub(crate) fn acquire<T: Tensor>(
    &mut self,
    vars: &mut Variables<T>,
    rows: usize,
    cols: usize,
  ) -> VarId {
    if let Some(slot) = self.find_free(vars, rows, cols) {
      let id = vars.next_id();
      if let Some(node) = vars.slot_mut(slot) {
        node.recycle(id);
        self.entries.insert(slot, true);
        self.stats.reuses += 1;
        debug!(slot, id, rows, cols, "pool reuse");
        return VarId::new(slot, id);
      }
      // entry outlived its node, drop it and fall through to allocation
      self.entries.remove(&slot);
    }

    let id = vars.next_id();
    let var = vars.insert(Variable::zeroed(id, rows, cols));
    self.entries.insert(var.slot() as u32, true);
    self.stats.allocations += 1;
    debug!(slot = var.slot(), id, rows, cols, "pool allocation");
    var
  }

  fn find_free<T: Tensor>(&self, vars: &Variables<T>, rows: usize, cols: usize) -> Option<u32> {
    self
      .entries
      .iter()
      .filter(|(_, in_use)| !**in_use)
      .map(|(slot, _)| *slot)
      .find(|slot| {
        matches!(
          vars.slot(*slot).map(|node| &node.data),
          Some(Value::Dense(data)) if data.dims() == (rows, cols)
        )
      })
  }

  /// Mark `var` free for reuse, adopting it if the pool did not hand it out
  ///
  /// Over capacity, or when the node holds a sparse value, it is evicted
  /// instead: its entry is forgotten and its slot vacated, so the handle goes
  /// stale immediately
  pub(crate) fn release<T: Tensor>(&mut self, vars: &mut Variables<T>, var: VarId) -> Result<()> {
    let node = vars.get(var)?;
    let consumers = node.fan_out.consumers;
    if consumers > 0 {
      return Err(TapeError::StillConsumed { var, consumers });
    }
    // only dense nodes are ever handed out again
    let reusable = !node.is_sparse();

    let slot = var.slot() as u32;
    self.entries.insert(slot, false);

    if !reusable || self.entries.len() > self.capacity {
      self.entries.remove(&slot);
      vars.remove(var)?;
      self.stats.evictions += 1;
      debug!(slot, id = var.id(), tracked = self.entries.len(), "pool eviction");
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tensor::SparseTensor;
  use crate::testing::{Grid, OneHot};

  fn setup(capacity: usize) -> (Pool, Variables<Grid>) {
    (Pool::new(capacity), Variables::new())
  }

  #[test]
  fn reuse_same_shape() {
    let (mut pool, mut vars) = setup(4000);
    let a = pool.acquire(&mut vars, 2, 3);
    vars.get_mut(a).unwrap().grad.set_all(5.0);
    pool.release(&mut vars, a).unwrap();
    assert!(pool.is_free(a));

    let b = pool.acquire(&mut vars, 2, 3);
    assert_eq!(a.slot(), b.slot());
    assert!(b.id() > a.id());
    assert_eq!(vars.grad(b).unwrap(), &Grid::filled(2, 3, 0.0));
    assert_eq!(
      pool.stats(),
      PoolStats {
        allocations: 1,
        reuses: 1,
        evictions: 0
      }
    );
  }

  #[test]
  fn shape_must_match_exactly() {
    let (mut pool, mut vars) = setup(4000);
    let a = pool.acquire(&mut vars, 2, 3);
    pool.release(&mut vars, a).unwrap();

    let b = pool.acquire(&mut vars, 3, 2);
    assert_ne!(a.slot(), b.slot());
    assert_eq!(pool.tracked(), 2);
    assert_eq!(pool.in_use(), 1);
    assert_eq!(pool.stats().allocations, 2);
  }

  #[test]
  fn in_use_entries_are_never_handed_out() {
    let (mut pool, mut vars) = setup(4000);
    let a = pool.acquire(&mut vars, 1, 1);
    let b = pool.acquire(&mut vars, 1, 1);
    assert_ne!(a.slot(), b.slot());
  }

  #[test]
  fn evicts_over_capacity() {
    let (mut pool, mut vars) = setup(2);
    let a = pool.acquire(&mut vars, 1, 1);
    let b = pool.acquire(&mut vars, 1, 1);
    let c = pool.acquire(&mut vars, 1, 1);
    assert_eq!(pool.tracked(), 3);

    // 3 tracked > 2, so the released node is dropped
    pool.release(&mut vars, c).unwrap();
    assert_eq!(pool.tracked(), 2);
    assert!(!vars.contains(c));
    assert_eq!(pool.stats().evictions, 1);

    // back at capacity, releases are kept for reuse again
    pool.release(&mut vars, b).unwrap();
    assert!(vars.contains(b));
    assert!(pool.is_free(b));

    let d = pool.acquire(&mut vars, 1, 1);
    assert_eq!(d.slot(), b.slot());
    assert!(vars.contains(a));

    // the evicted node is gone for good, so the next request allocates
    let allocations = pool.stats().allocations;
    let e = pool.acquire(&mut vars, 1, 1);
    assert_eq!(pool.stats().allocations, allocations + 1);
    assert_ne!(e.slot(), a.slot());
    assert_ne!(e.slot(), d.slot());
  }

  #[test]
  fn reuse_restores_fresh_flags() {
    let (mut pool, mut vars) = setup(4000);
    let a = pool.acquire(&mut vars, 1, 1);
    {
      let node = vars.get_mut(a).unwrap();
      node.tracks_gradient = false;
      node.seed = Grid::filled(1, 1, 9.0);
      node.name = Some("mask".into());
    }
    pool.release(&mut vars, a).unwrap();

    let b = pool.acquire(&mut vars, 1, 1);
    assert_eq!(a.slot(), b.slot());
    let node = vars.get(b).unwrap();
    assert!(node.tracks_gradient());
    assert_eq!(node.seed(), &Grid::filled(1, 1, 1.0));
    assert_eq!(node.name(), None);
  }

  #[test]
  fn sparse_nodes_are_not_kept() {
    let (mut pool, mut vars) = setup(4000);
    let id = vars.next_id();
    let ids = OneHot::one_hot(&[0, 1], 2).unwrap();
    let a = vars.insert(Variable::with_value(id, Value::Sparse(ids), None));
    pool.release(&mut vars, a).unwrap();

    assert_eq!(pool.tracked(), 0);
    assert!(!vars.contains(a));
    assert_eq!(pool.stats().evictions, 1);
  }

  #[test]
  fn refuses_consumed_nodes() {
    let (mut pool, mut vars) = setup(4000);
    let a = pool.acquire(&mut vars, 1, 1);
    vars.get_mut(a).unwrap().fan_out.consumers = 2;
    assert_eq!(
      pool.release(&mut vars, a).unwrap_err(),
      TapeError::StillConsumed {
        var: a,
        consumers: 2
      }
    );
    assert!(!pool.is_free(a));
  }

  #[test]
  fn adopts_unpooled_nodes() {
    let (mut pool, mut vars) = setup(4000);
    let id = vars.next_id();
    let a = vars.insert(Variable::zeroed(id, 4, 4));
    assert_eq!(pool.tracked(), 0);
    pool.release(&mut vars, a).unwrap();
    assert_eq!(pool.tracked(), 1);

    let b = pool.acquire(&mut vars, 4, 4);
    assert_eq!(a.slot(), b.slot());
    assert_eq!(pool.stats().reuses, 1);
  }
}
