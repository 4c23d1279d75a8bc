use serde::{Deserialize, Serialize};

/// Number of tracked pool entries above which released nodes are evicted
pub const DEFAULT_POOL_CAPACITY: usize = 4000;

/// Settings for a [`Tape`](crate::Tape)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TapeConfig {
  /// Once more entries than this are tracked, a released node is dropped
  /// instead of being kept for reuse
  pub pool_capacity: usize,
}

impl TapeConfig {
  pub fn with_pool_capacity(mut self, pool_capacity: usize) -> Self {
    self.pool_capacity = pool_capacity;
    self
  }
}

impl Default for TapeConfig {
  fn default() -> Self {
    Self {
      pool_capacity: DEFAULT_POOL_CAPACITY,
    }
  }
}
