//!
//! # autovar-core
//!
//! Reverse-mode differentiation over a graph of tensor-valued nodes.
//!
//! Client code builds a graph on a [`Tape`]: functions are registered with the
//! handles of their inputs, and their outputs are created (usually taken from
//! the tape's pool) with the function stamped as creator. Calling
//! [`Tape::backward`] on a node seeds its gradient and walks creators back to
//! the leaves, depositing gradients into every node along the way.
//!
//! ## Fan-out
//!
//! Registering a function counts one consumer edge on each of its inputs.
//! During a backward pass a node's creator runs only once every counted edge
//! has delivered its contribution for the current epoch, and at most once per
//! epoch. [`Tape::begin_epoch`] and [`Tape::zero_grads`] start over.
//!
//! ## Pool
//!
//! [`Tape::acquire`] and [`Tape::release`] recycle nodes by shape. Above the
//! configured capacity released nodes are dropped instead of kept.
//!

#[cfg(feature = "nalgebra")]
mod backend;
mod backward;
mod config;
mod error;
mod function;
mod pool;
mod state;
mod tape;
mod tensor;
mod variable;

#[cfg(test)]
mod testing;

pub use config::{TapeConfig, DEFAULT_POOL_CAPACITY};
pub use error::{Result, TapeError};
pub use function::{FnId, Function};
pub use pool::{Pool, PoolStats};
pub use state::VariableState;
pub use tape::Tape;
pub use tensor::{SparseTensor, Tensor};
pub use variable::{Value, VarId, Variable, Variables};
