//!
//! # autovar
//!
//! ## Core API
//!
//! Reverse-mode automatic differentiation over a graph of tensor-valued
//! nodes. A [`Tape`] owns the nodes, the functions that created them and a
//! shape-keyed pool that recycles intermediate nodes between iterations.
//!
//! Nodes are addressed by [`VarId`] handles. Functions record their inputs
//! when registered, which is how the backward pass knows a node's fan-out:
//! a creator runs only after every consumer has contributed its gradient.
//!
//! ## Backends
//!
//! With the `matrix` feature (on by default) the [`matrix`] module provides
//! a dense and sparse `f32` backend on nalgebra together with the common
//! operators, reachable through [`matrix::TapeExt`].
//!

pub use lib_autovar_core::*;

#[cfg(feature = "matrix")]
pub use lib_autovar_matrix as matrix;
