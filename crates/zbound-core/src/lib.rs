//! # zbound
//!
//! Bounds the partition functions of multi-state conformation spaces by
//! branch and bound.
//!
//! Each state's conformations form a tree whose inner nodes fix a prefix of
//! the positions. A node carries an upper bound on the Boltzmann-weighted mass
//! of every conformation below it. Refinement replaces nodes by their children
//! or resolves leaves exactly, and a per-sequence ledger turns the exact and
//! still-pending mass into a lower and an upper bound on every sequence's
//! partition function.
//!
//! ## Layers
//!
//! - **[`core`]: The Foundation.** Stateless models of conformations,
//!   sequences, states and search nodes, the [`BigExp`](core::math::bigexp::BigExp)
//!   number type, and the on-disk formats.
//!
//! - **[`engine`]: The Logic Core.** Bound calculation, the bounded frontier
//!   stores, the sequence ledger and the refinement processor with its
//!   coordination primitives.
//!
//! - **[`workflows`]: The Public API.** Complete single-process and cluster
//!   estimations built from the engine.

pub mod core;
pub mod engine;
pub mod workflows;

#[cfg(test)]
pub(crate) mod test_utils;
