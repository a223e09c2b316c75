//! # Engine Module
//!
//! The stateful layer that refines partition function bounds.
//!
//! ## Overview
//!
//! Every state's conformation space is explored as a tree of partial
//! conformations. [`bounds`] computes an upper bound on the partition function
//! mass below each tree node; the [`frontier`] stores the nodes that still await
//! refinement; the [`ledger`] keeps, per state and sequence, how much mass has
//! been resolved exactly, how much is still pending in the frontier and how much
//! was given up. A [`processor::Processor`] repeatedly takes a node, prunes,
//! expands or minimizes it, and commits the outcome to the frontier and the
//! ledger in one step.
//!
//! ## Architecture
//!
//! - **Configuration** ([`config`]) - Temperature, frontier mode, storage, limits and tolerances
//! - **Bounds** ([`bounds`], [`evaluator`]) - Node bounds from the pairwise energy matrix and exact leaf energies
//! - **Storage** ([`frontier`], [`ledger`]) - The bounded node store and the per-sequence mass accounts
//! - **Refinement** ([`processor`], [`batch`], [`perf`]) - The worker loop, leaf batching and node scoring
//! - **Control** ([`criterion`], [`coordinator`], [`progress`]) - Stopping rules, cross-worker coordination and progress reporting
//! - **Reporting** ([`report`]) - Per-sequence bound tables and their CSV export
//! - **Error Handling** ([`error`]) - Engine-specific error types

pub mod batch;
pub mod bounds;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod criterion;
pub mod error;
pub mod evaluator;
pub mod frontier;
pub mod ledger;
pub mod perf;
pub mod processor;
pub mod progress;
pub mod report;
