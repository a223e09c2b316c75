//! # Core Models Module
//!
//! Value types shared by every layer: conformations and their cursor, sequences
//! and the sequence space, per-state conformation spaces with their energy
//! matrices, and the search-tree node.
//!
//! - [`conf`] - Partial and complete conformations, plus the [`conf::ConfIndex`] cursor
//! - [`sequence`] - Sequence projections, wildcards and the shared sequence space
//! - [`space`] - States, positions and residue conformation choices
//! - [`energy`] - Pairwise energy lower bounds used by the bound calculator
//! - [`node`] - A frontier node: one unexplored subtree and its bound

pub mod conf;
pub mod energy;
pub mod node;
pub mod sequence;
pub mod space;
