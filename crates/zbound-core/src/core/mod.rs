//! # Core Module
//!
//! Stateless building blocks of the estimator: the number type used for
//! partition function values, the data models of conformation and sequence
//! spaces, and the file formats everything is persisted in.
//!
//! - **Numerics** ([`math`]) - Unbounded-range reals and Boltzmann weighting
//! - **Models** ([`models`]) - Conformations, sequences, states, energy matrices and nodes
//! - **File I/O** ([`io`]) - Conformation space TOML, frontier ring files and the ledger log

pub mod io;
pub mod math;
pub mod models;
