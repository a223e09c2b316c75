//! # Workflows Module
//!
//! The entry points that drive a complete estimation from a conformation space
//! to bounded partition functions.
//!
//! ## Overview
//!
//! A workflow assembles the bound calculators, the frontier and the sequence
//! ledger from an [`EstimatorConfig`](crate::engine::config::EstimatorConfig),
//! credits every state's root node and then refines until a stopping criterion
//! is met or nothing is left to refine. Progress goes to a
//! [`ProgressReporter`](crate::engine::progress::ProgressReporter).
//!
//! ## Architecture
//!
//! - **Estimation** ([`estimate`]) - One process, phased refinement with a
//!   persisted, resumable frontier and ledger
//! - **Cluster** ([`cluster`]) - Several members with their own frontiers and
//!   a shared ledger, directed by the calling thread

pub mod cluster;
pub mod estimate;
