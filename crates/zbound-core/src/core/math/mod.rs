//! Numeric foundations: an unbounded-range real type for partition function
//! values and the Boltzmann conversions between energies and statistical weights.

pub mod bigexp;
pub mod boltzmann;
