//! Persistence formats.
//!
//! Conformation spaces are read from TOML. Frontier nodes are stored as fixed-size
//! binary records in bounded ring regions, and ledger values in an append-only log
//! that is merged on open. All numbers use the 16-byte [`BigExp`] encoding.
//!
//! [`BigExp`]: crate::core::math::bigexp::BigExp

pub mod ledger_file;
pub mod records;
pub mod ring_file;
pub mod space_file;
