use super::config::ConfigError;
use super::coordinator::CoordinationError;
use super::frontier::FrontierError;
use super::ledger::LedgerError;
use crate::core::models::conf::{Conf, ConfError};
use crate::core::models::space::StateId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Invalid configuration: {source}")]
    Config {
        #[from]
        source: ConfigError,
    },

    #[error("Invalid conformation: {source}")]
    Conf {
        #[from]
        source: ConfError,
    },

    #[error("Leaf evaluation failed for {state} conformation {conf}: {reason}")]
    Evaluation {
        state: StateId,
        conf: Conf,
        reason: String,
    },

    #[error("Frontier store error: {source}")]
    Frontier {
        #[from]
        source: FrontierError,
    },

    #[error("Sequence ledger error: {source}")]
    Ledger {
        #[from]
        source: LedgerError,
    },

    #[error("Coordination failed: {source}")]
    Coordination {
        #[from]
        source: CoordinationError,
    },

    #[error("Refinement phase '{phase}' failed: {reason}")]
    PhaseFailed { phase: &'static str, reason: String },

    #[error("Internal logic error: {0}")]
    Internal(String),
}
