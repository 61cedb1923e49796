//! Consensus error types

use dpos_core::{CoreError, Pubkey};
use thiserror::Error;

/// Consensus error type
#[derive(Error, Debug, Clone)]
pub enum ConsensusError {
    /// Round information is structurally unusable
    #[error("Invalid round: {0}")]
    InvalidRound(String),

    /// A required round is missing from state
    #[error("Round {round_number} not found")]
    RoundNotFound { round_number: u64 },

    /// A required term is missing from state
    #[error("Term {term_number} not found")]
    TermNotFound { term_number: u64 },

    /// Pubkey is not part of the round
    #[error("Miner {0} not found in round")]
    MinerNotFound(Pubkey),

    /// Consensus information was already processed at this height
    #[error("Consensus information already processed at height {height}")]
    AlreadyExecutedAtHeight { height: u64 },

    /// Header information could not be used
    #[error("Invalid consensus header: {0}")]
    InvalidHeader(String),

    /// Trigger information is missing a required value
    #[error("Invalid trigger information: {0}")]
    InvalidTrigger(String),

    /// Secret sharing failure
    #[error("Secret sharing error: {0}")]
    SecretSharing(String),

    /// Arithmetic overflow in a protocol formula
    #[error("Arithmetic overflow: {0}")]
    Overflow(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error bubbled up from the core crate
    #[error("Core error: {0}")]
    Core(String),
}

impl From<serde_json::Error> for ConsensusError {
    fn from(err: serde_json::Error) -> Self {
        ConsensusError::Serialization(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for ConsensusError {
    fn from(err: bincode::error::EncodeError) -> Self {
        ConsensusError::Serialization(err.to_string())
    }
}

impl From<CoreError> for ConsensusError {
    fn from(err: CoreError) -> Self {
        ConsensusError::Core(err.to_string())
    }
}

/// Result type for consensus operations
pub type ConsensusResult<T> = Result<T, ConsensusError>;
