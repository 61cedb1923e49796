//! DPoS consensus core
//!
//! This crate provides round-based delegated proof of stake consensus:
//! committee scheduling, the behavior selector, header validation, last
//! irreversible block estimation and term transitions.

pub mod behavior;
pub mod config;
pub mod engine;
pub mod error;
pub mod evil_miner;
pub mod header;
pub mod lib_estimator;
pub mod mining_status;
pub mod round;
pub mod secret_sharing;
pub mod signature;
pub mod state;
pub mod term;
pub mod traits;
pub mod validation;

pub use behavior::{Behavior, BehaviorProvider, ConsensusCommand};
pub use config::DposConfig;
pub use engine::{ConsensusEvent, DposEngine};
pub use error::{ConsensusError, ConsensusResult};
pub use header::{ConsensusHeaderInformation, TriggerInformation};
pub use mining_status::{LatestProviderToTinyBlocksCount, MiningStatus};
pub use round::{MinerInRound, MinerReplacement, Round};
pub use state::ConsensusState;
pub use term::MinerList;
pub use traits::{ConsensusInformationProvider, ElectionProvider, StaticElection};
pub use validation::ValidationResult;
