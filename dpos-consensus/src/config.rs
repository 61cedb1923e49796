//! DPoS consensus configuration

use crate::{ConsensusError, ConsensusResult};
use chrono::{DateTime, Utc};
use dpos_core::{Pubkey, Timestamp};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Default mining interval in milliseconds
pub const DEFAULT_MINING_INTERVAL: u64 = 4_000;

/// Default term length in seconds (7 days)
pub const DEFAULT_PERIOD_SECONDS: u64 = 604_800;

/// Upper bound of blocks a miner may produce inside one time slot
pub const MAXIMUM_TINY_BLOCKS_COUNT: u64 = 8;

/// Committee size the chain starts from
pub const SUPPOSED_MINERS_COUNT: usize = 17;

/// Hard cap on the committee size hint
pub const DEFAULT_MAXIMUM_MINERS_COUNT: usize = 100;

/// Seconds between two automatic committee size increases (1 year)
pub const DEFAULT_MINER_INCREASE_INTERVAL: u64 = 31_536_000;

/// Missed slots tolerated before a miner is reported.
///
/// A miner misses at most one slot per round, so this counts rounds: three
/// days at one round per minute.
pub const TOLERABLE_MISSED_TIME_SLOTS_COUNT: u64 = 60 * 24 * 3;

/// DPoS consensus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DposConfig {
    /// Time slot length in milliseconds
    pub mining_interval: u64,
    /// Term length in seconds
    pub period_seconds: u64,
    /// Tiny block ceiling under normal mining status
    pub maximum_tiny_blocks_count: u64,
    /// Initial committee size used for the size hint
    pub supposed_miners_count: usize,
    /// Upper bound of the committee size hint
    pub maximum_miners_count: usize,
    /// Seconds per automatic increase of the committee size hint
    pub miner_increase_interval: u64,
    /// Missed time slots tolerated before a miner is reported as evil
    pub tolerable_missed_time_slots: u64,
    /// Hex encoded public keys of the first term's miners
    pub initial_miners: Vec<String>,
    /// Chain start time
    pub start_time: DateTime<Utc>,
}

impl Default for DposConfig {
    fn default() -> Self {
        Self {
            mining_interval: DEFAULT_MINING_INTERVAL,
            period_seconds: DEFAULT_PERIOD_SECONDS,
            maximum_tiny_blocks_count: MAXIMUM_TINY_BLOCKS_COUNT,
            supposed_miners_count: SUPPOSED_MINERS_COUNT,
            maximum_miners_count: DEFAULT_MAXIMUM_MINERS_COUNT,
            miner_increase_interval: DEFAULT_MINER_INCREASE_INTERVAL,
            tolerable_missed_time_slots: TOLERABLE_MISSED_TIME_SLOTS_COUNT,
            initial_miners: vec![],
            start_time: DateTime::<Utc>::default(),
        }
    }
}

impl DposConfig {
    /// Create a new configuration with the given initial miners
    pub fn new(initial_miners: Vec<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            initial_miners,
            start_time,
            ..Self::default()
        }
    }

    /// Load configuration from file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> ConsensusResult<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| ConsensusError::Config(format!("Failed to read config file: {}", e)))?;

        let config: DposConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> ConsensusResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), content)
            .map_err(|e| ConsensusError::Config(format!("Failed to write config file: {}", e)))?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConsensusResult<()> {
        if self.mining_interval == 0 {
            return Err(ConsensusError::Config(
                "Mining interval must be greater than 0".to_string(),
            ));
        }

        if self.period_seconds == 0 {
            return Err(ConsensusError::Config(
                "Term period must be greater than 0".to_string(),
            ));
        }

        if self.maximum_tiny_blocks_count == 0 {
            return Err(ConsensusError::Config(
                "Maximum tiny blocks count must be greater than 0".to_string(),
            ));
        }

        if self.miner_increase_interval == 0 {
            return Err(ConsensusError::Config(
                "Miner increase interval must be greater than 0".to_string(),
            ));
        }

        if self.maximum_miners_count == 0 {
            return Err(ConsensusError::Config(
                "Maximum miners count must be greater than 0".to_string(),
            ));
        }

        if self.initial_miners.is_empty() {
            return Err(ConsensusError::Config(
                "At least one initial miner is required".to_string(),
            ));
        }

        if self.start_time.timestamp_millis() < 0 {
            return Err(ConsensusError::Config(
                "Start time must not precede the Unix epoch".to_string(),
            ));
        }

        // Parse every key and reject duplicates
        let miners = self.initial_miner_list()?;
        let mut sorted = miners.clone();
        sorted.sort();
        sorted.dedup();
        if sorted.len() != miners.len() {
            return Err(ConsensusError::Config(
                "Initial miners must be unique".to_string(),
            ));
        }

        Ok(())
    }

    /// Parse the initial miners
    pub fn initial_miner_list(&self) -> ConsensusResult<Vec<Pubkey>> {
        self.initial_miners
            .iter()
            .enumerate()
            .map(|(i, hex)| {
                let pubkey = Pubkey::from_hex(hex).map_err(|e| {
                    ConsensusError::Config(format!("Invalid public key for miner {}: {}", i, e))
                })?;
                if pubkey.is_empty() {
                    return Err(ConsensusError::Config(format!(
                        "Public key of miner {} is empty",
                        i
                    )));
                }
                Ok(pubkey)
            })
            .collect()
    }

    /// Chain start time in milliseconds
    pub fn start_timestamp(&self) -> Timestamp {
        u64::try_from(self.start_time.timestamp_millis()).unwrap_or_default()
    }

    /// Set mining interval
    pub fn with_mining_interval(mut self, mining_interval: u64) -> Self {
        self.mining_interval = mining_interval;
        self
    }

    /// Set term period
    pub fn with_period_seconds(mut self, period_seconds: u64) -> Self {
        self.period_seconds = period_seconds;
        self
    }

    /// Set start time from milliseconds
    pub fn with_start_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.start_time = i64::try_from(timestamp)
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_default();
        self
    }

    /// Set missed slot tolerance
    pub fn with_tolerable_missed_time_slots(mut self, slots: u64) -> Self {
        self.tolerable_missed_time_slots = slots;
        self
    }
}

/// Default miners configuration for testing
pub fn default_test_miners() -> Vec<String> {
    vec![
        "02a1b2c3d4e5f60718293a4b5c6d7e8f90a1b2c3d4e5f60718293a4b5c6d7e8f90".to_string(),
        "03b1c2d3e4f5061728394a5b6c7d8e9fa0b1c2d3e4f5061728394a5b6c7d8e9fa0".to_string(),
        "02c1d2e3f405162738495a6b7c8d9eafb0c1d2e3f405162738495a6b7c8d9eafb0".to_string(),
        "03d1e2f30415263748596a7b8c9daebfc0d1e2f30415263748596a7b8c9daebfc0".to_string(),
        "02e1f203142536475869708b9cadbecfd0e1f203142536475869708b9cadbecfd0".to_string(),
    ]
}
