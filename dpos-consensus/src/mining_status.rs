//! Mining status and the continuous block limit
//!
//! How many blocks one miner may produce in a row depends on how far the
//! irreversible block lags behind the current round. The ceiling is always
//! computed fresh from the current state; the carried-over counter is
//! clamped to it so a lowered ceiling applies to the very next block.

use crate::config::MAXIMUM_TINY_BLOCKS_COUNT;
use dpos_core::Pubkey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Chain health derived from the LIB lag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MiningStatus {
    /// LIB is at most two rounds behind
    Normal,
    /// LIB is lagging
    Abnormal,
    /// LIB stopped advancing
    Severe,
}

impl fmt::Display for MiningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MiningStatus::Normal => write!(f, "Normal"),
            MiningStatus::Abnormal => write!(f, "Abnormal"),
            MiningStatus::Severe => write!(f, "Severe"),
        }
    }
}

/// Evaluates the mining status of a round
#[derive(Debug, Clone, Copy)]
pub struct MiningStatusEvaluator {
    lib_round_number: u64,
    current_round_number: u64,
    maximum_tiny_blocks_count: u64,
}

impl MiningStatusEvaluator {
    pub fn new(
        lib_round_number: u64,
        current_round_number: u64,
        maximum_tiny_blocks_count: u64,
    ) -> Self {
        Self {
            lib_round_number,
            current_round_number,
            maximum_tiny_blocks_count,
        }
    }

    /// Lag at which the status becomes severe
    pub fn severe_status_rounds_threshold(&self) -> u64 {
        MAXIMUM_TINY_BLOCKS_COUNT.max(self.maximum_tiny_blocks_count)
    }

    fn lag(&self) -> u64 {
        self.current_round_number
            .saturating_sub(self.lib_round_number)
    }

    pub fn status(&self) -> MiningStatus {
        if self.lib_round_number.saturating_add(2) >= self.current_round_number {
            MiningStatus::Normal
        } else if self.lag() >= self.severe_status_rounds_threshold() {
            MiningStatus::Severe
        } else {
            MiningStatus::Abnormal
        }
    }

    /// Ceiling of blocks one miner may produce in a row.
    ///
    /// `miners_of_last_two_rounds` counts miners that mined in both of the
    /// two previous rounds and only matters for the abnormal status.
    pub fn maximum_blocks_count(&self, miners_count: usize, miners_of_last_two_rounds: usize) -> u64 {
        match self.status() {
            MiningStatus::Normal => self.maximum_tiny_blocks_count,
            MiningStatus::Severe => 1,
            MiningStatus::Abnormal => {
                let remaining = self.severe_status_rounds_threshold() - self.lag();
                let factor = u128::from(miners_of_last_two_rounds as u64) * u128::from(remaining);
                let count = u128::from(miners_count.max(1) as u64);
                let scaled = factor.div_ceil(count);
                let ceiling = u64::try_from(scaled).unwrap_or(u64::MAX);
                ceiling.clamp(1, self.maximum_tiny_blocks_count.max(1))
            }
        }
    }
}

/// Latest miner and how many more blocks it may produce in a row
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LatestProviderToTinyBlocksCount {
    pub pubkey: Pubkey,
    pub blocks_count: i64,
}

impl LatestProviderToTinyBlocksCount {
    /// Counter after `sender` produces one more block under `ceiling`.
    ///
    /// A negative count means the block exceeds the limit.
    pub fn projected(current: Option<&Self>, sender: &Pubkey, ceiling: u64) -> Self {
        let fresh = i64::try_from(ceiling).unwrap_or(i64::MAX) - 1;
        let blocks_count = match current {
            Some(latest) if latest.pubkey == *sender => latest.blocks_count.min(fresh) - 1,
            _ => fresh,
        };
        Self {
            pubkey: sender.clone(),
            blocks_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> Pubkey {
        Pubkey::new(vec![0x02, b])
    }

    #[test]
    fn test_status_thresholds() {
        assert_eq!(MiningStatusEvaluator::new(10, 12, 8).status(), MiningStatus::Normal);
        assert_eq!(MiningStatusEvaluator::new(10, 13, 8).status(), MiningStatus::Abnormal);
        assert_eq!(MiningStatusEvaluator::new(10, 17, 8).status(), MiningStatus::Abnormal);
        assert_eq!(MiningStatusEvaluator::new(10, 18, 8).status(), MiningStatus::Severe);
        // No LIB yet at the start of the chain
        assert_eq!(MiningStatusEvaluator::new(0, 2, 8).status(), MiningStatus::Normal);
    }

    #[test]
    fn test_maximum_blocks_count() {
        assert_eq!(MiningStatusEvaluator::new(10, 11, 8).maximum_blocks_count(5, 0), 8);
        assert_eq!(MiningStatusEvaluator::new(10, 30, 8).maximum_blocks_count(5, 5), 1);

        // Lag 3: remaining 5, all 5 miners active
        assert_eq!(MiningStatusEvaluator::new(10, 13, 8).maximum_blocks_count(5, 5), 5);
        // Lag 7: remaining 1, ceil(3 / 5)
        assert_eq!(MiningStatusEvaluator::new(10, 17, 8).maximum_blocks_count(5, 3), 1);
        // Nobody active still allows one block
        assert_eq!(MiningStatusEvaluator::new(10, 13, 8).maximum_blocks_count(5, 0), 1);
    }

    #[test]
    fn test_counter_for_new_miner() {
        let latest = LatestProviderToTinyBlocksCount {
            pubkey: key(1),
            blocks_count: 0,
        };
        let next = LatestProviderToTinyBlocksCount::projected(Some(&latest), &key(2), 8);
        assert_eq!(next.pubkey, key(2));
        assert_eq!(next.blocks_count, 7);
        assert_eq!(LatestProviderToTinyBlocksCount::projected(None, &key(2), 1).blocks_count, 0);
    }

    #[test]
    fn test_counter_exhausts_after_ceiling() {
        let mut latest: Option<LatestProviderToTinyBlocksCount> = None;
        for _ in 0..8 {
            let next = LatestProviderToTinyBlocksCount::projected(latest.as_ref(), &key(1), 8);
            assert!(next.blocks_count >= 0);
            latest = Some(next);
        }
        let ninth = LatestProviderToTinyBlocksCount::projected(latest.as_ref(), &key(1), 8);
        assert!(ninth.blocks_count < 0);
    }

    #[test]
    fn test_lowered_ceiling_applies_immediately() {
        let latest = LatestProviderToTinyBlocksCount {
            pubkey: key(1),
            blocks_count: 6,
        };
        let next = LatestProviderToTinyBlocksCount::projected(Some(&latest), &key(1), 1);
        assert_eq!(next.blocks_count, -1);
    }
}
