//! Evil miner detection
//!
//! A miner that keeps missing its time slots is reported to the election
//! side. Detection never touches the round; the miner leaves the committee
//! through a replacement or the next term's election.

use crate::round::Round;
use dpos_core::Pubkey;
use serde::{Deserialize, Serialize};

/// A miner over the missed time slot tolerance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvilMinerReport {
    /// Reported miner
    pub pubkey: Pubkey,
    /// Missed time slots during the term
    pub missed_time_slots: u64,
    /// Round in which the miner was detected
    pub round_number: u64,
    /// Term in which the miner was detected
    pub term_number: u64,
}

/// Scans closing rounds for miners that missed too many time slots
#[derive(Debug, Clone, Copy)]
pub struct EvilMinerDetector {
    /// Missed time slots tolerated before a miner is reported
    tolerable_missed_time_slots: u64,
}

impl EvilMinerDetector {
    /// Create a new detector
    pub fn new(tolerable_missed_time_slots: u64) -> Self {
        Self {
            tolerable_missed_time_slots,
        }
    }

    pub fn tolerable_missed_time_slots(&self) -> u64 {
        self.tolerable_missed_time_slots
    }

    /// Whether a missed slot count is beyond the tolerance. Strict: a miner
    /// that missed exactly the tolerated number of slots is not evil.
    pub fn is_evil(&self, missed_time_slots: u64) -> bool {
        missed_time_slots > self.tolerable_missed_time_slots
    }

    /// Miners of `round` over the tolerance, in key order.
    pub fn detect(&self, round: &Round) -> Vec<EvilMinerReport> {
        round
            .miners
            .values()
            .filter(|miner| self.is_evil(miner.missed_time_slots))
            .map(|miner| EvilMinerReport {
                pubkey: miner.pubkey.clone(),
                missed_time_slots: miner.missed_time_slots,
                round_number: round.round_number,
                term_number: round.term_number,
            })
            .collect()
    }
}
