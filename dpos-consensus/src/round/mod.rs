//! Round data model
//!
//! A [`Round`] is the scheduling snapshot of one committee rotation. Every
//! node must derive byte-identical rounds from the same inputs, so miners
//! are kept in a `BTreeMap` keyed by public key and every ordering helper
//! sorts by an explicit, fully-ordering key.

mod generation;
mod recover;

pub use generation::MinerReplacement;

use crate::config::DEFAULT_MINING_INTERVAL;
use crate::secret_sharing::SecretShare;
use crate::validation::ValidationResult;
use crate::ConsensusResult;
use dpos_core::{BlockHeight, Hash, Pubkey, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Scheduling record of one committee member inside a round.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, bincode::Encode)]
pub struct MinerInRound {
    /// Miner public key
    pub pubkey: Pubkey,
    /// Position in the current round, starting from 1
    pub order: u32,
    /// Whether this miner terminates the round
    pub is_extra_block_producer: bool,
    /// Secret of this round. Only present in a round being closed.
    pub in_value: Option<Hash>,
    /// Commitment of this round's secret
    pub out_value: Option<Hash>,
    /// Ordering seed for the next round
    pub signature: Option<Hash>,
    /// Secret of the previous round, revealed one round late
    pub previous_in_value: Option<Hash>,
    /// Start of this miner's time slot
    pub expected_mining_time: Timestamp,
    /// Block times of every block produced in this round
    pub actual_mining_times: Vec<Timestamp>,
    /// Blocks produced during the current term
    pub produced_blocks: u64,
    /// Blocks produced during this round
    pub produced_tiny_blocks: u64,
    /// Height this miner considers irreversible
    pub implied_irreversible_block_height: BlockHeight,
    /// Order derived from the signature
    pub supposed_order_of_next_round: u32,
    /// Order after conflict resolution
    pub final_order_of_next_round: u32,
    /// Time slots missed during the current term
    pub missed_time_slots: u64,
    /// Shares of this miner's secret, keyed by the miner that decrypted them
    pub decrypted_pieces: BTreeMap<Pubkey, SecretShare>,
}

impl MinerInRound {
    /// Create a scheduling record
    pub fn new(pubkey: Pubkey, order: u32, expected_mining_time: Timestamp) -> Self {
        Self {
            pubkey,
            order,
            expected_mining_time,
            ..Self::default()
        }
    }

    /// Whether an OutValue was published in this round
    pub fn has_out_value(&self) -> bool {
        is_filled(&self.out_value)
    }

    /// Whether a Signature was published in this round
    pub fn has_signature(&self) -> bool {
        is_filled(&self.signature)
    }

    /// Whether the previous round's secret is known
    pub fn has_previous_in_value(&self) -> bool {
        is_filled(&self.previous_in_value)
    }

    /// Time of the latest block produced in this round
    pub fn latest_actual_mining_time(&self) -> Option<Timestamp> {
        self.actual_mining_times.last().copied()
    }
}

/// A hash counts as published only when present and non-zero.
pub(crate) fn is_filled(value: &Option<Hash>) -> bool {
    matches!(value, Some(hash) if !hash.is_zero())
}

/// Committee scheduling state of one round.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, bincode::Encode)]
pub struct Round {
    /// Round number, increases by one per round
    pub round_number: u64,
    /// Term number, increases by one per term
    pub term_number: u64,
    /// Committee members
    pub miners: BTreeMap<Pubkey, MinerInRound>,
    /// Miner that terminated the previous round
    pub extra_block_producer_of_previous_round: Option<Pubkey>,
    /// Latest confirmed irreversible height
    pub confirmed_irreversible_block_height: BlockHeight,
    /// Round in which the confirmed height was reached
    pub confirmed_irreversible_block_round_number: u64,
    /// Committee differs from the previous round's
    pub is_miner_list_just_changed: bool,
    /// Seconds since chain start when this round was generated
    pub blockchain_age: u64,
}

impl Round {
    /// Number of committee members
    pub fn miners_count(&self) -> usize {
        self.miners.len()
    }

    /// Check if a pubkey belongs to the committee
    pub fn contains(&self, pubkey: &Pubkey) -> bool {
        self.miners.contains_key(pubkey)
    }

    /// Get a miner's record
    pub fn miner(&self, pubkey: &Pubkey) -> Option<&MinerInRound> {
        self.miners.get(pubkey)
    }

    /// Get a miner's record mutably
    pub fn miner_mut(&mut self, pubkey: &Pubkey) -> Option<&mut MinerInRound> {
        self.miners.get_mut(pubkey)
    }

    /// Committee members in key order
    pub fn miner_list(&self) -> Vec<Pubkey> {
        self.miners.keys().cloned().collect()
    }

    /// Miners sorted by order, ties broken by key
    pub fn ordered_miners(&self) -> Vec<&MinerInRound> {
        let mut miners: Vec<&MinerInRound> = self.miners.values().collect();
        miners.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.pubkey.cmp(&b.pubkey)));
        miners
    }

    /// Miner with order 1
    pub fn first_miner(&self) -> Option<&MinerInRound> {
        self.ordered_miners().into_iter().next()
    }

    /// Miner producing the extra block of this round
    pub fn extra_block_producer(&self) -> Option<&MinerInRound> {
        self.miners.values().find(|m| m.is_extra_block_producer)
    }

    /// Content derived identifier of the schedule
    pub fn round_id(&self) -> u64 {
        self.miners
            .values()
            .fold(0u64, |acc, m| acc.wrapping_add(m.expected_mining_time))
    }

    /// Time slot length derived from the first two miners.
    ///
    /// A single miner round has no spacing to derive from and uses
    /// [`DEFAULT_MINING_INTERVAL`]. Returns 0 when the spacing is not
    /// positive; [`Round::check_round_time_slots`] rejects such rounds.
    pub fn mining_interval(&self) -> u64 {
        let miners = self.ordered_miners();
        if miners.len() < 2 {
            return DEFAULT_MINING_INTERVAL;
        }
        miners[1]
            .expected_mining_time
            .saturating_sub(miners[0].expected_mining_time)
    }

    /// Check that consecutive time slots are evenly spaced and positive.
    pub fn check_round_time_slots(&self) -> ValidationResult {
        let miners = self.ordered_miners();
        if miners.len() < 2 {
            return ValidationResult::success();
        }

        let expected: Vec<i128> = miners
            .iter()
            .map(|m| i128::from(m.expected_mining_time))
            .collect();
        let base_interval = expected[1] - expected[0];
        if base_interval <= 0 {
            return ValidationResult::failure("Mining interval must be greater than 0.");
        }

        for pair in expected.windows(2).skip(1) {
            let interval = pair[1] - pair[0];
            if interval <= 0 {
                return ValidationResult::failure("Mining interval must be greater than 0.");
            }
            if (interval - base_interval).abs() > base_interval {
                return ValidationResult::failure("Time slots are so different.");
            }
        }

        ValidationResult::success()
    }

    /// Expected mining time of the first miner
    pub fn round_start_time(&self) -> Timestamp {
        self.first_miner()
            .map(|m| m.expected_mining_time)
            .unwrap_or_default()
    }

    /// Start of the extra time slot after the last miner
    pub fn extra_block_mining_time(&self) -> Timestamp {
        let last = self
            .ordered_miners()
            .last()
            .map(|m| m.expected_mining_time)
            .unwrap_or_default();
        last.saturating_add(self.mining_interval())
    }

    /// Whether the miner's own time slot is over at `now`
    pub fn is_time_slot_passed(&self, pubkey: &Pubkey, now: Timestamp) -> bool {
        match self.miner(pubkey) {
            Some(miner) => {
                miner.expected_mining_time.saturating_add(self.mining_interval()) < now
            }
            None => false,
        }
    }

    /// Mining time for a miner that terminates the round.
    ///
    /// The extra block producer mines at the extra slot; everyone else
    /// waits `order` slots after it so the producer gets the first chance.
    pub fn arrange_terminating_mining_time(&self, pubkey: &Pubkey, now: Timestamp) -> Timestamp {
        let extra = self.extra_block_mining_time();
        let start = extra.max(now);
        match self.miner(pubkey) {
            Some(miner) if miner.is_extra_block_producer => start,
            Some(miner) => {
                start.saturating_add(self.mining_interval().saturating_mul(u64::from(miner.order)))
            }
            None => start,
        }
    }

    /// Miners that published an OutValue in this round
    pub fn mined_miners(&self) -> Vec<&MinerInRound> {
        self.miners.values().filter(|m| m.has_out_value()).collect()
    }

    /// Miners that did not publish an OutValue in this round
    pub fn not_mined_miners(&self) -> Vec<&MinerInRound> {
        self.miners.values().filter(|m| !m.has_out_value()).collect()
    }

    /// Charge a missed time slot to every miner without an OutValue.
    pub fn count_missed_time_slots(&mut self) {
        for miner in self.miners.values_mut() {
            if !miner.has_out_value() {
                miner.missed_time_slots = miner.missed_time_slots.saturating_add(1);
            }
        }
    }

    /// Two thirds plus one of the committee
    pub fn miners_count_of_consent(&self) -> usize {
        self.miners_count() * 2 / 3 + 1
    }

    /// Whether enough miners produced blocks in a later term period.
    pub fn need_to_change_term(
        &self,
        blockchain_start_timestamp: Timestamp,
        current_term_number: u64,
        period_seconds: u64,
    ) -> bool {
        let agreeing = self
            .miners
            .values()
            .filter_map(|m| m.latest_actual_mining_time())
            .filter(|t| {
                is_time_to_change_term(
                    blockchain_start_timestamp,
                    *t,
                    current_term_number,
                    period_seconds,
                )
            })
            .count();
        agreeing >= self.miners_count_of_consent()
    }

    /// Hash over the fields every node must agree on.
    ///
    /// Actual mining times, decrypted shares and the confirmed LIB pair are
    /// excluded; PreviousInValue is excluded when requested.
    pub fn checkable_hash(&self, include_previous_in_value: bool) -> ConsensusResult<Hash> {
        let mut checkable = self.clone();
        checkable.confirmed_irreversible_block_height = 0;
        checkable.confirmed_irreversible_block_round_number = 0;
        for miner in checkable.miners.values_mut() {
            miner.actual_mining_times.clear();
            miner.decrypted_pieces.clear();
            if !include_previous_in_value {
                miner.previous_in_value = None;
            }
        }
        let encoded = bincode::encode_to_vec(&checkable, bincode::config::standard())?;
        Ok(Hash::compute(&encoded))
    }

    /// Hash of the complete round
    pub fn hash(&self) -> ConsensusResult<Hash> {
        let encoded = bincode::encode_to_vec(self, bincode::config::standard())?;
        Ok(Hash::compute(&encoded))
    }
}

/// Whether a block produced at `block_time` belongs to a later term period.
pub fn is_time_to_change_term(
    blockchain_start_timestamp: Timestamp,
    block_time: Timestamp,
    current_term_number: u64,
    period_seconds: u64,
) -> bool {
    if period_seconds == 0 {
        return false;
    }
    let elapsed_seconds = block_time.saturating_sub(blockchain_start_timestamp) / 1000;
    elapsed_seconds / period_seconds != current_term_number.saturating_sub(1)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn pubkey(i: u8) -> Pubkey {
        let mut bytes = vec![0x02, i];
        bytes.extend_from_slice(&[i; 31]);
        Pubkey::new(bytes)
    }

    /// Round with `count` miners, `interval` ms apart, starting at `start`.
    pub(crate) fn make_round(count: u8, start: Timestamp, interval: u64) -> Round {
        let mut round = Round {
            round_number: 1,
            term_number: 1,
            ..Round::default()
        };
        for i in 0..count {
            let order = u32::from(i) + 1;
            let mut miner =
                MinerInRound::new(pubkey(i), order, start + interval * u64::from(order));
            miner.is_extra_block_producer = i == 0;
            round.miners.insert(miner.pubkey.clone(), miner);
        }
        round
    }

    #[test]
    fn test_mining_interval_and_slots() {
        let round = make_round(5, 1_000, 4_000);
        assert_eq!(round.mining_interval(), 4_000);
        assert_eq!(round.round_start_time(), 5_000);
        assert_eq!(round.extra_block_mining_time(), 25_000);
        assert!(round.check_round_time_slots().success);
    }

    #[test]
    fn test_single_miner_uses_default_interval() {
        let round = make_round(1, 0, 1_000);
        assert_eq!(round.mining_interval(), DEFAULT_MINING_INTERVAL);
        assert!(round.check_round_time_slots().success);
    }

    #[test]
    fn test_uneven_time_slots_rejected() {
        let mut round = make_round(4, 0, 4_000);
        round.miner_mut(&pubkey(3)).unwrap().expected_mining_time = 40_000;
        let result = round.check_round_time_slots();
        assert!(!result.success);
        assert!(result.message.contains("so different"));
    }

    #[test]
    fn test_non_positive_interval_rejected() {
        let mut round = make_round(3, 0, 4_000);
        let first = round.miner(&pubkey(0)).unwrap().expected_mining_time;
        round.miner_mut(&pubkey(1)).unwrap().expected_mining_time = first;
        assert!(!round.check_round_time_slots().success);
    }

    #[test]
    fn test_time_slot_passed() {
        let round = make_round(3, 0, 4_000);
        let key = pubkey(0);
        // Slot of the first miner is [4000, 8000]
        assert!(!round.is_time_slot_passed(&key, 5_000));
        assert!(!round.is_time_slot_passed(&key, 8_000));
        assert!(round.is_time_slot_passed(&key, 8_001));
        assert!(!round.is_time_slot_passed(&pubkey(9), 100_000));
    }

    #[test]
    fn test_terminating_mining_time() {
        let round = make_round(3, 0, 4_000);
        let extra = round.extra_block_mining_time();
        assert_eq!(round.arrange_terminating_mining_time(&pubkey(0), 0), extra);
        assert_eq!(
            round.arrange_terminating_mining_time(&pubkey(2), 0),
            extra + 3 * 4_000
        );
        assert_eq!(
            round.arrange_terminating_mining_time(&pubkey(0), extra + 10),
            extra + 10
        );
    }

    #[test]
    fn test_round_id_tracks_schedule() {
        let round = make_round(3, 0, 4_000);
        assert_eq!(round.round_id(), 4_000 + 8_000 + 12_000);
        let mut shifted = round.clone();
        shifted.miner_mut(&pubkey(0)).unwrap().expected_mining_time += 1;
        assert_ne!(round.round_id(), shifted.round_id());
    }

    #[test]
    fn test_term_change_needs_consent() {
        let mut round = make_round(3, 0, 4_000);
        let period = 60;
        // Consent of 3 miners is 3
        for (i, miner) in round.miners.values_mut().enumerate() {
            miner.actual_mining_times.push(61_000 + i as u64);
        }
        assert!(round.need_to_change_term(0, 1, period));
        assert!(!round.need_to_change_term(0, 2, period));

        round.miner_mut(&pubkey(0)).unwrap().actual_mining_times = vec![1_000];
        assert!(!round.need_to_change_term(0, 1, period));
    }

    #[test]
    fn test_checkable_hash_ignores_volatile_fields() {
        let round = make_round(3, 0, 4_000);
        let mut other = round.clone();
        other.miner_mut(&pubkey(1)).unwrap().actual_mining_times.push(42);
        other.confirmed_irreversible_block_height = 77;
        assert_eq!(
            round.checkable_hash(true).unwrap(),
            other.checkable_hash(true).unwrap()
        );
        assert_ne!(round.hash().unwrap(), other.hash().unwrap());

        other.miner_mut(&pubkey(1)).unwrap().previous_in_value = Some(Hash::compute(b"x"));
        assert_ne!(
            round.checkable_hash(true).unwrap(),
            other.checkable_hash(true).unwrap()
        );
        assert_eq!(
            round.checkable_hash(false).unwrap(),
            other.checkable_hash(false).unwrap()
        );
    }

    #[test]
    fn test_zero_hash_is_not_published() {
        let mut miner = MinerInRound::new(pubkey(1), 1, 0);
        assert!(!miner.has_out_value());
        miner.out_value = Some(Hash::zero());
        assert!(!miner.has_out_value());
        miner.out_value = Some(Hash::compute(b"out"));
        assert!(miner.has_out_value());
    }

    #[test]
    fn test_count_missed_time_slots() {
        let mut round = make_round(3, 0, 4_000);
        round.miner_mut(&pubkey(1)).unwrap().out_value = Some(Hash::compute(b"out"));
        round.miner_mut(&pubkey(2)).unwrap().missed_time_slots = 4;
        round.count_missed_time_slots();
        assert_eq!(round.miner(&pubkey(0)).unwrap().missed_time_slots, 1);
        assert_eq!(round.miner(&pubkey(1)).unwrap().missed_time_slots, 0);
        assert_eq!(round.miner(&pubkey(2)).unwrap().missed_time_slots, 5);
    }
}
