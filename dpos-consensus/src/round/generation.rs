//! Next round generation

use super::recover::count_block;
use super::{MinerInRound, Round};
use crate::signature::supposed_order;
use crate::{ConsensusError, ConsensusResult};
use dpos_core::{Pubkey, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// An in-term swap of an evil miner for an elected alternative
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerReplacement {
    /// Miner leaving the committee
    pub evil: Pubkey,
    /// Miner taking over its slot
    pub alternative: Pubkey,
}

impl Round {
    /// Build the round that follows this one, terminated by `sender` at
    /// `block_time`.
    ///
    /// Miners that published a signature take the final order they claimed
    /// when it is valid and unclaimed. Everybody else fills the remaining
    /// orders by current order, and miners that did not mine get a missed
    /// time slot.
    pub fn generate_next_round(
        &self,
        block_time: Timestamp,
        sender: &Pubkey,
    ) -> ConsensusResult<Round> {
        let miners_count = self.miners_count();
        if miners_count == 0 {
            return Err(ConsensusError::InvalidRound(
                "Cannot generate a round without miners".to_string(),
            ));
        }
        let count = u32::try_from(miners_count)
            .map_err(|_| ConsensusError::Overflow("committee size".to_string()))?;
        let interval = self.mining_interval();
        if interval == 0 {
            return Err(ConsensusError::InvalidRound(
                "Mining interval must be greater than 0".to_string(),
            ));
        }

        let mut next = Round {
            round_number: self.round_number + 1,
            term_number: self.term_number,
            extra_block_producer_of_previous_round: Some(sender.clone()),
            confirmed_irreversible_block_height: self.confirmed_irreversible_block_height,
            confirmed_irreversible_block_round_number: self
                .confirmed_irreversible_block_round_number,
            blockchain_age: self.blockchain_age,
            ..Round::default()
        };

        let mut mined = self.mined_miners();
        mined.sort_by(|a, b| {
            a.final_order_of_next_round
                .cmp(&b.final_order_of_next_round)
                .then_with(|| a.pubkey.cmp(&b.pubkey))
        });

        let mut occupied = BTreeSet::new();
        let mut unplaced = self.not_mined_miners();
        for miner in mined {
            let order = miner.final_order_of_next_round;
            if order >= 1 && order <= count && occupied.insert(order) {
                let record = next_record(miner, order, block_time, interval, false)?;
                next.miners.insert(record.pubkey.clone(), record);
            } else {
                unplaced.push(miner);
            }
        }

        unplaced.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.pubkey.cmp(&b.pubkey)));
        let free_orders = (1..=count).filter(|order| !occupied.contains(order));
        for (miner, order) in unplaced.into_iter().zip(free_orders) {
            let record = next_record(miner, order, block_time, interval, !miner.has_out_value())?;
            next.miners.insert(record.pubkey.clone(), record);
        }

        let extra_block_producer_order = self.calculate_next_extra_block_producer_order();
        for miner in next.miners.values_mut() {
            miner.is_extra_block_producer = miner.order == extra_block_producer_order;
        }

        self.break_continuous_mining(&mut next);

        if let Some(miner) = next.miners.get_mut(sender) {
            count_block(miner, block_time)?;
        }

        debug!(
            "Generated round {} with extra block producer order {}",
            next.round_number, extra_block_producer_order
        );
        Ok(next)
    }

    /// Order of the next round's extra block producer, taken from the
    /// signature of the first miner in order that published one.
    pub fn calculate_next_extra_block_producer_order(&self) -> u32 {
        self.ordered_miners()
            .into_iter()
            .find(|miner| miner.has_signature())
            .and_then(|miner| miner.signature)
            .map(|signature| supposed_order(&signature, self.miners_count()))
            .unwrap_or(1)
    }

    /// Avoid one miner producing the last blocks of a round and the first
    /// blocks of the next.
    fn break_continuous_mining(&self, next: &mut Round) {
        let count = next.miners_count();
        if count <= 2 {
            return;
        }
        let Ok(last_order) = u32::try_from(count) else {
            return;
        };

        if let Some(current_producer) = self.extra_block_producer() {
            let first_is_producer = next
                .miners
                .values()
                .any(|m| m.order == 1 && m.pubkey == current_producer.pubkey);
            if first_is_producer {
                swap_orders(next, 1, 2);
            }
        }

        let last_is_producer = next
            .miners
            .values()
            .any(|m| m.order == last_order && m.is_extra_block_producer);
        if last_is_producer {
            swap_orders(next, last_order, last_order - 1);
        }
    }

    /// Swap evil miners of this round for their alternatives.
    ///
    /// The alternative takes over the slot as is. Returns the replacements
    /// that were applied.
    pub fn replace_miners(&mut self, replacements: &[MinerReplacement]) -> Vec<MinerReplacement> {
        let mut applied = Vec::new();
        for replacement in replacements {
            if self.contains(&replacement.alternative) {
                continue;
            }
            let Some(evil) = self.miners.remove(&replacement.evil) else {
                continue;
            };
            let alternative = MinerInRound {
                pubkey: replacement.alternative.clone(),
                order: evil.order,
                is_extra_block_producer: evil.is_extra_block_producer,
                expected_mining_time: evil.expected_mining_time,
                previous_in_value: evil.previous_in_value,
                ..MinerInRound::default()
            };
            self.miners.insert(alternative.pubkey.clone(), alternative);
            applied.push(replacement.clone());
        }
        if !applied.is_empty() {
            self.is_miner_list_just_changed = true;
        }
        applied
    }
}

fn next_record(
    miner: &MinerInRound,
    order: u32,
    block_time: Timestamp,
    interval: u64,
    missed: bool,
) -> ConsensusResult<MinerInRound> {
    let expected_mining_time = interval
        .checked_mul(u64::from(order))
        .and_then(|offset| block_time.checked_add(offset))
        .ok_or_else(|| ConsensusError::Overflow("expected mining time".to_string()))?;
    Ok(MinerInRound {
        pubkey: miner.pubkey.clone(),
        order,
        expected_mining_time,
        produced_blocks: miner.produced_blocks,
        missed_time_slots: miner.missed_time_slots.saturating_add(u64::from(missed)),
        ..MinerInRound::default()
    })
}

fn swap_orders(round: &mut Round, a: u32, b: u32) {
    let key_a = round.miners.values().find(|m| m.order == a).map(|m| m.pubkey.clone());
    let key_b = round.miners.values().find(|m| m.order == b).map(|m| m.pubkey.clone());
    let (Some(key_a), Some(key_b)) = (key_a, key_b) else {
        return;
    };
    let time_a = round.miners.get(&key_a).map(|m| m.expected_mining_time);
    let time_b = round.miners.get(&key_b).map(|m| m.expected_mining_time);
    if let (Some(miner), Some(time)) = (round.miners.get_mut(&key_a), time_b) {
        miner.order = b;
        miner.expected_mining_time = time;
    }
    if let (Some(miner), Some(time)) = (round.miners.get_mut(&key_b), time_a) {
        miner.order = a;
        miner.expected_mining_time = time;
    }
}
