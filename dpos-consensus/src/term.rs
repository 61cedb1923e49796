//! Term transition
//!
//! A new term rebuilds the committee from the elected miner list. The order
//! is a total sort over the keys, so every node derives the same schedule
//! even when keys share their first byte.

use crate::round::{MinerInRound, Round};
use crate::{ConsensusError, ConsensusResult};
use dpos_core::{Pubkey, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeSet;
use tracing::debug;

/// Committee of one term, in election order
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MinerList {
    pub pubkeys: Vec<Pubkey>,
}

impl MinerList {
    /// Deduplicate and sort by first byte, then by the whole key, both
    /// descending.
    pub fn new(pubkeys: impl IntoIterator<Item = Pubkey>) -> Self {
        let unique: BTreeSet<Pubkey> = pubkeys.into_iter().filter(|k| !k.is_empty()).collect();
        let mut pubkeys: Vec<Pubkey> = unique.into_iter().collect();
        pubkeys.sort_by_key(|key| Reverse((key.first_byte(), key.clone())));
        Self { pubkeys }
    }

    pub fn len(&self) -> usize {
        self.pubkeys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pubkeys.is_empty()
    }

    pub fn contains(&self, pubkey: &Pubkey) -> bool {
        self.pubkeys.contains(pubkey)
    }

    /// Build the first round of the term following `current_round`.
    ///
    /// Without a current round this is the first round of the chain. The
    /// first miner in order produces the extra block, the confirmed LIB is
    /// carried over and every counter starts from zero.
    pub fn generate_first_round_of_new_term(
        &self,
        mining_interval: u64,
        block_time: Timestamp,
        current_round: Option<&Round>,
        sender: Option<&Pubkey>,
    ) -> ConsensusResult<Round> {
        if self.is_empty() {
            return Err(ConsensusError::InvalidRound(
                "Miner list of a new term is empty".to_string(),
            ));
        }
        if mining_interval == 0 {
            return Err(ConsensusError::InvalidRound(
                "Mining interval must be greater than 0".to_string(),
            ));
        }

        let mut round = match current_round {
            Some(current) => Round {
                round_number: current.round_number + 1,
                term_number: current.term_number + 1,
                confirmed_irreversible_block_height: current.confirmed_irreversible_block_height,
                confirmed_irreversible_block_round_number: current
                    .confirmed_irreversible_block_round_number,
                is_miner_list_just_changed: true,
                extra_block_producer_of_previous_round: sender.cloned(),
                blockchain_age: current.blockchain_age,
                ..Round::default()
            },
            None => Round {
                round_number: 1,
                term_number: 1,
                ..Round::default()
            },
        };

        for (i, pubkey) in self.pubkeys.iter().enumerate() {
            let order = u32::try_from(i + 1)
                .map_err(|_| ConsensusError::Overflow("committee size".to_string()))?;
            let expected_mining_time = mining_interval
                .checked_mul(u64::from(order))
                .and_then(|offset| block_time.checked_add(offset))
                .ok_or_else(|| ConsensusError::Overflow("expected mining time".to_string()))?;
            let mut miner = MinerInRound::new(pubkey.clone(), order, expected_mining_time);
            miner.is_extra_block_producer = i == 0;
            round.miners.insert(pubkey.clone(), miner);
        }

        if let Some(miner) = sender.and_then(|key| round.miners.get_mut(key)) {
            miner.produced_blocks = 1;
            miner.produced_tiny_blocks = 1;
            miner.actual_mining_times.push(block_time);
        }

        debug!(
            "Generated first round {} of term {} with {} miners",
            round.round_number,
            round.term_number,
            round.miners_count()
        );
        Ok(round)
    }
}

/// Committee size the election should aim for after `elapsed_seconds`.
///
/// Grows by two miners per `increase_interval`, capped at `maximum`.
pub fn miners_count_hint(
    supposed: usize,
    maximum: usize,
    increase_interval: u64,
    elapsed_seconds: u64,
) -> ConsensusResult<usize> {
    if increase_interval == 0 {
        return Err(ConsensusError::Config(
            "Miner increase interval must be greater than 0".to_string(),
        ));
    }
    let increase = u128::from(elapsed_seconds)
        .checked_mul(2)
        .ok_or_else(|| ConsensusError::Overflow("miners count increase".to_string()))?
        / u128::from(increase_interval);
    let total = (supposed as u128)
        .checked_add(increase)
        .ok_or_else(|| ConsensusError::Overflow("miners count".to_string()))?;
    Ok(usize::try_from(total.min(maximum as u128)).unwrap_or(maximum))
}
