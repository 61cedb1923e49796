//! Consensus state store
//!
//! Rounds are replaced as whole records. Retired rounds stay addressable
//! for LIB estimation and audits.

use crate::mining_status::{LatestProviderToTinyBlocksCount, MiningStatus, MiningStatusEvaluator};
use crate::round::Round;
use crate::term::MinerList;
use crate::{ConsensusError, ConsensusResult};
use dpos_core::{BlockHeight, Pubkey, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Everything consensus persists between blocks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsensusState {
    /// Rounds by number
    pub rounds: BTreeMap<u64, Round>,
    pub current_round_number: u64,
    pub current_term_number: u64,
    /// Committee of each term
    pub miner_lists: BTreeMap<u64, MinerList>,
    /// First round number of each term
    pub first_round_numbers: BTreeMap<u64, u64>,
    /// Miners that published an OutValue, by round
    pub mined_miners: BTreeMap<u64, BTreeSet<Pubkey>>,
    /// Continuous block counter
    pub latest_provider_to_tiny_blocks_count: Option<LatestProviderToTinyBlocksCount>,
    /// Height of the latest block that changed consensus state
    pub latest_executed_height: Option<BlockHeight>,
    /// Chain start in milliseconds
    pub blockchain_start_timestamp: Timestamp,
    /// Committee size hint of the latest term
    pub miners_count: usize,
}

impl ConsensusState {
    pub fn new(blockchain_start_timestamp: Timestamp) -> Self {
        Self {
            blockchain_start_timestamp,
            ..Self::default()
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.current_round_number > 0
    }

    pub fn round(&self, round_number: u64) -> Option<&Round> {
        self.rounds.get(&round_number)
    }

    pub fn current_round(&self) -> ConsensusResult<&Round> {
        self.rounds
            .get(&self.current_round_number)
            .ok_or(ConsensusError::RoundNotFound {
                round_number: self.current_round_number,
            })
    }

    /// Round before the current one, `None` in the first round
    pub fn previous_round(&self) -> Option<&Round> {
        self.current_round_number
            .checked_sub(1)
            .and_then(|number| self.rounds.get(&number))
    }

    pub fn miner_list(&self, term_number: u64) -> Option<&MinerList> {
        self.miner_lists.get(&term_number)
    }

    pub fn first_round_of_term(&self, term_number: u64) -> ConsensusResult<&Round> {
        let round_number = self
            .first_round_numbers
            .get(&term_number)
            .ok_or(ConsensusError::TermNotFound { term_number })?;
        self.round(*round_number).ok_or(ConsensusError::RoundNotFound {
            round_number: *round_number,
        })
    }

    pub fn is_first_round_of_current_term(&self) -> bool {
        self.first_round_numbers.get(&self.current_term_number) == Some(&self.current_round_number)
    }

    /// Reject a second consensus mutation at `height`.
    pub fn ensure_not_executed(&self, height: BlockHeight) -> ConsensusResult<()> {
        if self.latest_executed_height == Some(height) {
            return Err(ConsensusError::AlreadyExecutedAtHeight { height });
        }
        Ok(())
    }

    /// Make `round` the current round.
    ///
    /// Round numbers advance by exactly one, term numbers by at most one. A
    /// new term records its committee and first round.
    pub fn add_round(&mut self, round: Round) -> ConsensusResult<()> {
        if self.is_initialized() && round.round_number != self.current_round_number + 1 {
            return Err(ConsensusError::InvalidRound(format!(
                "Round {} cannot follow round {}",
                round.round_number, self.current_round_number
            )));
        }
        let new_term = round.term_number != self.current_term_number;
        if self.is_initialized() && new_term && round.term_number != self.current_term_number + 1 {
            return Err(ConsensusError::InvalidRound(format!(
                "Term {} cannot follow term {}",
                round.term_number, self.current_term_number
            )));
        }

        if new_term || round.is_miner_list_just_changed {
            self.miner_lists
                .insert(round.term_number, MinerList::new(round.miner_list()));
        }
        if new_term {
            self.first_round_numbers
                .insert(round.term_number, round.round_number);
        }

        self.current_round_number = round.round_number;
        self.current_term_number = round.term_number;
        self.rounds.insert(round.round_number, round);
        Ok(())
    }

    /// Replace a stored round as a whole.
    pub fn replace_round(&mut self, round: Round) -> ConsensusResult<()> {
        if !self.rounds.contains_key(&round.round_number) {
            return Err(ConsensusError::RoundNotFound {
                round_number: round.round_number,
            });
        }
        self.rounds.insert(round.round_number, round);
        Ok(())
    }

    /// Remember who mined in a closing round
    pub fn record_mined_miners(&mut self, round: &Round) {
        let miners = round
            .mined_miners()
            .into_iter()
            .map(|m| m.pubkey.clone())
            .collect();
        self.mined_miners.insert(round.round_number, miners);
    }

    /// Miners that mined in both rounds before the current one
    pub fn miners_of_last_two_rounds(&self) -> usize {
        let current = self.current_round_number;
        let (Some(previous), Some(before)) = (
            current.checked_sub(1).and_then(|n| self.mined_miners.get(&n)),
            current.checked_sub(2).and_then(|n| self.mined_miners.get(&n)),
        ) else {
            return 0;
        };
        previous.intersection(before).count()
    }

    /// Fresh continuous block ceiling and the status it came from
    pub fn maximum_blocks_count(&self, maximum_tiny_blocks_count: u64) -> ConsensusResult<(u64, MiningStatus)> {
        let current = self.current_round()?;
        let evaluator = MiningStatusEvaluator::new(
            current.confirmed_irreversible_block_round_number,
            current.round_number,
            maximum_tiny_blocks_count,
        );
        let ceiling =
            evaluator.maximum_blocks_count(current.miners_count(), self.miners_of_last_two_rounds());
        Ok((ceiling, evaluator.status()))
    }

    /// Advance the continuous block counter for a block by `sender`
    pub fn update_latest_provider(&mut self, sender: &Pubkey, ceiling: u64) {
        self.latest_provider_to_tiny_blocks_count = Some(LatestProviderToTinyBlocksCount::projected(
            self.latest_provider_to_tiny_blocks_count.as_ref(),
            sender,
            ceiling,
        ));
    }

    /// Move a miner to a new key in the current round and term
    pub fn replace_pubkey(&mut self, old: &Pubkey, new: &Pubkey) -> ConsensusResult<()> {
        let mut round = self.current_round()?.clone();
        let mut record = round
            .miners
            .remove(old)
            .ok_or_else(|| ConsensusError::MinerNotFound(old.clone()))?;
        if round.contains(new) {
            return Err(ConsensusError::InvalidRound(format!(
                "{} is already a miner",
                new
            )));
        }
        record.pubkey = new.clone();
        round.miners.insert(new.clone(), record);
        if round.extra_block_producer_of_previous_round.as_ref() == Some(old) {
            round.extra_block_producer_of_previous_round = Some(new.clone());
        }
        self.replace_round(round)?;

        if let Some(list) = self.miner_lists.get_mut(&self.current_term_number) {
            for key in list.pubkeys.iter_mut() {
                if key == old {
                    *key = new.clone();
                }
            }
        }
        Ok(())
    }
}
