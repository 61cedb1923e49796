//! Consensus behaviors and the behavior selector

use crate::round::Round;
use dpos_core::{Pubkey, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a miner does with its next block
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Behavior {
    /// Produce nothing
    Nothing,
    /// First block of a time slot, publishing OutValue and Signature
    UpdateValue,
    /// Another block inside an already claimed time slot
    TinyBlock,
    /// Terminate the round
    NextRound,
    /// Terminate the round and the term
    NextTerm,
}

impl Behavior {
    /// Every behavior, in declaration order
    pub const ALL: [Behavior; 5] = [
        Behavior::Nothing,
        Behavior::UpdateValue,
        Behavior::TinyBlock,
        Behavior::NextRound,
        Behavior::NextTerm,
    ];

    /// Whether this behavior opens a new round
    pub fn is_round_terminating(&self) -> bool {
        matches!(self, Behavior::NextRound | Behavior::NextTerm)
    }
}

impl fmt::Display for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Behavior::Nothing => write!(f, "Nothing"),
            Behavior::UpdateValue => write!(f, "UpdateValue"),
            Behavior::TinyBlock => write!(f, "TinyBlock"),
            Behavior::NextRound => write!(f, "NextRound"),
            Behavior::NextTerm => write!(f, "NextTerm"),
        }
    }
}

/// Decides a miner's behavior from the current round.
///
/// The result is a suggestion to the miner; proposals are validated
/// independently.
#[derive(Debug, Clone)]
pub struct BehaviorProvider<'a> {
    pub current_round: &'a Round,
    pub pubkey: &'a Pubkey,
    /// Fresh ceiling of blocks in a row
    pub maximum_blocks_count: u64,
    pub current_block_time: Timestamp,
    pub blockchain_start_timestamp: Timestamp,
    pub period_seconds: u64,
}

impl BehaviorProvider<'_> {
    pub fn behavior(&self) -> Behavior {
        let round = self.current_round;
        let Some(miner) = round.miner(self.pubkey) else {
            return Behavior::Nothing;
        };
        let now = self.current_block_time;
        let slot_passed = round.is_time_slot_passed(self.pubkey, now);

        if !miner.has_out_value() {
            // The first round is scheduled from configuration, so nobody but
            // the first miner opens it
            if round.round_number == 1 && miner.order != 1 {
                let first_mined = round.first_miner().is_some_and(|first| first.has_out_value());
                if !first_mined {
                    return self.round_terminating_behavior();
                }
            }
            if now < miner.expected_mining_time {
                return Behavior::Nothing;
            }
            if !slot_passed {
                return Behavior::UpdateValue;
            }
        } else if !slot_passed && miner.produced_tiny_blocks < self.tiny_blocks_budget() {
            return Behavior::TinyBlock;
        }

        self.round_terminating_behavior()
    }

    /// Ceiling plus the blocks the previous extra block producer already
    /// produced before this round started.
    fn tiny_blocks_budget(&self) -> u64 {
        let round = self.current_round;
        let is_previous_producer =
            round.extra_block_producer_of_previous_round.as_ref() == Some(self.pubkey);
        if !is_previous_producer || round.is_miner_list_just_changed {
            return self.maximum_blocks_count;
        }
        let round_start = round.round_start_time();
        let before_start = round
            .miner(self.pubkey)
            .map(|m| m.actual_mining_times.iter().filter(|t| **t < round_start).count())
            .unwrap_or_default();
        self.maximum_blocks_count + before_start as u64
    }

    fn round_terminating_behavior(&self) -> Behavior {
        let round = self.current_round;
        if round.round_number == 1
            || !round.need_to_change_term(
                self.blockchain_start_timestamp,
                round.term_number,
                self.period_seconds,
            )
        {
            Behavior::NextRound
        } else {
            Behavior::NextTerm
        }
    }
}

/// Behavior plus when to act on it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusCommand {
    pub behavior: Behavior,
    /// When to produce the block, or to ask again for `Nothing`
    pub arranged_mining_time: Timestamp,
    /// Latest time the block is still useful
    pub mining_due_time: Timestamp,
}

impl ConsensusCommand {
    /// Arrange the timing of `behavior` for `pubkey` at `now`.
    pub fn arrange(behavior: Behavior, round: &Round, pubkey: &Pubkey, now: Timestamp) -> Self {
        let interval = round.mining_interval();
        let expected = round.miner(pubkey).map(|m| m.expected_mining_time);
        let arranged_mining_time = match (behavior, expected) {
            (Behavior::UpdateValue, Some(expected)) => expected.max(now),
            (Behavior::TinyBlock, _) => now,
            (Behavior::NextRound | Behavior::NextTerm, _) => {
                round.arrange_terminating_mining_time(pubkey, now)
            }
            (Behavior::Nothing, Some(expected)) if expected > now => expected,
            _ => round.arrange_terminating_mining_time(pubkey, now),
        };
        let mining_due_time = match (behavior, expected) {
            (Behavior::UpdateValue | Behavior::TinyBlock, Some(expected)) => {
                expected.saturating_add(interval)
            }
            _ => arranged_mining_time.saturating_add(interval),
        };
        Self {
            behavior,
            arranged_mining_time,
            mining_due_time,
        }
    }
}
