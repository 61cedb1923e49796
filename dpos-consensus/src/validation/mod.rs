//! Validation of consensus header information
//!
//! Before execution a proposal runs through the validator chain of its
//! behavior. After execution the committed round is compared with the
//! header round by checkable hash.

mod validators;

pub use validators::*;

use crate::behavior::Behavior;
use crate::mining_status::LatestProviderToTinyBlocksCount;
use crate::round::{MinerReplacement, Round};
use crate::term::MinerList;
use crate::{ConsensusError, ConsensusResult};
use dpos_core::{BlockHeight, Pubkey, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Outcome of a validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub success: bool,
    pub message: String,
    /// The proposal went stale; regenerate it instead of giving up
    pub is_re_trigger: bool,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            success: true,
            message: String::new(),
            is_re_trigger: false,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            is_re_trigger: false,
        }
    }

    pub fn re_trigger(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            is_re_trigger: true,
        }
    }
}

/// Everything a validator may look at. Lives for one validation call.
#[derive(Debug, Clone)]
pub struct ConsensusValidationContext<'a> {
    /// Committed current round
    pub base_round: &'a Round,
    /// Round carried by the header
    pub provided_round: &'a Round,
    /// Round before the base round
    pub previous_round: Option<&'a Round>,
    pub sender: &'a Pubkey,
    pub behavior: Behavior,
    pub current_term_number: u64,
    /// Height of the block carrying the proposal
    pub current_height: BlockHeight,
    /// Timestamp of the block carrying the proposal
    pub block_time: Timestamp,
    /// Configured mining interval
    pub mining_interval: u64,
    /// Seconds since chain start at the block time
    pub blockchain_age: u64,
    pub is_first_round_of_current_term: bool,
    /// Carried-over continuous block counter
    pub latest_provider_to_tiny_blocks_count: Option<&'a LatestProviderToTinyBlocksCount>,
    /// Freshly computed continuous block ceiling
    pub maximum_blocks_count: u64,
    /// In-term replacements a terminating round must apply
    pub miner_replacements: &'a [MinerReplacement],
    /// Committee of the next term, for NextTerm
    pub next_term_miner_list: Option<&'a MinerList>,
}

impl<'a> ConsensusValidationContext<'a> {
    /// Inputs deciding the round a terminating proposal opens
    pub fn termination(&self) -> RoundTermination<'a> {
        RoundTermination {
            behavior: self.behavior,
            sender: self.sender,
            block_time: self.block_time,
            mining_interval: self.mining_interval,
            blockchain_age: self.blockchain_age,
            miner_replacements: self.miner_replacements,
            next_term_miner_list: self.next_term_miner_list,
        }
    }
}

/// Everything that decides the round opened by NextRound or NextTerm.
///
/// Producer and validators rebuild the round from the same inputs, so a
/// terminating proposal has exactly one acceptable round.
#[derive(Debug, Clone)]
pub struct RoundTermination<'a> {
    pub behavior: Behavior,
    pub sender: &'a Pubkey,
    pub block_time: Timestamp,
    pub mining_interval: u64,
    pub blockchain_age: u64,
    /// In-term replacements, NextRound only
    pub miner_replacements: &'a [MinerReplacement],
    /// Committee of the next term, NextTerm only
    pub next_term_miner_list: Option<&'a MinerList>,
}

impl RoundTermination<'_> {
    /// Build the round that follows `base`
    pub fn expected_round(&self, base: &Round) -> ConsensusResult<Round> {
        let mut next = match self.behavior {
            Behavior::NextRound => {
                let mut next = base.generate_next_round(self.block_time, self.sender)?;
                for replacement in next.replace_miners(self.miner_replacements) {
                    debug!(
                        "Miner {} replaced by {} in round {}",
                        replacement.evil, replacement.alternative, next.round_number
                    );
                }
                next
            }
            Behavior::NextTerm => {
                let miner_list = self.next_term_miner_list.ok_or_else(|| {
                    ConsensusError::InvalidRound("Miner list of next term is unavailable".to_string())
                })?;
                miner_list.generate_first_round_of_new_term(
                    self.mining_interval,
                    self.block_time,
                    Some(base),
                    Some(self.sender),
                )?
            }
            behavior => {
                return Err(ConsensusError::InvalidRound(format!(
                    "{} does not terminate a round",
                    behavior
                )));
            }
        };
        next.blockchain_age = self.blockchain_age;
        Ok(next)
    }
}

/// Compare a terminating proposal with the locally rebuilt round.
///
/// Every field counts, including the confirmed LIB pair, per-miner implied
/// heights and counters.
pub fn check_terminating_round(expected: &Round, provided: &Round) -> ValidationResult {
    if provided.confirmed_irreversible_block_height != expected.confirmed_irreversible_block_height
        || provided.confirmed_irreversible_block_round_number
            != expected.confirmed_irreversible_block_round_number
    {
        return ValidationResult::failure("Confirmed lib information must be carried over");
    }
    for (pubkey, reference) in &expected.miners {
        let Some(miner) = provided.miner(pubkey) else {
            return ValidationResult::failure(format!("Miner {} is missing from next round", pubkey));
        };
        if miner != reference {
            return ValidationResult::failure(format!("Incorrect schedule of {}", pubkey));
        }
    }
    if provided != expected {
        return ValidationResult::failure("Next round differs from the locally generated round");
    }
    ValidationResult::success()
}

/// One independent check of a proposal
pub trait HeaderInformationValidator {
    fn name(&self) -> &'static str;

    fn validate(&self, context: &ConsensusValidationContext<'_>) -> ValidationResult;
}

/// Validator chain of a behavior. Every behavior has a non-empty chain
/// starting with the permission and continuous block checks.
pub fn validators_for(behavior: Behavior) -> Vec<Box<dyn HeaderInformationValidator>> {
    let mut chain: Vec<Box<dyn HeaderInformationValidator>> = vec![
        Box::new(MiningPermissionValidator),
        Box::new(ContinuousBlocksValidator),
    ];
    match behavior {
        Behavior::UpdateValue => {
            chain.push(Box::new(TimeSlotValidator));
            chain.push(Box::new(UpdateValueValidator));
            chain.push(Box::new(LibInformationValidator));
        }
        Behavior::TinyBlock => {
            chain.push(Box::new(TimeSlotValidator));
            chain.push(Box::new(TinyBlockStateValidator));
            chain.push(Box::new(LibInformationValidator));
        }
        Behavior::NextRound => {
            chain.push(Box::new(RoundTerminateValidator));
            chain.push(Box::new(NextRoundMiningOrderValidator));
            chain.push(Box::new(LibInformationValidator));
        }
        Behavior::NextTerm => {
            chain.push(Box::new(RoundTerminateValidator));
            chain.push(Box::new(NextTermMinerListValidator));
            chain.push(Box::new(LibInformationValidator));
        }
        Behavior::Nothing => {
            chain.push(Box::new(NothingRejectedValidator));
        }
    }
    chain
}

/// Run the chain of the context's behavior, stopping at the first failure.
pub fn validate_before_execution(context: &ConsensusValidationContext<'_>) -> ValidationResult {
    for validator in validators_for(context.behavior) {
        let result = validator.validate(context);
        if !result.success {
            debug!(
                "{} rejected {} from {}: {}",
                validator.name(),
                context.behavior,
                context.sender,
                result.message
            );
            return result;
        }
    }
    ValidationResult::success()
}

/// Inputs of the check after execution
#[derive(Debug, Clone)]
pub struct PostExecutionContext<'a> {
    pub sender: &'a Pubkey,
    pub behavior: Behavior,
    /// Round carried by the header
    pub provided_round: Option<&'a Round>,
    /// Current round after execution
    pub state_round: &'a Round,
    /// Round before the current round after execution
    pub previous_round: Option<&'a Round>,
    /// Configured mining interval
    pub mining_interval: u64,
    /// Timestamp of the executed block
    pub block_time: Timestamp,
    /// Seconds since chain start at the block time
    pub blockchain_age: u64,
    /// In-term replacements of the terminated round
    pub miner_replacements: &'a [MinerReplacement],
    /// Committee of the term opened by a NextTerm
    pub next_term_miner_list: Option<&'a MinerList>,
}

impl<'a> PostExecutionContext<'a> {
    fn termination(&self) -> RoundTermination<'a> {
        RoundTermination {
            behavior: self.behavior,
            sender: self.sender,
            block_time: self.block_time,
            mining_interval: self.mining_interval,
            blockchain_age: self.blockchain_age,
            miner_replacements: self.miner_replacements,
            next_term_miner_list: self.next_term_miner_list,
        }
    }
}

/// Confirm the committed round matches the header round.
///
/// The header round is recovered onto a copy of the committed round for
/// UpdateValue and TinyBlock. A NextRound or NextTerm round is rebuilt from
/// the terminated round and must match the header exactly. A mismatch is tolerated only when the header
/// still lists miners that were replaced since, and every miner found only
/// in state is the newest replacement of one of them.
pub fn validate_after_execution(
    context: &PostExecutionContext<'_>,
    newest_pubkey: &dyn Fn(&Pubkey) -> Option<Pubkey>,
) -> ValidationResult {
    let Some(provided) = context.provided_round else {
        return ValidationResult::failure("Missing round information in header");
    };

    let mut recovered = context.state_round.clone();
    let recovery = match context.behavior {
        Behavior::UpdateValue => recovered.recover_from_update_value(provided, context.sender),
        Behavior::TinyBlock => recovered.recover_from_tiny_block(provided, context.sender),
        Behavior::NextRound | Behavior::NextTerm => {
            let Some(previous) = context.previous_round else {
                return ValidationResult::failure("Terminated round is missing");
            };
            let interval = check_mining_interval(previous, provided, context.mining_interval);
            if !interval.success {
                return interval;
            }
            let expected = match context.termination().expected_round(previous) {
                Ok(round) => round,
                Err(e) => {
                    return ValidationResult::failure(format!("Cannot generate next round: {}", e))
                }
            };
            let rebuilt = check_terminating_round(&expected, provided);
            if !rebuilt.success {
                warn!(
                    "Round {} from {} differs from the locally generated round",
                    provided.round_number, context.sender
                );
                return rebuilt;
            }
            Ok(())
        }
        Behavior::Nothing => {
            return ValidationResult::failure("Nothing behavior does not mutate state");
        }
    };
    if let Err(e) = recovery {
        return ValidationResult::failure(format!("Failed to recover round information: {}", e));
    }

    let include_previous_in_value = !recovered.is_miner_list_just_changed;
    let hashes = (
        recovered.checkable_hash(include_previous_in_value),
        provided.checkable_hash(include_previous_in_value),
    );
    let (Ok(state_hash), Ok(header_hash)) = hashes else {
        return ValidationResult::failure("Failed to hash round information");
    };
    if state_hash == header_hash {
        return ValidationResult::success();
    }

    let header_keys: BTreeSet<Pubkey> = provided.miners.keys().cloned().collect();
    let state_keys: BTreeSet<Pubkey> = recovered.miners.keys().cloned().collect();
    let replaced: Vec<&Pubkey> = header_keys.difference(&state_keys).collect();
    let added: Vec<&Pubkey> = state_keys.difference(&header_keys).collect();
    let all_replaced = !replaced.is_empty()
        && added.iter().all(|key| {
            replaced
                .iter()
                .any(|old| newest_pubkey(*old).as_ref() == Some(*key))
        });
    if all_replaced {
        debug!("Round differs from header only by replaced miners");
        return ValidationResult::success();
    }

    warn!(
        "Round {} after {} from {} differs from header",
        recovered.round_number, context.behavior, context.sender
    );
    ValidationResult::failure("Current round information is different with consensus extra data")
}
