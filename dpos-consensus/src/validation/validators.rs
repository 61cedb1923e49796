//! Header information validators

use super::{
    check_terminating_round, ConsensusValidationContext, HeaderInformationValidator,
    ValidationResult,
};
use crate::behavior::Behavior;
use crate::mining_status::LatestProviderToTinyBlocksCount;
use crate::round::{MinerInRound, Round};
use crate::signature::{expected_signature, supposed_order};
use dpos_core::Pubkey;
use std::collections::BTreeSet;

/// Check that a terminating round keeps the mining interval.
///
/// A single miner round has no interval of its own; the configured one
/// stands in for it.
pub fn check_mining_interval(base: &Round, provided: &Round, configured: u64) -> ValidationResult {
    if provided.miners_count() < 2 {
        return ValidationResult::success();
    }
    let expected = if base.miners_count() < 2 {
        configured
    } else {
        base.mining_interval()
    };
    if provided.mining_interval() != expected {
        return ValidationResult::failure(format!(
            "Mining interval changed from {} to {}",
            expected,
            provided.mining_interval()
        ));
    }
    ValidationResult::success()
}

/// Block counters of `provided` are one above `base`
fn counters_advance_by_one(base: &MinerInRound, provided: &MinerInRound) -> bool {
    base.produced_blocks.checked_add(1) == Some(provided.produced_blocks)
        && base.produced_tiny_blocks.checked_add(1) == Some(provided.produced_tiny_blocks)
}

fn key_set(round: &Round) -> BTreeSet<&Pubkey> {
    round.miners.keys().collect()
}

/// Sender must be a member of the committed round
pub struct MiningPermissionValidator;

impl HeaderInformationValidator for MiningPermissionValidator {
    fn name(&self) -> &'static str {
        "MiningPermission"
    }

    fn validate(&self, context: &ConsensusValidationContext<'_>) -> ValidationResult {
        if !context.base_round.contains(context.sender) {
            return ValidationResult::failure(format!("Sender {} is not a miner", context.sender));
        }
        ValidationResult::success()
    }
}

/// Sender must not exceed the blocks it may produce in a row
pub struct ContinuousBlocksValidator;

impl HeaderInformationValidator for ContinuousBlocksValidator {
    fn name(&self) -> &'static str {
        "ContinuousBlocks"
    }

    fn validate(&self, context: &ConsensusValidationContext<'_>) -> ValidationResult {
        let base = context.base_round;
        if base.round_number <= 2 || base.miners_count() == 1 {
            return ValidationResult::success();
        }
        let projected = LatestProviderToTinyBlocksCount::projected(
            context.latest_provider_to_tiny_blocks_count,
            context.sender,
            context.maximum_blocks_count,
        );
        if projected.blocks_count < 0 {
            return ValidationResult::failure(format!(
                "Sender {} produced too many continuous blocks",
                context.sender
            ));
        }
        ValidationResult::success()
    }
}

/// Block must be produced inside the sender's time slot of the same round
pub struct TimeSlotValidator;

impl HeaderInformationValidator for TimeSlotValidator {
    fn name(&self) -> &'static str {
        "TimeSlot"
    }

    fn validate(&self, context: &ConsensusValidationContext<'_>) -> ValidationResult {
        let base = context.base_round;
        let provided = context.provided_round;
        if provided.round_number != base.round_number || provided.round_id() != base.round_id() {
            return ValidationResult::re_trigger("Round information is outdated");
        }

        let (Some(base_miner), Some(provided_miner)) =
            (base.miner(context.sender), provided.miner(context.sender))
        else {
            return ValidationResult::failure("Sender is missing from round information");
        };
        if provided_miner.latest_actual_mining_time() != Some(context.block_time) {
            return ValidationResult::failure("Latest actual mining time differs from block time");
        }

        // The first round of a term is scheduled before anyone could mine
        if context.is_first_round_of_current_term {
            return ValidationResult::success();
        }
        if context.block_time < base_miner.expected_mining_time {
            return ValidationResult::failure("Block produced before the sender's time slot");
        }
        if base.is_time_slot_passed(context.sender, context.block_time) {
            return ValidationResult::re_trigger("Time slot already passed");
        }
        ValidationResult::success()
    }
}

/// OutValue, Signature and PreviousInValue of an UpdateValue
pub struct UpdateValueValidator;

impl UpdateValueValidator {
    fn check_previous_in_value(
        context: &ConsensusValidationContext<'_>,
        base_miner: &MinerInRound,
        provided_miner: &MinerInRound,
    ) -> ValidationResult {
        let Some(previous_in_value) = provided_miner
            .previous_in_value
            .filter(|value| !value.is_zero())
        else {
            return ValidationResult::success();
        };

        if base_miner.has_previous_in_value()
            && base_miner.previous_in_value != Some(previous_in_value)
        {
            return ValidationResult::failure("Previous in value differs from the revealed one");
        }

        let committed = context
            .previous_round
            .and_then(|round| round.miner(context.sender))
            .and_then(|miner| miner.out_value)
            .filter(|value| !value.is_zero());
        match committed {
            Some(out_value) if previous_in_value.commit() == out_value => {
                ValidationResult::success()
            }
            Some(_) => ValidationResult::failure("Incorrect previous in value"),
            None => ValidationResult::failure("No out value to check previous in value against"),
        }
    }
}

impl HeaderInformationValidator for UpdateValueValidator {
    fn name(&self) -> &'static str {
        "UpdateValue"
    }

    fn validate(&self, context: &ConsensusValidationContext<'_>) -> ValidationResult {
        let base = context.base_round;
        let (Some(base_miner), Some(provided_miner)) =
            (base.miner(context.sender), context.provided_round.miner(context.sender))
        else {
            return ValidationResult::failure("Sender is missing from round information");
        };

        if !provided_miner.has_out_value() || !provided_miner.has_signature() {
            return ValidationResult::failure("Incorrect new out value or signature");
        }
        if base_miner.has_out_value() {
            return ValidationResult::failure("Out value already published in this round");
        }
        if !counters_advance_by_one(base_miner, provided_miner) {
            return ValidationResult::failure("Produced block counters must advance by one");
        }

        let previous = Self::check_previous_in_value(context, base_miner, provided_miner);
        if !previous.success {
            return previous;
        }

        let expected = expected_signature(
            context.previous_round,
            base,
            provided_miner.previous_in_value.as_ref(),
            context.sender,
            context.current_height,
        );
        let Some(signature) = provided_miner.signature else {
            return ValidationResult::failure("Incorrect new out value or signature");
        };
        if signature != expected {
            return ValidationResult::failure("Signature does not match the committed values");
        }
        if provided_miner.supposed_order_of_next_round
            != supposed_order(&signature, base.miners_count())
        {
            return ValidationResult::failure("Incorrect supposed order of next round");
        }

        ValidationResult::success()
    }
}

/// A tiny block continues a slot the sender already claimed
pub struct TinyBlockStateValidator;

impl HeaderInformationValidator for TinyBlockStateValidator {
    fn name(&self) -> &'static str {
        "TinyBlockState"
    }

    fn validate(&self, context: &ConsensusValidationContext<'_>) -> ValidationResult {
        let (Some(base_miner), Some(provided_miner)) = (
            context.base_round.miner(context.sender),
            context.provided_round.miner(context.sender),
        ) else {
            return ValidationResult::failure("Sender is missing from round information");
        };

        if !base_miner.has_out_value() {
            return ValidationResult::failure("Tiny block before publishing an out value");
        }
        if provided_miner.out_value != base_miner.out_value
            || provided_miner.signature != base_miner.signature
        {
            return ValidationResult::failure("Tiny block changes published values");
        }
        if !counters_advance_by_one(base_miner, provided_miner) {
            return ValidationResult::failure("Produced block counters must advance by one");
        }
        ValidationResult::success()
    }
}

/// Confirmed and implied irreversible heights never go back
pub struct LibInformationValidator;

impl HeaderInformationValidator for LibInformationValidator {
    fn name(&self) -> &'static str {
        "LibInformation"
    }

    fn validate(&self, context: &ConsensusValidationContext<'_>) -> ValidationResult {
        let base = context.base_round;
        let provided = context.provided_round;
        if provided.confirmed_irreversible_block_height < base.confirmed_irreversible_block_height
            || provided.confirmed_irreversible_block_round_number
                < base.confirmed_irreversible_block_round_number
        {
            return ValidationResult::failure("Incorrect lib information");
        }
        if context.behavior.is_round_terminating()
            && (provided.confirmed_irreversible_block_height
                != base.confirmed_irreversible_block_height
                || provided.confirmed_irreversible_block_round_number
                    != base.confirmed_irreversible_block_round_number)
        {
            return ValidationResult::failure("Confirmed lib information must be carried over");
        }

        if matches!(context.behavior, Behavior::UpdateValue | Behavior::TinyBlock) {
            for (pubkey, provided_miner) in &provided.miners {
                let Some(base_miner) = base.miner(pubkey) else {
                    continue;
                };
                if provided_miner.implied_irreversible_block_height
                    < base_miner.implied_irreversible_block_height
                {
                    return ValidationResult::failure(format!(
                        "Implied irreversible height of {} went back",
                        pubkey
                    ));
                }
            }
            let implied = provided
                .miner(context.sender)
                .map(|m| m.implied_irreversible_block_height)
                .unwrap_or_default();
            if implied > context.current_height {
                return ValidationResult::failure("Implied irreversible height is in the future");
            }
        }
        ValidationResult::success()
    }
}

/// Structure of a round opened by NextRound or NextTerm
pub struct RoundTerminateValidator;

impl HeaderInformationValidator for RoundTerminateValidator {
    fn name(&self) -> &'static str {
        "RoundTerminate"
    }

    fn validate(&self, context: &ConsensusValidationContext<'_>) -> ValidationResult {
        let base = context.base_round;
        let provided = context.provided_round;

        if provided.round_number != base.round_number + 1 {
            return ValidationResult::failure("Incorrect round number for next round");
        }
        let term_increase = u64::from(context.behavior == Behavior::NextTerm);
        if provided.term_number != context.current_term_number + term_increase {
            return ValidationResult::failure("Incorrect term number for next round");
        }
        if provided.miners.is_empty() {
            return ValidationResult::failure("Next round has no miners");
        }
        if provided.miners.values().any(|m| m.in_value.is_some()) {
            return ValidationResult::failure("Next round must not contain in values");
        }
        if provided.miners.values().any(|m| m.has_out_value()) {
            return ValidationResult::failure("Next round must not contain out values");
        }

        let slots = provided.check_round_time_slots();
        if !slots.success {
            return slots;
        }
        let interval = check_mining_interval(base, provided, context.mining_interval);
        if !interval.success {
            return interval;
        }

        if provided.extra_block_producer_of_previous_round.as_ref() != Some(context.sender) {
            return ValidationResult::failure("Sender is not the producer of the extra block");
        }
        let producers = provided
            .miners
            .values()
            .filter(|m| m.is_extra_block_producer)
            .count();
        if producers != 1 {
            return ValidationResult::failure(format!(
                "Next round has {} extra block producers",
                producers
            ));
        }

        let changed = key_set(base) != key_set(provided);
        let flag_expected = changed || context.behavior == Behavior::NextTerm;
        if provided.is_miner_list_just_changed != flag_expected {
            return ValidationResult::failure("Incorrect miner list change flag");
        }

        ValidationResult::success()
    }
}

/// NextRound must reproduce the deterministic next round
pub struct NextRoundMiningOrderValidator;

impl HeaderInformationValidator for NextRoundMiningOrderValidator {
    fn name(&self) -> &'static str {
        "NextRoundMiningOrder"
    }

    fn validate(&self, context: &ConsensusValidationContext<'_>) -> ValidationResult {
        let provided = context.provided_round;
        let mut orders: Vec<u32> = provided.miners.values().map(|m| m.order).collect();
        orders.sort_unstable();
        let permutation = orders
            .iter()
            .enumerate()
            .all(|(i, order)| *order as usize == i + 1);
        if !permutation {
            return ValidationResult::failure("Orders of next round are not a permutation");
        }

        let expected = match context.termination().expected_round(context.base_round) {
            Ok(round) => round,
            Err(e) => return ValidationResult::failure(format!("Cannot generate next round: {}", e)),
        };
        if key_set(&expected) != key_set(provided) {
            return ValidationResult::failure("Incorrect miners of next round");
        }
        check_terminating_round(&expected, provided)
    }
}

/// NextTerm must schedule the elected committee in election order
pub struct NextTermMinerListValidator;

impl HeaderInformationValidator for NextTermMinerListValidator {
    fn name(&self) -> &'static str {
        "NextTermMinerList"
    }

    fn validate(&self, context: &ConsensusValidationContext<'_>) -> ValidationResult {
        let expected = match context.termination().expected_round(context.base_round) {
            Ok(round) => round,
            Err(e) => return ValidationResult::failure(format!("Cannot generate next term: {}", e)),
        };
        let provided = context.provided_round;
        if key_set(&expected) != key_set(provided) {
            return ValidationResult::failure("Incorrect miner list of next term");
        }
        check_terminating_round(&expected, provided)
    }
}

/// A Nothing proposal never mutates state
pub struct NothingRejectedValidator;

impl HeaderInformationValidator for NothingRejectedValidator {
    fn name(&self) -> &'static str {
        "NothingRejected"
    }

    fn validate(&self, _context: &ConsensusValidationContext<'_>) -> ValidationResult {
        ValidationResult::failure("Nothing behavior does not mutate state")
    }
}
