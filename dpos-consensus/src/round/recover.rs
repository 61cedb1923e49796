//! Applying a miner's block to a round
//!
//! `record_*` advance a round for a block being produced. `recover_*` copy
//! the producing miner's values from a header round onto a committed round;
//! they are idempotent, so a round that already contains the block recovers
//! to itself.

use super::{MinerInRound, Round};
use crate::{ConsensusError, ConsensusResult};
use dpos_core::{BlockHeight, Hash, Pubkey, Timestamp};

impl Round {
    /// Publish OutValue and Signature and count the first block of a slot.
    pub fn record_update_value(
        &mut self,
        pubkey: &Pubkey,
        previous_in_value: Option<Hash>,
        out_value: Hash,
        signature: Hash,
        implied_irreversible_block_height: BlockHeight,
        block_time: Timestamp,
    ) -> ConsensusResult<()> {
        self.apply_normal_consensus_data(pubkey, previous_in_value, out_value, signature)?;
        let miner = self
            .miner_mut(pubkey)
            .ok_or_else(|| ConsensusError::MinerNotFound(pubkey.clone()))?;
        miner.implied_irreversible_block_height = implied_irreversible_block_height;
        count_block(miner, block_time)
    }

    /// Count one more block inside an already claimed slot.
    pub fn record_tiny_block(&mut self, pubkey: &Pubkey, block_time: Timestamp) -> ConsensusResult<()> {
        let miner = self
            .miner_mut(pubkey)
            .ok_or_else(|| ConsensusError::MinerNotFound(pubkey.clone()))?;
        count_block(miner, block_time)
    }

    /// Take over `pubkey`'s UpdateValue from a header round.
    ///
    /// Next round orders are re-derived from the signature rather than
    /// copied, so conflicts always resolve the same way on every node.
    pub fn recover_from_update_value(&mut self, provided: &Round, pubkey: &Pubkey) -> ConsensusResult<()> {
        let source = provided
            .miner(pubkey)
            .ok_or_else(|| ConsensusError::MinerNotFound(pubkey.clone()))?;
        let out_value = source
            .out_value
            .ok_or_else(|| ConsensusError::InvalidHeader("Missing out value".to_string()))?;
        let signature = source
            .signature
            .ok_or_else(|| ConsensusError::InvalidHeader("Missing signature".to_string()))?;

        self.apply_normal_consensus_data(pubkey, source.previous_in_value, out_value, signature)?;
        let miner = self
            .miner_mut(pubkey)
            .ok_or_else(|| ConsensusError::MinerNotFound(pubkey.clone()))?;
        miner.implied_irreversible_block_height = source.implied_irreversible_block_height;
        copy_production(miner, source);
        Ok(())
    }

    /// Take over `pubkey`'s tiny block counters from a header round.
    pub fn recover_from_tiny_block(&mut self, provided: &Round, pubkey: &Pubkey) -> ConsensusResult<()> {
        let source = provided
            .miner(pubkey)
            .ok_or_else(|| ConsensusError::MinerNotFound(pubkey.clone()))?;
        let miner = self
            .miner_mut(pubkey)
            .ok_or_else(|| ConsensusError::MinerNotFound(pubkey.clone()))?;
        copy_production(miner, source);
        Ok(())
    }
}

/// Count one block produced at `block_time`.
pub(crate) fn count_block(miner: &mut MinerInRound, block_time: Timestamp) -> ConsensusResult<()> {
    let overflow = || ConsensusError::Overflow(format!("block counters of {}", miner.pubkey));
    let produced_blocks = miner.produced_blocks.checked_add(1).ok_or_else(overflow)?;
    let produced_tiny_blocks = miner.produced_tiny_blocks.checked_add(1).ok_or_else(overflow)?;
    miner.produced_blocks = produced_blocks;
    miner.produced_tiny_blocks = produced_tiny_blocks;
    miner.actual_mining_times.push(block_time);
    Ok(())
}

fn copy_production(miner: &mut MinerInRound, source: &MinerInRound) {
    miner.produced_blocks = source.produced_blocks;
    miner.produced_tiny_blocks = source.produced_tiny_blocks;
    for time in &source.actual_mining_times {
        if !miner.actual_mining_times.contains(time) {
            miner.actual_mining_times.push(*time);
        }
    }
}
