//! Verifiable randomness and next round ordering
//!
//! Each miner commits `OutValue = commit(InValue)` and reveals the in-value
//! one round later. The ordering seed ("signature") is re-derivable by every
//! node from the revealed value and the signatures already committed in the
//! previous round, so validators always recompute it instead of trusting
//! the proposer.

use crate::round::Round;
use crate::{ConsensusError, ConsensusResult};
use dpos_core::{BlockHeight, Hash, Pubkey};
use tracing::debug;

/// Order a signature maps to in a committee of `miners_count`.
pub fn supposed_order(signature: &Hash, miners_count: usize) -> u32 {
    if miners_count == 0 {
        return 0;
    }
    let position = signature.to_i64().unsigned_abs() % miners_count as u64;
    // position < miners_count, which came from a committee size
    u32::try_from(position + 1).unwrap_or(u32::MAX)
}

/// Deterministic stand-in for a miner with nothing to reveal.
pub fn fake_previous_in_value(pubkey: &Pubkey, height: BlockHeight) -> Hash {
    let mut data = pubkey.as_bytes().to_vec();
    data.extend_from_slice(&height.to_le_bytes());
    Hash::compute(&data)
}

/// Per-round in-value derived from a miner's private seed.
pub fn derive_in_value(seed: &[u8; 32], round_number: u64) -> Hash {
    let derived = blake3::keyed_hash(seed, &round_number.to_le_bytes());
    Hash::new(*derived.as_bytes())
}

/// Signature every node expects from `pubkey` for an UpdateValue.
///
/// Signatures are folded from `previous_round`, or from `base_round` when the
/// chain has no earlier round. Without a revealed in-value the fake value
/// for the carrying block's height is folded instead.
pub fn expected_signature(
    previous_round: Option<&Round>,
    base_round: &Round,
    previous_in_value: Option<&Hash>,
    pubkey: &Pubkey,
    height: BlockHeight,
) -> Hash {
    let seed = match previous_in_value {
        Some(value) if !value.is_zero() => *value,
        _ => fake_previous_in_value(pubkey, height),
    };
    previous_round
        .unwrap_or(base_round)
        .calculate_signature(&seed)
}

impl Round {
    /// Fold `in_value` with every published signature of this round.
    pub fn calculate_signature(&self, in_value: &Hash) -> Hash {
        let folded = self
            .miners
            .values()
            .filter_map(|miner| miner.signature.filter(|s| !s.is_zero()))
            .fold(Hash::zero(), |acc, signature| acc.xor_and_compute(&signature));
        in_value.xor_and_compute(&folded)
    }

    /// Record a published OutValue and Signature and claim the next round
    /// order the signature maps to.
    ///
    /// Miners already holding that final order are moved to the first free
    /// order after it, wrapping around the committee. Conflicting miners are
    /// handled in key order.
    pub fn apply_normal_consensus_data(
        &mut self,
        pubkey: &Pubkey,
        previous_in_value: Option<Hash>,
        out_value: Hash,
        signature: Hash,
    ) -> ConsensusResult<()> {
        let miners_count = self.miners_count();
        let miner = self
            .miners
            .get_mut(pubkey)
            .ok_or_else(|| ConsensusError::MinerNotFound(pubkey.clone()))?;

        miner.out_value = Some(out_value);
        miner.signature = Some(signature);
        if !miner.has_previous_in_value() {
            if let Some(value) = previous_in_value.filter(|v| !v.is_zero()) {
                miner.previous_in_value = Some(value);
            }
        }

        let supposed = supposed_order(&signature, miners_count);
        miner.supposed_order_of_next_round = supposed;
        miner.final_order_of_next_round = supposed;

        let conflicts: Vec<Pubkey> = self
            .miners
            .iter()
            .filter(|(key, m)| *key != pubkey && m.final_order_of_next_round == supposed)
            .map(|(key, _)| key.clone())
            .collect();

        let count = u32::try_from(miners_count)
            .map_err(|_| ConsensusError::Overflow("committee size".to_string()))?;
        for conflict in conflicts {
            let free = (1..count)
                .map(|offset| (supposed - 1 + offset) % count + 1)
                .find(|candidate| {
                    self.miners
                        .iter()
                        .all(|(key, m)| *key == conflict || m.final_order_of_next_round != *candidate)
                })
                .unwrap_or(0);
            debug!(
                "Order {} of {} taken by {}, moved to {}",
                supposed, conflict, pubkey, free
            );
            if let Some(m) = self.miners.get_mut(&conflict) {
                m.final_order_of_next_round = free;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::round::tests::{make_round, pubkey};

    /// Signature whose ordering integer is `value`
    fn signature_of(value: i64) -> Hash {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&value.to_le_bytes());
        bytes[31] = 1;
        Hash::new(bytes)
    }

    #[test]
    fn test_supposed_order() {
        assert_eq!(supposed_order(&signature_of(0), 5), 1);
        assert_eq!(supposed_order(&signature_of(7), 5), 3);
        assert_eq!(supposed_order(&signature_of(-7), 5), 3);
        assert_eq!(supposed_order(&signature_of(i64::MIN), 5), 4);
        assert_eq!(supposed_order(&signature_of(42), 0), 0);
    }

    #[test]
    fn test_fake_previous_in_value_depends_on_height() {
        let key = pubkey(1);
        assert_eq!(fake_previous_in_value(&key, 5), fake_previous_in_value(&key, 5));
        assert_ne!(fake_previous_in_value(&key, 5), fake_previous_in_value(&key, 6));
    }

    #[test]
    fn test_derive_in_value() {
        let seed = [7u8; 32];
        assert_eq!(derive_in_value(&seed, 3), derive_in_value(&seed, 3));
        assert_ne!(derive_in_value(&seed, 3), derive_in_value(&seed, 4));
        assert_ne!(derive_in_value(&seed, 3), derive_in_value(&[8u8; 32], 3));
    }

    #[test]
    fn test_calculate_signature_skips_empty() {
        let mut round = make_round(3, 0, 4_000);
        let seed = Hash::compute(b"seed");
        let empty = round.calculate_signature(&seed);
        assert_eq!(empty, seed.xor_and_compute(&Hash::zero()));

        round.miner_mut(&pubkey(1)).unwrap().signature = Some(Hash::zero());
        assert_eq!(round.calculate_signature(&seed), empty);

        let s = Hash::compute(b"s");
        round.miner_mut(&pubkey(2)).unwrap().signature = Some(s);
        assert_eq!(
            round.calculate_signature(&seed),
            seed.xor_and_compute(&Hash::zero().xor_and_compute(&s))
        );
    }

    #[test]
    fn test_expected_signature_falls_back_to_base_round() {
        let base = make_round(3, 0, 4_000);
        let key = pubkey(0);
        let piv = Hash::compute(b"piv");
        assert_eq!(
            expected_signature(None, &base, Some(&piv), &key, 10),
            base.calculate_signature(&piv)
        );
        assert_eq!(
            expected_signature(None, &base, None, &key, 10),
            base.calculate_signature(&fake_previous_in_value(&key, 10))
        );
    }

    #[test]
    fn test_apply_without_conflict() {
        let mut round = make_round(5, 0, 4_000);
        let key = pubkey(2);
        let signature = signature_of(13);
        round
            .apply_normal_consensus_data(&key, None, Hash::compute(b"out"), signature)
            .unwrap();
        let miner = round.miner(&key).unwrap();
        assert_eq!(miner.supposed_order_of_next_round, 4);
        assert_eq!(miner.final_order_of_next_round, 4);
        assert!(miner.has_out_value());
    }

    #[test]
    fn test_apply_moves_conflicting_miner() {
        let mut round = make_round(5, 0, 4_000);
        // Two miners already hold orders 4 and 5
        round.miner_mut(&pubkey(0)).unwrap().final_order_of_next_round = 4;
        round.miner_mut(&pubkey(1)).unwrap().final_order_of_next_round = 5;

        round
            .apply_normal_consensus_data(&pubkey(3), None, Hash::compute(b"out"), signature_of(3))
            .unwrap();

        assert_eq!(round.miner(&pubkey(3)).unwrap().final_order_of_next_round, 4);
        // 5 is taken, so the displaced miner wraps to 1
        assert_eq!(round.miner(&pubkey(0)).unwrap().final_order_of_next_round, 1);
        assert_eq!(round.miner(&pubkey(1)).unwrap().final_order_of_next_round, 5);
    }

    #[test]
    fn test_apply_keeps_revealed_previous_in_value() {
        let mut round = make_round(3, 0, 4_000);
        let key = pubkey(1);
        let first = Hash::compute(b"first");
        round.miner_mut(&key).unwrap().previous_in_value = Some(first);
        round
            .apply_normal_consensus_data(
                &key,
                Some(Hash::compute(b"second")),
                Hash::compute(b"out"),
                signature_of(1),
            )
            .unwrap();
        assert_eq!(round.miner(&key).unwrap().previous_in_value, Some(first));
    }

    #[test]
    fn test_apply_unknown_miner() {
        let mut round = make_round(3, 0, 4_000);
        let result =
            round.apply_normal_consensus_data(&pubkey(9), None, Hash::zero(), signature_of(1));
        assert!(matches!(result, Err(ConsensusError::MinerNotFound(_))));
    }
}
