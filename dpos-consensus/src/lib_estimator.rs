//! Last irreversible block estimation

use crate::round::Round;
use dpos_core::BlockHeight;

/// Computes the LIB candidate from two consecutive rounds.
///
/// Miners that mined in the current round vouch for the implied
/// irreversible heights they published in the previous round. Once a
/// consent quorum of them exists, the height at one third of the sorted
/// list is the candidate: two thirds of the vouching miners consider it
/// irreversible.
#[derive(Debug, Clone, Copy)]
pub struct LastIrreversibleBlockHeightCalculator<'a> {
    current_round: &'a Round,
    previous_round: &'a Round,
}

impl<'a> LastIrreversibleBlockHeightCalculator<'a> {
    pub fn new(current_round: &'a Round, previous_round: &'a Round) -> Self {
        Self {
            current_round,
            previous_round,
        }
    }

    /// Candidate height, 0 when there is no quorum.
    pub fn candidate(&self) -> BlockHeight {
        if self.current_round.is_miner_list_just_changed {
            return 0;
        }

        let mut heights: Vec<BlockHeight> = self
            .current_round
            .mined_miners()
            .into_iter()
            .filter_map(|miner| self.previous_round.miner(&miner.pubkey))
            .map(|miner| miner.implied_irreversible_block_height)
            .filter(|height| *height > 0)
            .collect();
        heights.sort_unstable();

        if heights.len() < self.current_round.miners_count_of_consent() {
            return 0;
        }
        heights[(heights.len() - 1) / 3]
    }

    /// Confirmed height and round after considering the candidate.
    ///
    /// The stored pair is only replaced by a strictly higher candidate.
    pub fn confirmed(&self) -> (BlockHeight, u64) {
        let stored = (
            self.current_round.confirmed_irreversible_block_height,
            self.current_round.confirmed_irreversible_block_round_number,
        );
        let candidate = self.candidate();
        if candidate > stored.0 {
            (candidate, self.current_round.round_number.saturating_sub(1))
        } else {
            stored
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::round::tests::{make_round, pubkey};
    use dpos_core::Hash;
    use proptest::prelude::*;

    fn rounds(implied: &[BlockHeight], mined: usize) -> (Round, Round) {
        let count = implied.len() as u8;
        let mut previous = make_round(count, 0, 4_000);
        for (i, height) in implied.iter().enumerate() {
            previous.miner_mut(&pubkey(i as u8)).unwrap().implied_irreversible_block_height = *height;
        }
        let mut current = make_round(count, 100_000, 4_000);
        current.round_number = 2;
        for i in 0..mined {
            current.miner_mut(&pubkey(i as u8)).unwrap().out_value = Some(Hash::compute(b"out"));
        }
        (current, previous)
    }

    #[test]
    fn test_candidate_with_quorum() {
        let (current, previous) = rounds(&[10, 20, 30, 40, 50], 5);
        // Sorted [10, 20, 30, 40, 50], index (5 - 1) / 3 = 1
        assert_eq!(
            LastIrreversibleBlockHeightCalculator::new(&current, &previous).candidate(),
            20
        );
    }

    #[test]
    fn test_no_quorum() {
        // Consent of 5 is 4
        let (current, previous) = rounds(&[10, 20, 30, 40, 50], 3);
        assert_eq!(
            LastIrreversibleBlockHeightCalculator::new(&current, &previous).candidate(),
            0
        );
    }

    #[test]
    fn test_zero_heights_ignored() {
        let (current, previous) = rounds(&[0, 20, 30, 40, 50], 5);
        assert_eq!(
            LastIrreversibleBlockHeightCalculator::new(&current, &previous).candidate(),
            30
        );
    }

    #[test]
    fn test_just_changed_skips() {
        let (mut current, previous) = rounds(&[10, 20, 30, 40, 50], 5);
        current.is_miner_list_just_changed = true;
        assert_eq!(
            LastIrreversibleBlockHeightCalculator::new(&current, &previous).candidate(),
            0
        );
    }

    #[test]
    fn test_lower_candidate_keeps_confirmed() {
        let (mut current, previous) = rounds(&[90, 90, 90, 90, 90], 5);
        current.confirmed_irreversible_block_height = 100;
        current.confirmed_irreversible_block_round_number = 1;
        let calculator = LastIrreversibleBlockHeightCalculator::new(&current, &previous);
        assert_eq!(calculator.candidate(), 90);
        assert_eq!(calculator.confirmed(), (100, 1));
    }

    #[test]
    fn test_higher_candidate_adopted() {
        let (mut current, previous) = rounds(&[110, 120, 130, 140, 150], 5);
        current.confirmed_irreversible_block_height = 100;
        let calculator = LastIrreversibleBlockHeightCalculator::new(&current, &previous);
        assert_eq!(calculator.confirmed(), (120, 1));
    }

    proptest! {
        #[test]
        fn prop_candidate_is_monotonic(
            base in proptest::collection::vec(1u64..10_000, 4..12),
            bumps in proptest::collection::vec(0u64..1_000, 12),
        ) {
            let raised: Vec<u64> = base.iter().zip(bumps.iter()).map(|(h, b)| h + b).collect();
            let (current, previous) = rounds(&base, base.len());
            let (current_raised, previous_raised) = rounds(&raised, raised.len());
            let low = LastIrreversibleBlockHeightCalculator::new(&current, &previous).candidate();
            let high = LastIrreversibleBlockHeightCalculator::new(&current_raised, &previous_raised).candidate();
            prop_assert!(high >= low);
        }

        #[test]
        fn prop_confirmed_never_decreases(
            implied in proptest::collection::vec(0u64..1_000, 4..12),
            stored in 0u64..1_000,
        ) {
            let (mut current, previous) = rounds(&implied, implied.len());
            current.confirmed_irreversible_block_height = stored;
            let (height, _) = LastIrreversibleBlockHeightCalculator::new(&current, &previous).confirmed();
            prop_assert!(height >= stored);
        }
    }
}
