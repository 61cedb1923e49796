//! Consensus engine traits and collaborators

use crate::behavior::{Behavior, ConsensusCommand};
use crate::evil_miner::EvilMinerReport;
use crate::header::TriggerInformation;
use crate::round::{MinerReplacement, Round};
use crate::validation::ValidationResult;
use crate::ConsensusResult;
use dpos_core::{BlockHeader, BlockHeight, Pubkey, Timestamp};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Programmatic surface used by block production and validation
pub trait ConsensusInformationProvider {
    /// What `pubkey` should do at `now`
    fn consensus_behavior(&self, pubkey: &Pubkey, now: Timestamp) -> ConsensusResult<Behavior>;

    /// Behavior plus when to act on it
    fn consensus_command(&self, pubkey: &Pubkey, now: Timestamp) -> ConsensusResult<ConsensusCommand>;

    /// Header data for the block `trigger.pubkey` is producing
    fn consensus_extra_data(
        &self,
        trigger: &TriggerInformation,
        height: BlockHeight,
        block_time: Timestamp,
    ) -> ConsensusResult<Vec<u8>>;

    /// Check a block before applying it
    fn validate_before_execution(&self, header: &BlockHeader) -> ValidationResult;

    /// Apply a validated block
    fn process(&mut self, header: &BlockHeader) -> ConsensusResult<()>;

    /// Check the state a block left behind
    fn validate_after_execution(&self, header: &BlockHeader) -> ValidationResult;
}

/// Election side of the chain
pub trait ElectionProvider: Send + Sync {
    /// Elected miners of the next term, `None` when unavailable
    fn victories(&self) -> Option<Vec<Pubkey>>;

    /// Replacements for evil miners still in `round`
    fn miner_replacement(&self, round: &Round) -> Vec<MinerReplacement>;

    /// Latest key of a miner that replaced its key, if any
    fn newest_pubkey(&self, pubkey: &Pubkey) -> Option<Pubkey>;

    /// Flag a miner as evil
    fn report_evil_miner(&self, report: &EvilMinerReport);

    /// Committee size the election should aim for
    fn update_miners_count(&self, miners_count: usize);
}

/// Election provider backed by fixed data
#[derive(Debug, Default)]
pub struct StaticElection {
    victories: Mutex<Option<Vec<Pubkey>>>,
    /// Evil miner to alternative
    replacements: Mutex<BTreeMap<Pubkey, Pubkey>>,
    /// Old key to new key
    newest_pubkeys: Mutex<BTreeMap<Pubkey, Pubkey>>,
    reported: Mutex<Vec<EvilMinerReport>>,
    miners_count: Mutex<Option<usize>>,
}

impl StaticElection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_victories(&self, victories: Option<Vec<Pubkey>>) {
        *self.victories.lock() = victories;
    }

    /// Replace `evil` with `alternative` in the next round
    pub fn add_replacement(&self, evil: Pubkey, alternative: Pubkey) {
        self.replacements.lock().insert(evil, alternative);
    }

    /// Record that a miner moved to a new key
    pub fn record_pubkey_change(&self, old: Pubkey, new: Pubkey) {
        self.newest_pubkeys.lock().insert(old, new);
    }

    pub fn reported_evil_miners(&self) -> Vec<EvilMinerReport> {
        self.reported.lock().clone()
    }

    pub fn latest_miners_count(&self) -> Option<usize> {
        *self.miners_count.lock()
    }
}

impl ElectionProvider for StaticElection {
    fn victories(&self) -> Option<Vec<Pubkey>> {
        self.victories.lock().clone()
    }

    fn miner_replacement(&self, round: &Round) -> Vec<MinerReplacement> {
        self.replacements
            .lock()
            .iter()
            .filter(|(evil, alternative)| round.contains(evil) && !round.contains(alternative))
            .map(|(evil, alternative)| MinerReplacement {
                evil: evil.clone(),
                alternative: alternative.clone(),
            })
            .collect()
    }

    fn newest_pubkey(&self, pubkey: &Pubkey) -> Option<Pubkey> {
        let changes = self.newest_pubkeys.lock();
        let mut current = changes.get(pubkey)?;
        // Follow the chain of changes, bounded by its length
        for _ in 0..changes.len() {
            match changes.get(current) {
                Some(next) => current = next,
                None => break,
            }
        }
        Some(current.clone())
    }

    fn report_evil_miner(&self, report: &EvilMinerReport) {
        self.reported.lock().push(report.clone());
    }

    fn update_miners_count(&self, miners_count: usize) {
        *self.miners_count.lock() = Some(miners_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::round::tests::{make_round, pubkey};

    #[test]
    fn test_static_election_replacements() {
        let election = StaticElection::new();
        election.add_replacement(pubkey(1), pubkey(8));
        election.add_replacement(pubkey(9), pubkey(7));

        let round = make_round(3, 0, 4_000);
        let replacements = election.miner_replacement(&round);
        assert_eq!(
            replacements,
            vec![MinerReplacement {
                evil: pubkey(1),
                alternative: pubkey(8),
            }]
        );
    }

    #[test]
    fn test_newest_pubkey_follows_changes() {
        let election = StaticElection::new();
        assert_eq!(election.newest_pubkey(&pubkey(1)), None);
        election.record_pubkey_change(pubkey(1), pubkey(2));
        election.record_pubkey_change(pubkey(2), pubkey(3));
        assert_eq!(election.newest_pubkey(&pubkey(1)), Some(pubkey(3)));
        assert_eq!(election.newest_pubkey(&pubkey(2)), Some(pubkey(3)));
    }

    #[test]
    fn test_reports_and_count() {
        let election = StaticElection::new();
        election.report_evil_miner(&EvilMinerReport {
            pubkey: pubkey(1),
            missed_time_slots: 5,
            round_number: 3,
            term_number: 1,
        });
        election.update_miners_count(19);
        assert_eq!(election.reported_evil_miners().len(), 1);
        assert_eq!(election.latest_miners_count(), Some(19));
    }
}
