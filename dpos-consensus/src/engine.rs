//! DPoS consensus engine
//!
//! Ties the round model, the behavior selector and the validators to a
//! persisted [`ConsensusState`]. Processing works on a copy of the state and
//! commits it only when every step succeeded; events are published after
//! the commit.

use crate::behavior::{Behavior, BehaviorProvider, ConsensusCommand};
use crate::config::DposConfig;
use crate::evil_miner::{EvilMinerDetector, EvilMinerReport};
use crate::header::{ConsensusHeaderInformation, TriggerInformation};
use crate::lib_estimator::LastIrreversibleBlockHeightCalculator;
use crate::mining_status::MiningStatus;
use crate::round::Round;
use crate::secret_sharing::{reveal_shared_in_values, SecretShare};
use crate::signature::expected_signature;
use crate::state::ConsensusState;
use crate::term::{miners_count_hint, MinerList};
use crate::traits::{ConsensusInformationProvider, ElectionProvider};
use crate::validation::{
    self, ConsensusValidationContext, PostExecutionContext, RoundTermination, ValidationResult,
};
use crate::{ConsensusError, ConsensusResult};
use dpos_core::{BlockHeader, BlockHeight, Pubkey, Timestamp};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Consensus events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusEvent {
    /// A higher irreversible block height was confirmed
    IrreversibleBlockFound { height: BlockHeight, round_number: u64 },
    /// The committee changed
    MinerListChanged {
        term_number: u64,
        round_number: u64,
        miners: Vec<Pubkey>,
    },
    /// A miner missed more time slots than tolerated
    EvilMinerDetected { report: EvilMinerReport },
    /// New committee size hint for the election
    MinersCountUpdated { miners_count: usize },
    /// The irreversible block stopped advancing
    IrreversibleBlockHeightUnacceptable { distance_to_lib_round: u64 },
}

/// DPoS consensus engine
pub struct DposEngine {
    /// Configuration
    config: DposConfig,
    /// Committed consensus state
    state: ConsensusState,
    /// Election side of the chain
    election: Arc<dyn ElectionProvider>,
    /// Missed slot tracking
    evil_miner_detector: EvilMinerDetector,
    /// Event sender for notifications
    event_sender: Option<mpsc::UnboundedSender<ConsensusEvent>>,
}

impl DposEngine {
    /// Create an engine with empty state. Call [`DposEngine::initialize`]
    /// before producing blocks.
    pub fn new(config: DposConfig, election: Arc<dyn ElectionProvider>) -> ConsensusResult<Self> {
        let state = ConsensusState::new(config.start_timestamp());
        Self::with_state(config, election, state)
    }

    /// Create an engine on top of previously persisted state
    pub fn with_state(
        config: DposConfig,
        election: Arc<dyn ElectionProvider>,
        state: ConsensusState,
    ) -> ConsensusResult<Self> {
        config.validate()?;
        let evil_miner_detector = EvilMinerDetector::new(config.tolerable_missed_time_slots);
        Ok(Self {
            config,
            state,
            election,
            evil_miner_detector,
            event_sender: None,
        })
    }

    /// Schedule the first round from the configured miners
    pub fn initialize(&mut self) -> ConsensusResult<()> {
        if self.state.is_initialized() {
            return Err(ConsensusError::InvalidRound(
                "Consensus state is already initialized".to_string(),
            ));
        }
        let miner_list = MinerList::new(self.config.initial_miner_list()?);
        let first_round = miner_list.generate_first_round_of_new_term(
            self.config.mining_interval,
            self.state.blockchain_start_timestamp,
            None,
            None,
        )?;
        info!(
            "Initialized consensus with {} miners, first slot at {}",
            miner_list.len(),
            first_round.round_start_time()
        );
        self.state.miners_count = miner_list.len();
        self.state.add_round(first_round)
    }

    /// Set event sender for notifications
    pub fn set_event_sender(&mut self, sender: mpsc::UnboundedSender<ConsensusEvent>) {
        self.event_sender = Some(sender);
    }

    pub fn config(&self) -> &DposConfig {
        &self.config
    }

    pub fn state(&self) -> &ConsensusState {
        &self.state
    }

    pub fn current_round(&self) -> ConsensusResult<&Round> {
        self.state.current_round()
    }

    /// Committee of the next term: the election result, or the current
    /// committee when the election has none.
    pub fn next_term_miner_list(&self) -> ConsensusResult<MinerList> {
        if let Some(victories) = self.election.victories() {
            let miner_list = MinerList::new(victories);
            if !miner_list.is_empty() {
                return Ok(miner_list);
            }
        }
        debug!("No election result, keeping the current committee");
        Ok(MinerList::new(self.state.current_round()?.miner_list()))
    }

    /// Move a miner to a new key inside the current term
    pub fn record_candidate_replacement(&mut self, old: &Pubkey, new: &Pubkey) -> ConsensusResult<()> {
        self.state.replace_pubkey(old, new)?;
        info!("Miner {} replaced its key with {}", old, new);
        Ok(())
    }

    /// Seconds since chain start
    fn blockchain_age(&self, block_time: Timestamp) -> u64 {
        block_time.saturating_sub(self.state.blockchain_start_timestamp) / 1000
    }

    /// Send event notification
    fn send_event(&self, event: ConsensusEvent) {
        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender.send(event) {
                warn!("Failed to send consensus event: {}", e);
            }
        }
    }

    /// Hand committed events to the election and to subscribers
    fn publish(&self, events: Vec<ConsensusEvent>) {
        for event in events {
            match &event {
                ConsensusEvent::EvilMinerDetected { report } => {
                    self.election.report_evil_miner(report);
                }
                ConsensusEvent::MinersCountUpdated { miners_count } => {
                    self.election.update_miners_count(*miners_count);
                }
                _ => {}
            }
            self.send_event(event);
        }
    }

    fn update_value_round(
        &self,
        current: &Round,
        trigger: &TriggerInformation,
        height: BlockHeight,
        block_time: Timestamp,
    ) -> ConsensusResult<Round> {
        let sender = &trigger.pubkey;
        let in_value = trigger
            .in_value
            .filter(|value| !value.is_zero())
            .ok_or_else(|| ConsensusError::InvalidTrigger("Missing in value".to_string()))?;

        let previous_round = self.state.previous_round();
        let committed = previous_round
            .and_then(|round| round.miner(sender))
            .and_then(|miner| miner.out_value)
            .filter(|value| !value.is_zero());
        let revealed = current
            .miner(sender)
            .and_then(|miner| miner.previous_in_value)
            .filter(|value| !value.is_zero());
        let previous_in_value = match revealed {
            Some(value) => Some(value),
            None => {
                let provided = trigger.previous_in_value.filter(|value| !value.is_zero());
                match (provided, committed) {
                    (Some(value), Some(out_value)) if value.commit() == out_value => Some(value),
                    (Some(_), Some(_)) => {
                        warn!("Previous in value of {} does not match its out value", sender);
                        None
                    }
                    _ => None,
                }
            }
        };

        let signature = expected_signature(
            previous_round,
            current,
            previous_in_value.as_ref(),
            sender,
            height,
        );
        let mut round = current.clone();
        round.record_update_value(
            sender,
            previous_in_value,
            in_value.commit(),
            signature,
            height.saturating_sub(1),
            block_time,
        )?;
        Ok(round)
    }

    /// Round opened by `sender` terminating `current` at `block_time`
    fn terminating_round(
        &self,
        behavior: Behavior,
        current: &Round,
        sender: &Pubkey,
        block_time: Timestamp,
    ) -> ConsensusResult<Round> {
        let miner_replacements = match behavior {
            Behavior::NextRound => self.election.miner_replacement(current),
            _ => Vec::new(),
        };
        let next_term_miner_list = match behavior {
            Behavior::NextTerm => Some(self.next_term_miner_list()?),
            _ => None,
        };
        RoundTermination {
            behavior,
            sender,
            block_time,
            mining_interval: self.config.mining_interval,
            blockchain_age: self.blockchain_age(block_time),
            miner_replacements: &miner_replacements,
            next_term_miner_list: next_term_miner_list.as_ref(),
        }
        .expected_round(current)
    }

    fn process_update_value(
        &self,
        state: &mut ConsensusState,
        provided: &Round,
        sender: &Pubkey,
        decrypted_pieces: &BTreeMap<Pubkey, SecretShare>,
        events: &mut Vec<ConsensusEvent>,
    ) -> ConsensusResult<()> {
        let mut current = state.current_round()?.clone();
        current.recover_from_update_value(provided, sender)?;

        match state.previous_round().cloned() {
            Some(mut previous) => {
                for (owner, share) in decrypted_pieces {
                    if let Some(miner) = previous.miners.get_mut(owner) {
                        miner.decrypted_pieces.insert(sender.clone(), *share);
                    }
                }

                let (height, round_number) =
                    LastIrreversibleBlockHeightCalculator::new(&current, &previous).confirmed();
                if height > current.confirmed_irreversible_block_height {
                    info!(
                        "Irreversible block height {} confirmed in round {}",
                        height, round_number
                    );
                    current.confirmed_irreversible_block_height = height;
                    current.confirmed_irreversible_block_round_number = round_number;
                    events.push(ConsensusEvent::IrreversibleBlockFound {
                        height,
                        round_number,
                    });
                }
                state.replace_round(previous)?;
            }
            None if current.round_number > 1 => warn!(
                "Round {} is missing, skipping irreversible block estimation",
                current.round_number - 1
            ),
            None => debug!("First round, skipping irreversible block estimation"),
        }

        state.replace_round(current)
    }

    fn process_tiny_block(
        &self,
        state: &mut ConsensusState,
        provided: &Round,
        sender: &Pubkey,
    ) -> ConsensusResult<()> {
        let mut current = state.current_round()?.clone();
        current.recover_from_tiny_block(provided, sender)?;
        state.replace_round(current)
    }

    fn process_next_round(
        &self,
        state: &mut ConsensusState,
        next: Round,
        behavior: Behavior,
        block_time: Timestamp,
        events: &mut Vec<ConsensusEvent>,
    ) -> ConsensusResult<()> {
        let mut closing = state.current_round()?.clone();
        match state.previous_round() {
            Some(previous) => {
                let revealed = reveal_shared_in_values(&mut closing, previous);
                if !revealed.is_empty() {
                    info!(
                        "Revealed {} in values of round {} from shares",
                        revealed.len(),
                        previous.round_number
                    );
                }
            }
            None if closing.round_number > 1 => warn!(
                "Round {} is missing, in values cannot be revealed",
                closing.round_number - 1
            ),
            None => {}
        }
        state.record_mined_miners(&closing);

        // The stored round keeps its own counters so the next round can be
        // rebuilt from it after execution
        let mut tallied = closing.clone();
        tallied.count_missed_time_slots();
        for report in self.evil_miner_detector.detect(&tallied) {
            warn!(
                "Miner {} missed {} time slots",
                report.pubkey, report.missed_time_slots
            );
            events.push(ConsensusEvent::EvilMinerDetected { report });
        }
        state.replace_round(closing)?;

        let changed = next.is_miner_list_just_changed;
        let (term_number, round_number) = (next.term_number, next.round_number);
        state.add_round(next)?;
        info!("Entered round {} of term {}", round_number, term_number);

        if changed {
            let miners = state
                .miner_list(term_number)
                .map(|list| list.pubkeys.clone())
                .unwrap_or_default();
            events.push(ConsensusEvent::MinerListChanged {
                term_number,
                round_number,
                miners,
            });
        }

        if behavior == Behavior::NextTerm {
            let elapsed_seconds = block_time.saturating_sub(state.blockchain_start_timestamp) / 1000;
            let miners_count = miners_count_hint(
                self.config.supposed_miners_count,
                self.config.maximum_miners_count,
                self.config.miner_increase_interval,
                elapsed_seconds,
            )?;
            state.miners_count = miners_count;
            events.push(ConsensusEvent::MinersCountUpdated { miners_count });
        }
        Ok(())
    }
}

impl ConsensusInformationProvider for DposEngine {
    fn consensus_behavior(&self, pubkey: &Pubkey, now: Timestamp) -> ConsensusResult<Behavior> {
        let current_round = self.state.current_round()?;
        let (maximum_blocks_count, _) = self
            .state
            .maximum_blocks_count(self.config.maximum_tiny_blocks_count)?;
        let behavior = BehaviorProvider {
            current_round,
            pubkey,
            maximum_blocks_count,
            current_block_time: now,
            blockchain_start_timestamp: self.state.blockchain_start_timestamp,
            period_seconds: self.config.period_seconds,
        }
        .behavior();
        debug!(
            "Behavior of {} at {} in round {}: {}",
            pubkey, now, current_round.round_number, behavior
        );
        Ok(behavior)
    }

    fn consensus_command(&self, pubkey: &Pubkey, now: Timestamp) -> ConsensusResult<ConsensusCommand> {
        let behavior = self.consensus_behavior(pubkey, now)?;
        Ok(ConsensusCommand::arrange(
            behavior,
            self.state.current_round()?,
            pubkey,
            now,
        ))
    }

    fn consensus_extra_data(
        &self,
        trigger: &TriggerInformation,
        height: BlockHeight,
        block_time: Timestamp,
    ) -> ConsensusResult<Vec<u8>> {
        let sender = &trigger.pubkey;
        let behavior = self.consensus_behavior(sender, block_time)?;
        let current = self.state.current_round()?;

        let round = match behavior {
            Behavior::UpdateValue => self.update_value_round(current, trigger, height, block_time)?,
            Behavior::TinyBlock => {
                let mut round = current.clone();
                round.record_tiny_block(sender, block_time)?;
                round
            }
            Behavior::NextRound | Behavior::NextTerm => {
                self.terminating_round(behavior, current, sender, block_time)?
            }
            Behavior::Nothing => {
                return Err(ConsensusError::InvalidTrigger(format!(
                    "{} has nothing to produce at {}",
                    sender, block_time
                )));
            }
        };

        let mut information = ConsensusHeaderInformation::new(sender.clone(), behavior, round);
        if behavior == Behavior::UpdateValue {
            information.decrypted_pieces = trigger.decrypted_pieces.clone();
        }
        information.to_bytes()
    }

    fn validate_before_execution(&self, header: &BlockHeader) -> ValidationResult {
        let information = match ConsensusHeaderInformation::from_bytes(&header.consensus_extra_data) {
            Ok(information) => information,
            Err(e) => return ValidationResult::failure(e.to_string()),
        };
        let Some(provided_round) = information.round.as_ref() else {
            return ValidationResult::failure("Missing round information in header");
        };
        if information.sender != header.miner {
            return ValidationResult::failure("Consensus sender differs from block producer");
        }
        let base_round = match self.state.current_round() {
            Ok(round) => round,
            Err(e) => return ValidationResult::failure(e.to_string()),
        };
        let maximum_blocks_count = match self
            .state
            .maximum_blocks_count(self.config.maximum_tiny_blocks_count)
        {
            Ok((count, _)) => count,
            Err(e) => return ValidationResult::failure(e.to_string()),
        };

        let miner_replacements = if information.behavior == Behavior::NextRound {
            self.election.miner_replacement(base_round)
        } else {
            Vec::new()
        };
        let next_term_miner_list = if information.behavior == Behavior::NextTerm {
            self.next_term_miner_list().ok()
        } else {
            None
        };

        let context = ConsensusValidationContext {
            base_round,
            provided_round,
            previous_round: self.state.previous_round(),
            sender: &information.sender,
            behavior: information.behavior,
            current_term_number: self.state.current_term_number,
            current_height: header.height,
            block_time: header.timestamp,
            mining_interval: self.config.mining_interval,
            blockchain_age: self.blockchain_age(header.timestamp),
            is_first_round_of_current_term: self.state.is_first_round_of_current_term(),
            latest_provider_to_tiny_blocks_count: self
                .state
                .latest_provider_to_tiny_blocks_count
                .as_ref(),
            maximum_blocks_count,
            miner_replacements: &miner_replacements,
            next_term_miner_list: next_term_miner_list.as_ref(),
        };
        validation::validate_before_execution(&context)
    }

    fn process(&mut self, header: &BlockHeader) -> ConsensusResult<()> {
        let information = ConsensusHeaderInformation::from_bytes(&header.consensus_extra_data)?;
        let provided = information
            .round
            .as_ref()
            .ok_or_else(|| ConsensusError::InvalidHeader("Missing round information".to_string()))?;
        let sender = &information.sender;
        self.state.ensure_not_executed(header.height)?;

        let mut state = self.state.clone();
        let mut events = Vec::new();

        let (ceiling, status) = state.maximum_blocks_count(self.config.maximum_tiny_blocks_count)?;
        if status == MiningStatus::Severe {
            let current = state.current_round()?;
            let distance_to_lib_round = current
                .round_number
                .saturating_sub(current.confirmed_irreversible_block_round_number);
            warn!(
                "Irreversible block is {} rounds behind, limiting miners to one block",
                distance_to_lib_round
            );
            events.push(ConsensusEvent::IrreversibleBlockHeightUnacceptable {
                distance_to_lib_round,
            });
        }
        state.update_latest_provider(sender, ceiling);

        match information.behavior {
            Behavior::UpdateValue => self.process_update_value(
                &mut state,
                provided,
                sender,
                &information.decrypted_pieces,
                &mut events,
            )?,
            Behavior::TinyBlock => self.process_tiny_block(&mut state, provided, sender)?,
            Behavior::NextRound | Behavior::NextTerm => self.process_next_round(
                &mut state,
                provided.clone(),
                information.behavior,
                header.timestamp,
                &mut events,
            )?,
            Behavior::Nothing => {
                return Err(ConsensusError::InvalidHeader(
                    "Nothing behavior does not mutate state".to_string(),
                ));
            }
        }

        state.latest_executed_height = Some(header.height);
        self.state = state;
        debug!(
            "Processed {} from {} at height {}",
            information.behavior, sender, header.height
        );
        self.publish(events);
        Ok(())
    }

    fn validate_after_execution(&self, header: &BlockHeader) -> ValidationResult {
        let information = match ConsensusHeaderInformation::from_bytes(&header.consensus_extra_data) {
            Ok(information) => information,
            Err(e) => return ValidationResult::failure(e.to_string()),
        };
        let state_round = match self.state.current_round() {
            Ok(round) => round,
            Err(e) => return ValidationResult::failure(e.to_string()),
        };
        let previous_round = self.state.previous_round();
        let miner_replacements = match (information.behavior, previous_round) {
            (Behavior::NextRound, Some(previous)) => self.election.miner_replacement(previous),
            _ => Vec::new(),
        };
        let next_term_miner_list = if information.behavior == Behavior::NextTerm {
            self.next_term_miner_list().ok()
        } else {
            None
        };
        let context = PostExecutionContext {
            sender: &information.sender,
            behavior: information.behavior,
            provided_round: information.round.as_ref(),
            state_round,
            previous_round,
            mining_interval: self.config.mining_interval,
            block_time: header.timestamp,
            blockchain_age: self.blockchain_age(header.timestamp),
            miner_replacements: &miner_replacements,
            next_term_miner_list: next_term_miner_list.as_ref(),
        };
        let election = &self.election;
        validation::validate_after_execution(&context, &|pubkey| election.newest_pubkey(pubkey))
    }
}
