//! Consensus information carried in block headers

use crate::behavior::Behavior;
use crate::round::Round;
use crate::secret_sharing::SecretShare;
use crate::signature::derive_in_value;
use crate::{ConsensusError, ConsensusResult};
use dpos_core::{Hash, Pubkey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Header payload of a consensus block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusHeaderInformation {
    /// Miner producing the block
    pub sender: Pubkey,
    pub behavior: Behavior,
    /// Round after the block; a header without one is rejected
    pub round: Option<Round>,
    /// Shares of other miners' in-values decrypted by the sender, keyed by
    /// the owner of the secret
    #[serde(default)]
    pub decrypted_pieces: BTreeMap<Pubkey, SecretShare>,
}

impl ConsensusHeaderInformation {
    pub fn new(sender: Pubkey, behavior: Behavior, round: Round) -> Self {
        Self {
            sender,
            behavior,
            round: Some(round),
            decrypted_pieces: BTreeMap::new(),
        }
    }

    /// Serialize to header extra data
    pub fn to_bytes(&self) -> ConsensusResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse header extra data
    pub fn from_bytes(bytes: &[u8]) -> ConsensusResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| ConsensusError::InvalidHeader(format!("Undecodable consensus data: {}", e)))
    }
}

/// What a miner supplies when asking for its header data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerInformation {
    pub pubkey: Pubkey,
    /// Secret of the current round
    pub in_value: Option<Hash>,
    /// Secret of the previous round
    pub previous_in_value: Option<Hash>,
    /// Shares decrypted for other miners, keyed by owner
    pub decrypted_pieces: BTreeMap<Pubkey, SecretShare>,
}

impl TriggerInformation {
    pub fn new(pubkey: Pubkey) -> Self {
        Self {
            pubkey,
            in_value: None,
            previous_in_value: None,
            decrypted_pieces: BTreeMap::new(),
        }
    }

    /// Trigger with in-values derived from a private seed
    pub fn from_seed(pubkey: Pubkey, seed: &[u8; 32], round_number: u64) -> Self {
        Self {
            in_value: Some(derive_in_value(seed, round_number)),
            previous_in_value: round_number
                .checked_sub(1)
                .filter(|previous| *previous > 0)
                .map(|previous| derive_in_value(seed, previous)),
            ..Self::new(pubkey)
        }
    }

    pub fn with_decrypted_pieces(mut self, pieces: BTreeMap<Pubkey, SecretShare>) -> Self {
        self.decrypted_pieces = pieces;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::round::tests::{make_round, pubkey};

    #[test]
    fn test_header_round_trip() {
        let mut round = make_round(3, 0, 4_000);
        round.miner_mut(&pubkey(1)).unwrap().out_value = Some(Hash::compute(b"out"));
        let mut header = ConsensusHeaderInformation::new(pubkey(1), Behavior::UpdateValue, round);
        header.decrypted_pieces.insert(
            pubkey(2),
            SecretShare {
                index: 2,
                low: [1u8; 32],
                high: [2u8; 32],
            },
        );

        let bytes = header.to_bytes().unwrap();
        let decoded = ConsensusHeaderInformation::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_malformed_bytes_rejected() {
        assert!(matches!(
            ConsensusHeaderInformation::from_bytes(b"not json"),
            Err(ConsensusError::InvalidHeader(_))
        ));
        assert!(ConsensusHeaderInformation::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_missing_round_decodes() {
        let json = format!(
            r#"{{"sender":"{}","behavior":"NextRound","round":null}}"#,
            pubkey(1).to_hex()
        );
        let header = ConsensusHeaderInformation::from_bytes(json.as_bytes()).unwrap();
        assert!(header.round.is_none());
        assert!(header.decrypted_pieces.is_empty());
    }

    #[test]
    fn test_trigger_from_seed() {
        let seed = [3u8; 32];
        let first = TriggerInformation::from_seed(pubkey(1), &seed, 1);
        assert!(first.previous_in_value.is_none());

        let second = TriggerInformation::from_seed(pubkey(1), &seed, 2);
        assert_eq!(second.previous_in_value, first.in_value);
    }
}
