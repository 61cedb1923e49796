//! Block header carrying consensus extra data

use crate::{BlockHeight, CoreError, CoreResult, Hash, Pubkey, Timestamp};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

/// Block header as seen by the consensus core.
///
/// Only the fields consensus reads are modelled; everything else about the
/// block belongs to the execution layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode)]
pub struct BlockHeader {
    /// Hash of the parent block
    pub parent_hash: Hash,
    /// Block height
    pub height: BlockHeight,
    /// Block timestamp in milliseconds, the single authoritative time source
    pub timestamp: Timestamp,
    /// Producer of this block
    pub miner: Pubkey,
    /// Serialized consensus header information
    pub consensus_extra_data: Vec<u8>,
}

impl BlockHeader {
    /// Create a new block header
    pub fn new(
        parent_hash: Hash,
        height: BlockHeight,
        timestamp: Timestamp,
        miner: Pubkey,
        consensus_extra_data: Vec<u8>,
    ) -> Self {
        Self {
            parent_hash,
            height,
            timestamp,
            miner,
            consensus_extra_data,
        }
    }

    /// Calculate the hash of this block header
    pub fn hash(&self) -> CoreResult<Hash> {
        let encoded = bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CoreError::Bincode(e.to_string()))?;
        let hash_bytes = Keccak256::digest(&encoded);
        Hash::from_slice(hash_bytes.as_slice())
            .ok_or_else(|| CoreError::InvalidHash("digest is not 32 bytes".to_string()))
    }

    /// Get the genesis block header
    pub fn genesis(timestamp: Timestamp) -> Self {
        Self {
            parent_hash: Hash::zero(),
            height: 1,
            timestamp,
            miner: Pubkey::default(),
            consensus_extra_data: Vec::new(),
        }
    }

    /// Check if this is the genesis header
    pub fn is_genesis(&self) -> bool {
        self.height == 1 && self.parent_hash == Hash::zero()
    }
}
