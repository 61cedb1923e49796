//! Basic consensus types

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use std::fmt;

/// Block height type (64-bit unsigned integer)
pub type BlockHeight = u64;

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = u64;

/// 32-byte hash type
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, bincode::Encode,
)]
pub struct Hash([u8; 32]);

impl Hash {
    /// Create a new hash from byte array
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create hash from slice, `None` if length != 32
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; 32] = slice.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Keccak-256 of arbitrary bytes. This is the one-way commitment used
    /// for OutValue = commit(InValue).
    pub fn compute(data: &[u8]) -> Self {
        let digest = Keccak256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(digest.as_slice());
        Self(bytes)
    }

    /// Commitment of another hash.
    pub fn commit(&self) -> Self {
        Self::compute(&self.0)
    }

    /// XOR both hashes byte-wise and hash the result.
    pub fn xor_and_compute(&self, other: &Hash) -> Self {
        let mut xored = [0u8; 32];
        for (i, byte) in xored.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Self::compute(&xored)
    }

    /// First eight bytes read as a little-endian signed integer.
    pub fn to_i64(&self) -> i64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[..8]);
        i64::from_le_bytes(buf)
    }

    /// Get the underlying byte array
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Create from hex string
    pub fn from_hex(hex: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex)?;
        Self::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }

    /// Zero hash (all bytes are 0)
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Whether this is the zero hash
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl Default for Hash {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Miner public identity.
///
/// Ordered by raw bytes, which is the only ordering consensus code may rely
/// on. Serialized as a lowercase hex string so it can key JSON maps.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, bincode::Encode)]
pub struct Pubkey(Vec<u8>);

impl Pubkey {
    /// Create from raw bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Create from hex string
    pub fn from_hex(hex: &str) -> Result<Self, hex::FromHexError> {
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        Ok(Self(hex::decode(hex)?))
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Get the underlying bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// First byte of the identity, 0 for an empty key
    pub fn first_byte(&self) -> u8 {
        self.0.first().copied().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough for logs
        let hex = self.to_hex();
        if hex.len() > 12 {
            write!(f, "{}..", &hex[..12])
        } else {
            write!(f, "{}", hex)
        }
    }
}

impl From<secp256k1::PublicKey> for Pubkey {
    fn from(key: secp256k1::PublicKey) -> Self {
        Self(key.serialize().to_vec())
    }
}

impl From<Vec<u8>> for Pubkey {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Pubkey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for Pubkey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Pubkey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Pubkey::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_creation() {
        let hash = Hash::zero();
        assert_eq!(
            hash.to_hex(),
            "0000000000000000000000000000000000000000000000000000000000000000"
        );
        assert!(hash.is_zero());

        let bytes = [1u8; 32];
        let hash2 = Hash::new(bytes);
        assert_eq!(
            hash2.to_hex(),
            "0101010101010101010101010101010101010101010101010101010101010101"
        );
    }

    #[test]
    fn test_hash_from_hex() {
        let hex = "1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef";
        let hash = Hash::from_hex(hex).unwrap();
        assert_eq!(hash.to_hex(), hex);
        assert!(Hash::from_hex("1234").is_err());
    }

    #[test]
    fn test_commitment_is_deterministic() {
        let secret = Hash::compute(b"in value");
        assert_eq!(secret.commit(), secret.commit());
        assert_ne!(secret.commit(), secret);
    }

    #[test]
    fn test_xor_and_compute_is_symmetric() {
        let a = Hash::compute(b"a");
        let b = Hash::compute(b"b");
        assert_eq!(a.xor_and_compute(&b), b.xor_and_compute(&a));
        // x ^ x = 0, so the result is the hash of the zero array
        assert_eq!(a.xor_and_compute(&a), Hash::compute(&[0u8; 32]));
    }

    #[test]
    fn test_to_i64_little_endian() {
        let mut bytes = [0u8; 32];
        bytes[0] = 7;
        assert_eq!(Hash::new(bytes).to_i64(), 7);

        let bytes = [0xffu8; 32];
        assert_eq!(Hash::new(bytes).to_i64(), -1);
    }

    #[test]
    fn test_pubkey_hex_and_ordering() {
        let a = Pubkey::from_hex("0x02aa").unwrap();
        let b = Pubkey::from_hex("02ab").unwrap();
        assert_eq!(a.to_hex(), "02aa");
        assert!(a < b);
        assert_eq!(a.first_byte(), 0x02);
        assert_eq!(Pubkey::default().first_byte(), 0);
    }

    #[test]
    fn test_pubkey_serializes_as_map_key() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(Pubkey::from_hex("03ff").unwrap(), 1u64);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"03ff":1}"#);
        let back: std::collections::BTreeMap<Pubkey, u64> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_pubkey_from_secp256k1() {
        // Compressed generator point
        let bytes =
            hex::decode("0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798")
                .unwrap();
        let key = secp256k1::PublicKey::from_slice(&bytes).unwrap();
        let pubkey = Pubkey::from(key);
        assert_eq!(pubkey.as_bytes(), bytes.as_slice());
    }
}
