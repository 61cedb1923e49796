//! Shamir secret sharing of in-values
//!
//! A miner that fails to reveal its in-value one round late can still have
//! it reconstructed from shares decrypted by the rest of the committee. The
//! 32 byte secret does not fit the scalar field, so it is split into two
//! 16 byte halves that are shared independently with the same indices.

use crate::round::Round;
use crate::{ConsensusError, ConsensusResult};
use curve25519_dalek::scalar::Scalar;
use dpos_core::{Hash, Pubkey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// One share of a split in-value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode)]
pub struct SecretShare {
    /// Evaluation point, starting from 1
    pub index: u32,
    /// Share of the first half
    pub low: [u8; 32],
    /// Share of the second half
    pub high: [u8; 32],
}

/// Split a secret into `total` shares, any `threshold` of which recover it.
pub fn split_secret(
    secret: &Hash,
    threshold: usize,
    total: usize,
) -> ConsensusResult<Vec<SecretShare>> {
    if threshold == 0 || threshold > total {
        return Err(ConsensusError::SecretSharing(format!(
            "Threshold {} is not within 1..={}",
            threshold, total
        )));
    }
    let total = u32::try_from(total)
        .map_err(|_| ConsensusError::SecretSharing("Too many shares".to_string()))?;

    let (low, high) = halves(secret);
    let low_polynomial = random_polynomial(low, threshold);
    let high_polynomial = random_polynomial(high, threshold);

    Ok((1..=total)
        .map(|index| {
            let x = Scalar::from(u64::from(index));
            SecretShare {
                index,
                low: evaluate(&low_polynomial, x).to_bytes(),
                high: evaluate(&high_polynomial, x).to_bytes(),
            }
        })
        .collect())
}

/// Recover a secret from at least `threshold` shares with distinct indices.
pub fn recover_secret(shares: &[SecretShare], threshold: usize) -> ConsensusResult<Hash> {
    if threshold == 0 {
        return Err(ConsensusError::SecretSharing(
            "Threshold must be greater than 0".to_string(),
        ));
    }

    let mut seen = BTreeSet::new();
    let selected: Vec<&SecretShare> = shares
        .iter()
        .filter(|share| share.index != 0 && seen.insert(share.index))
        .take(threshold)
        .collect();
    if selected.len() < threshold {
        return Err(ConsensusError::SecretSharing(format!(
            "Need {} shares, got {}",
            threshold,
            selected.len()
        )));
    }

    let xs: Vec<Scalar> = selected
        .iter()
        .map(|share| Scalar::from(u64::from(share.index)))
        .collect();

    // Lagrange interpolation at x = 0
    let mut low = Scalar::ZERO;
    let mut high = Scalar::ZERO;
    for (i, share) in selected.iter().enumerate() {
        let mut numerator = Scalar::ONE;
        let mut denominator = Scalar::ONE;
        for (j, x) in xs.iter().enumerate() {
            if i != j {
                numerator *= x;
                denominator *= x - xs[i];
            }
        }
        let basis = numerator * denominator.invert();
        low += basis * decode_scalar(&share.low)?;
        high += basis * decode_scalar(&share.high)?;
    }

    join_halves(&low, &high)
}

/// Reconstruct in-values the committee failed to reveal.
///
/// For every miner that committed an OutValue in `previous` but has no
/// PreviousInValue in `current`, recover the secret from its decrypted
/// shares and adopt it when the commitment matches. Returns the miners
/// whose in-value was revealed this way.
pub fn reveal_shared_in_values(current: &mut Round, previous: &Round) -> Vec<Pubkey> {
    let threshold = previous.miners_count_of_consent();
    let mut revealed = Vec::new();

    for (pubkey, previous_miner) in &previous.miners {
        let Some(out_value) = previous_miner.out_value.filter(|hash| !hash.is_zero()) else {
            continue;
        };
        let Some(current_miner) = current.miners.get_mut(pubkey) else {
            continue;
        };
        if current_miner.has_previous_in_value()
            || previous_miner.decrypted_pieces.len() < threshold
        {
            continue;
        }

        let shares: Vec<SecretShare> = previous_miner.decrypted_pieces.values().copied().collect();
        match recover_secret(&shares, threshold) {
            Ok(secret) if secret.commit() == out_value => {
                debug!("Revealed in value of {} from shares", pubkey);
                current_miner.previous_in_value = Some(secret);
                revealed.push(pubkey.clone());
            }
            Ok(_) => warn!("Shares of {} do not match its out value", pubkey),
            Err(e) => warn!("Failed to reveal in value of {}: {}", pubkey, e),
        }
    }

    revealed
}

fn halves(secret: &Hash) -> (Scalar, Scalar) {
    let bytes = secret.as_bytes();
    let mut low = [0u8; 32];
    let mut high = [0u8; 32];
    low[..16].copy_from_slice(&bytes[..16]);
    high[..16].copy_from_slice(&bytes[16..]);
    (
        Scalar::from_bytes_mod_order(low),
        Scalar::from_bytes_mod_order(high),
    )
}

fn join_halves(low: &Scalar, high: &Scalar) -> ConsensusResult<Hash> {
    let low = low.to_bytes();
    let high = high.to_bytes();
    if low[16..].iter().chain(high[16..].iter()).any(|b| *b != 0) {
        return Err(ConsensusError::SecretSharing(
            "Recovered value is out of range".to_string(),
        ));
    }
    let mut bytes = [0u8; 32];
    bytes[..16].copy_from_slice(&low[..16]);
    bytes[16..].copy_from_slice(&high[..16]);
    Ok(Hash::new(bytes))
}

fn random_polynomial(constant: Scalar, threshold: usize) -> Vec<Scalar> {
    let mut coefficients = Vec::with_capacity(threshold);
    coefficients.push(constant);
    for _ in 1..threshold {
        coefficients.push(Scalar::from_bytes_mod_order(rand::random::<[u8; 32]>()));
    }
    coefficients
}

fn evaluate(coefficients: &[Scalar], x: Scalar) -> Scalar {
    // Horner
    coefficients
        .iter()
        .rev()
        .fold(Scalar::ZERO, |acc, coefficient| acc * x + *coefficient)
}

fn decode_scalar(bytes: &[u8; 32]) -> ConsensusResult<Scalar> {
    Option::<Scalar>::from(Scalar::from_canonical_bytes(*bytes))
        .ok_or_else(|| ConsensusError::SecretSharing("Share is not a canonical scalar".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::round::tests::{make_round, pubkey};

    #[test]
    fn test_split_and_recover() {
        let secret = Hash::compute(b"in value");
        let shares = split_secret(&secret, 3, 5).unwrap();
        assert_eq!(shares.len(), 5);

        assert_eq!(recover_secret(&shares[..3], 3).unwrap(), secret);
        assert_eq!(recover_secret(&shares[2..], 3).unwrap(), secret);
        let picked = [shares[4], shares[0], shares[2]];
        assert_eq!(recover_secret(&picked, 3).unwrap(), secret);
    }

    #[test]
    fn test_too_few_shares() {
        let secret = Hash::compute(b"in value");
        let shares = split_secret(&secret, 3, 5).unwrap();
        assert!(recover_secret(&shares[..2], 3).is_err());
        // Duplicated indices do not count twice
        let duplicated = [shares[0], shares[0], shares[1]];
        assert!(recover_secret(&duplicated, 3).is_err());
    }

    #[test]
    fn test_invalid_threshold() {
        let secret = Hash::compute(b"in value");
        assert!(split_secret(&secret, 0, 5).is_err());
        assert!(split_secret(&secret, 6, 5).is_err());
    }

    #[test]
    fn test_reveal_shared_in_values() {
        let secret = Hash::compute(b"secret of miner 1");
        let owner = pubkey(1);

        let mut previous = make_round(5, 0, 4_000);
        let shares = split_secret(&secret, previous.miners_count_of_consent(), 5).unwrap();
        let record = previous.miner_mut(&owner).unwrap();
        record.out_value = Some(secret.commit());
        for (i, share) in shares.iter().take(4).enumerate() {
            record.decrypted_pieces.insert(pubkey(i as u8), *share);
        }

        let mut current = make_round(5, 24_000, 4_000);
        let revealed = reveal_shared_in_values(&mut current, &previous);
        assert_eq!(revealed, vec![owner.clone()]);
        assert_eq!(current.miner(&owner).unwrap().previous_in_value, Some(secret));
    }

    #[test]
    fn test_reveal_rejects_wrong_commitment() {
        let owner = pubkey(2);
        let mut previous = make_round(3, 0, 4_000);
        let shares = split_secret(&Hash::compute(b"other"), 3, 3).unwrap();
        let record = previous.miner_mut(&owner).unwrap();
        record.out_value = Some(Hash::compute(b"secret").commit());
        for (i, share) in shares.iter().enumerate() {
            record.decrypted_pieces.insert(pubkey(i as u8), *share);
        }

        let mut current = make_round(3, 16_000, 4_000);
        assert!(reveal_shared_in_values(&mut current, &previous).is_empty());
        assert!(current.miner(&owner).unwrap().previous_in_value.is_none());
    }
}
