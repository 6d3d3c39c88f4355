//! Hashlock derivation and secret verification
//!
//! Comparisons run on fixed-size keccak256 digests with `subtle`, never on
//! the raw secret bytes, so a mismatch leaks nothing about how close a
//! guess was.

use crate::types::{Hashlock, Secret};

use sha3::{Digest, Keccak256};
use subtle::ConstantTimeEq;

/// keccak256 of arbitrary bytes
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Commitment for a secret
pub fn generate_hashlock(secret: &Secret) -> Hashlock {
    Hashlock(keccak256(secret.as_bytes()))
}

/// Check a revealed secret against a hashlock
pub fn verify_secret(secret: &Secret, hashlock: &Hashlock) -> bool {
    let computed = keccak256(secret.as_bytes());
    computed.ct_eq(hashlock.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_for_random_secrets() {
        for _ in 0..32 {
            let secret = Secret::random();
            let hashlock = generate_hashlock(&secret);
            assert!(verify_secret(&secret, &hashlock));
        }
    }

    #[test]
    fn different_secret_never_verifies() {
        for i in 0..32u8 {
            let s1 = Secret::new([i; 32]);
            let mut other = [i; 32];
            other[31] ^= 0x01;
            let s2 = Secret::new(other);
            assert!(!verify_secret(&s2, &generate_hashlock(&s1)));
        }
    }

    #[test]
    fn hashlock_is_deterministic() {
        let secret = Secret::new([0xAB; 32]);
        assert_eq!(generate_hashlock(&secret), generate_hashlock(&secret.clone()));
    }

    #[test]
    fn keccak_matches_known_vector() {
        // keccak256("") from the Ethereum yellow paper
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }
}
