//! Signing capability consumed by the relayer
//!
//! The core only ever sees `SigningCapability`; key custody stays with the
//! implementation. `Ed25519Signer` is the in-process implementation used by
//! the binary and tests.

use crate::error::{RelayerError, RelayerResult};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

/// External signing capability: signs 32-byte digests
pub trait SigningCapability: Send + Sync {
    /// Hex-encoded public key, used as the signer/relayer id
    fn signer_id(&self) -> String;

    /// Sign a digest, returning the raw signature bytes
    fn sign_digest(&self, digest: &[u8; 32]) -> RelayerResult<Vec<u8>>;
}

/// ed25519 signer holding its own key
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_hex(secret_hex: &str) -> RelayerResult<Self> {
        let bytes = hex::decode(secret_hex.trim().trim_start_matches("0x"))
            .map_err(|e| RelayerError::Signing(format!("invalid key hex: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| RelayerError::Signing("signing key must be 32 bytes".to_string()))?;
        Ok(Self {
            key: SigningKey::from_bytes(&bytes),
        })
    }
}

impl SigningCapability for Ed25519Signer {
    fn signer_id(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }

    fn sign_digest(&self, digest: &[u8; 32]) -> RelayerResult<Vec<u8>> {
        Ok(self.key.sign(digest).to_bytes().to_vec())
    }
}

impl std::fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ed25519Signer({})", self.signer_id())
    }
}

/// Verify an ed25519 signature over a digest. Malformed keys or
/// signatures simply fail verification.
pub fn verify_signature(signer_id: &str, digest: &[u8; 32], signature: &[u8]) -> bool {
    let Ok(key_bytes) = hex::decode(signer_id.trim_start_matches("0x")) else {
        return false;
    };
    let Ok(key_bytes) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(digest, &signature).is_ok()
}
