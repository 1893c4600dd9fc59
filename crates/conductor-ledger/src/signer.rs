//! Ed25519 signing for ledger entries.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use conductor_core::{ConductorError, Result};

use crate::entry::EntrySignature;

/// Signs entry hashes with an Ed25519 key.
pub struct LedgerSigner {
    key: SigningKey,
}

impl LedgerSigner {
    /// Generate a fresh signing key.
    pub fn generate() -> Self {
        let secret: [u8; 32] = rand::random();
        Self {
            key: SigningKey::from_bytes(&secret),
        }
    }

    /// Construct from a 32-byte seed (for stable keys across restarts).
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    /// Hex-encoded public key.
    pub fn public_key_hex(&self) -> String {
        hex_encode(self.key.verifying_key().as_bytes())
    }

    /// Sign a message, producing a self-describing signature envelope.
    pub fn sign(&self, message: &[u8]) -> EntrySignature {
        let signature: Signature = self.key.sign(message);
        EntrySignature {
            algorithm: "ed25519".to_string(),
            public_key: self.public_key_hex(),
            signature: hex_encode(&signature.to_bytes()),
        }
    }
}

/// Verify a signature envelope against a message.
///
/// Uses the public key carried in the envelope, so any holder of the
/// entries can re-verify without this process's key material.
pub fn verify_signature(sig: &EntrySignature, message: &[u8]) -> Result<()> {
    if sig.algorithm != "ed25519" {
        return Err(ConductorError::Crypto(format!(
            "unsupported signature algorithm: {}",
            sig.algorithm
        )));
    }
    let key_bytes: [u8; 32] = hex_decode(&sig.public_key)?
        .try_into()
        .map_err(|_| ConductorError::Crypto("public key must be 32 bytes".into()))?;
    let sig_bytes: [u8; 64] = hex_decode(&sig.signature)?
        .try_into()
        .map_err(|_| ConductorError::Crypto("signature must be 64 bytes".into()))?;

    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| ConductorError::Crypto(format!("invalid public key: {e}")))?;
    key.verify(message, &Signature::from_bytes(&sig_bytes))
        .map_err(|e| ConductorError::Crypto(format!("signature verification failed: {e}")))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(ConductorError::Crypto("odd-length hex string".into()));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| ConductorError::Crypto(format!("invalid hex at offset {i}")))
        })
        .collect()
}
