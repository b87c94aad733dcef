use anyhow::{anyhow, Context, Result};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

/// Ed25519 key trusted to sign published build reference documents.
#[derive(Debug, Clone)]
pub struct TrustedKey {
    key: VerifyingKey,
    identifier: String,
}

impl TrustedKey {
    pub fn from_hex(public_key_hex: &str) -> Result<Self> {
        let trimmed = public_key_hex.trim();
        let bytes = hex::decode(trimmed).context("failed to decode Ed25519 public key hex")?;
        let len = bytes.len();
        let array: [u8; 32] = bytes.try_into().map_err(|_| {
            anyhow!("invalid Ed25519 public key length: expected 32 bytes, got {len}")
        })?;
        let key = VerifyingKey::from_bytes(&array).context("invalid Ed25519 public key bytes")?;

        Ok(Self {
            key,
            identifier: trimmed.chars().take(16).collect(),
        })
    }

    /// First 16 hex characters of the key, used in operator messages.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Checks a detached hex signature. Malformed signatures are errors; a
    /// well-formed signature that does not match returns `Ok(false)`.
    pub fn verify_detached(&self, payload: &[u8], signature_hex: &str) -> Result<bool> {
        let bytes = hex::decode(signature_hex.trim())
            .context("failed to decode Ed25519 signature hex")?;
        let len = bytes.len();
        let array: [u8; 64] = bytes.try_into().map_err(|_| {
            anyhow!("invalid Ed25519 signature length: expected 64 bytes, got {len}")
        })?;
        let signature = Signature::from_bytes(&array);
        Ok(self.key.verify(payload, &signature).is_ok())
    }
}
