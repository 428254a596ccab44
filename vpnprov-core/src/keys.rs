//! WireGuard key material.
//!
//! Key pairs are X25519 (Curve25519) values and pre-shared keys are 32 random
//! bytes; everything leaves this module base64-encoded with the standard
//! padded alphabet, i.e. 44 characters per key.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

pub const KEY_LEN: usize = 32;
pub const ENCODED_KEY_LEN: usize = 44;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("entropy source unavailable: {0}")]
    Entropy(String),
    #[error("invalid base64 key: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("invalid key length: expected {KEY_LEN} bytes, got {0}")]
    Length(usize),
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Full key set for one peer allocation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireGuardKeys {
    pub private_key: String,
    pub public_key: String,
    pub preshared_key: Option<String>,
}

impl std::fmt::Debug for WireGuardKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireGuardKeys")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .field("preshared_key", &self.preshared_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn random_bytes() -> Result<[u8; KEY_LEN], KeyError> {
    let mut bytes = [0u8; KEY_LEN];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| KeyError::Entropy(e.to_string()))?;
    Ok(bytes)
}

/// Generate a Curve25519 key pair.
pub fn generate_key_pair() -> Result<KeyPair, KeyError> {
    let mut seed = random_bytes()?;
    // Clamp the scalar the same way `wg genkey` does.
    seed[0] &= 248;
    seed[31] &= 127;
    seed[31] |= 64;

    let secret = StaticSecret::from(seed);
    seed.zeroize();
    let public = PublicKey::from(&secret);

    let mut private_bytes = secret.to_bytes();
    let private_key = B64.encode(private_bytes);
    private_bytes.zeroize();

    Ok(KeyPair {
        private_key,
        public_key: B64.encode(public.as_bytes()),
    })
}

/// Generate an independent symmetric pre-shared key.
pub fn generate_preshared_key() -> Result<String, KeyError> {
    let mut bytes = random_bytes()?;
    let encoded = B64.encode(bytes);
    bytes.zeroize();
    Ok(encoded)
}

pub fn generate_keys(with_preshared: bool) -> Result<WireGuardKeys, KeyError> {
    let pair = generate_key_pair()?;
    let preshared_key = if with_preshared {
        Some(generate_preshared_key()?)
    } else {
        None
    };
    Ok(WireGuardKeys {
        private_key: pair.private_key,
        public_key: pair.public_key,
        preshared_key,
    })
}

/// Derive the public half of a base64 private key.
pub fn public_key_for(private_key: &str) -> Result<String, KeyError> {
    let mut raw = decode_key(private_key)?;
    let secret = StaticSecret::from(raw);
    raw.zeroize();
    Ok(B64.encode(PublicKey::from(&secret).as_bytes()))
}

/// Decode a base64 key into its 32 raw bytes.
pub fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let bytes = B64.decode(encoded.trim())?;
    if bytes.len() != KEY_LEN {
        return Err(KeyError::Length(bytes.len()));
    }
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// True for exactly 44 base64 characters encoding 32 bytes.
pub fn is_valid_key(encoded: &str) -> bool {
    encoded.len() == ENCODED_KEY_LEN && decode_key(encoded).is_ok()
}
