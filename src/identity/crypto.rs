//! Key material, addresses and signer algorithms.
//!
//! # Algorithms
//!
//! - **Signature**: Ed25519
//! - **Digest**: SHA-256 over the canonical transaction bytes, optionally
//!   prefixed with a big-endian chain id for replay protection
//!
//! Private key bytes are zeroized when dropped.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::types::{KeywardError, Result};

// =============================================================================
// Constants
// =============================================================================

/// Ed25519 private key length (32 bytes)
pub const PRIVATE_KEY_LEN: usize = 32;

/// Address length (20 bytes, tail of the public key digest)
pub const ADDRESS_LEN: usize = 20;

/// Ed25519 signature length (64 bytes)
pub const SIGNATURE_LEN: usize = 64;

// =============================================================================
// Private Key Material
// =============================================================================

/// Raw private key bytes supplied by the embedding service at Generate time.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKeyMaterial {
    bytes: [u8; PRIVATE_KEY_LEN],
}

impl PrivateKeyMaterial {
    pub fn from_bytes(bytes: [u8; PRIVATE_KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Parse hex-encoded key material (an optional `0x` prefix is accepted).
    pub fn from_hex(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);

        let mut decoded = hex::decode(trimmed)
            .map_err(|e| KeywardError::InvalidKeyMaterial(format!("not hex: {e}")))?;

        if decoded.len() != PRIVATE_KEY_LEN {
            let len = decoded.len();
            decoded.zeroize();
            return Err(KeywardError::InvalidKeyMaterial(format!(
                "expected {PRIVATE_KEY_LEN} bytes, got {len}"
            )));
        }

        let mut bytes = [0u8; PRIVATE_KEY_LEN];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self { bytes })
    }

    /// Generate fresh key material from the OS random number generator.
    pub fn generate() -> Self {
        let mut bytes = [0u8; PRIVATE_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub(crate) fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.bytes)
    }
}

impl fmt::Debug for PrivateKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKeyMaterial(<redacted>)")
    }
}

// =============================================================================
// Address
// =============================================================================

/// Account address derived from a verifying key.
///
/// The last 20 bytes of `sha256(public_key)`, rendered as `0x`-prefixed hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes.copy_from_slice(&digest[digest.len() - ADDRESS_LEN..]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl FromStr for Address {
    type Err = KeywardError;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let decoded = hex::decode(raw)
            .map_err(|e| KeywardError::Config(format!("invalid address {s}: {e}")))?;
        let bytes: [u8; ADDRESS_LEN] = decoded.try_into().map_err(|_| {
            KeywardError::Config(format!("invalid address {s}: expected {ADDRESS_LEN} bytes"))
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Signer Algorithm
// =============================================================================

/// How a transaction is turned into the message that gets signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignerAlgorithm {
    /// Ed25519 over `sha256(tx)`. Transactions must not name a chain.
    #[default]
    Plain,
    /// Ed25519 over `sha256(chain_id_be || tx)`. Transactions must name
    /// this chain or none.
    ChainBound { chain_id: u64 },
}

impl SignerAlgorithm {
    /// Check that a transaction targeting `chain_id` can be signed.
    pub fn check_chain(&self, chain_id: Option<u64>) -> Result<()> {
        match (self, chain_id) {
            (Self::Plain, None) => Ok(()),
            (Self::Plain, Some(id)) => Err(KeywardError::SigningFailed(format!(
                "plain signer cannot sign for chain {id}"
            ))),
            (Self::ChainBound { .. }, None) => Ok(()),
            (Self::ChainBound { chain_id: expected }, Some(id)) if *expected == id => Ok(()),
            (Self::ChainBound { chain_id: expected }, Some(id)) => Err(KeywardError::SigningFailed(
                format!("chain id mismatch: signer bound to {expected}, transaction targets {id}"),
            )),
        }
    }

    /// Digest of the canonical transaction bytes under this algorithm.
    pub fn digest(&self, canonical: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        if let Self::ChainBound { chain_id } = self {
            hasher.update(chain_id.to_be_bytes());
        }
        hasher.update(canonical);
        hasher.finalize().into()
    }

    pub fn sign(&self, key: &SigningKey, canonical: &[u8]) -> [u8; SIGNATURE_LEN] {
        key.sign(&self.digest(canonical)).to_bytes()
    }

    pub fn verify(&self, public_key: &[u8], canonical: &[u8], signature: &[u8]) -> bool {
        let Ok(public_key) = <[u8; 32]>::try_from(public_key) else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&public_key) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        verifying_key
            .verify(&self.digest(canonical), &signature)
            .is_ok()
    }
}

impl fmt::Display for SignerAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => f.write_str("plain"),
            Self::ChainBound { chain_id } => write!(f, "chain-bound({chain_id})"),
        }
    }
}

// =============================================================================
// Serde helpers
// =============================================================================

/// Bytes as hex in human-readable formats (JSON), raw bytes otherwise.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
        } else {
            serializer.serialize_bytes(bytes)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(serde::de::Error::custom)
        } else {
            raw_bytes(deserializer)
        }
    }

    fn raw_bytes<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        struct BytesVisitor;

        impl<'de> serde::de::Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a byte array")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Vec<u8>, E> {
                Ok(v)
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<u8>, A::Error> {
                let mut out = Vec::new();
                while let Some(b) = seq.next_element::<u8>()? {
                    out.push(b);
                }
                Ok(out)
            }
        }

        deserializer.deserialize_byte_buf(BytesVisitor)
    }
}
