//! Transactions as submitted by callers, bound to a nonce, and signed.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::crypto::{hex_bytes, Address, SignerAlgorithm};
use crate::types::{KeywardError, Result};

/// Largest `data` payload accepted for signing (128 KiB)
pub const MAX_DATA_LEN: usize = 128 * 1024;

/// What a caller asks to have signed. The nonce is assigned by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    /// Recipient (`None` for contract creation)
    pub to: Option<Address>,
    pub value: u64,
    pub gas_limit: u64,
    #[serde(with = "hex_bytes", default)]
    pub data: Vec<u8>,
    /// Target chain, checked against the signer algorithm
    #[serde(default)]
    pub chain_id: Option<u64>,
}

impl TransactionRequest {
    /// Simple value transfer with a default gas limit.
    pub fn transfer(to: Address, value: u64) -> Self {
        Self {
            to: Some(to),
            value,
            gas_limit: 21_000,
            data: Vec::new(),
            chain_id: None,
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    pub fn on_chain(mut self, chain_id: u64) -> Self {
        self.chain_id = Some(chain_id);
        self
    }

    /// Bind this request to a sequence number.
    pub fn with_nonce(self, nonce: u64) -> Transaction {
        Transaction {
            nonce,
            to: self.to,
            value: self.value,
            gas_limit: self.gas_limit,
            data: self.data,
            chain_id: self.chain_id,
        }
    }
}

/// A nonce-bound transaction, ready to sign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub nonce: u64,
    pub to: Option<Address>,
    pub value: u64,
    pub gas_limit: u64,
    #[serde(with = "hex_bytes", default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub chain_id: Option<u64>,
}

impl Transaction {
    /// Reject payloads no ledger would accept.
    pub fn validate(&self) -> Result<()> {
        if self.gas_limit == 0 {
            return Err(KeywardError::SigningFailed("gas limit must be non-zero".into()));
        }
        if self.data.len() > MAX_DATA_LEN {
            return Err(KeywardError::SigningFailed(format!(
                "data is {} bytes, limit is {}",
                self.data.len(),
                MAX_DATA_LEN
            )));
        }
        if self.to.is_none() && self.data.is_empty() {
            return Err(KeywardError::SigningFailed(
                "contract creation requires data".into(),
            ));
        }
        Ok(())
    }

    /// MessagePack encoding used as the signing input.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }
}

/// A transaction together with its signature and signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub transaction: Transaction,
    pub algorithm: SignerAlgorithm,
    pub signer: Address,
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
    /// `0x`-prefixed sha256 of canonical bytes followed by the signature
    pub hash: String,
}

impl SignedTransaction {
    pub(crate) fn new(
        transaction: Transaction,
        algorithm: SignerAlgorithm,
        signer: Address,
        public_key: Vec<u8>,
        canonical: &[u8],
        signature: Vec<u8>,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(canonical);
        hasher.update(&signature);
        let hash = format!("0x{}", hex::encode(hasher.finalize()));

        Self {
            transaction,
            algorithm,
            signer,
            public_key,
            signature,
            hash,
        }
    }

    pub fn nonce(&self) -> u64 {
        self.transaction.nonce
    }

    /// Check the signature against the embedded public key and signer address.
    pub fn verify(&self) -> bool {
        let Ok(canonical) = self.transaction.canonical_bytes() else {
            return false;
        };
        let Ok(public_key) = <[u8; 32]>::try_from(self.public_key.as_slice()) else {
            return false;
        };
        let Ok(verifying_key) = ed25519_dalek::VerifyingKey::from_bytes(&public_key) else {
            return false;
        };
        Address::from_verifying_key(&verifying_key) == self.signer
            && self
                .algorithm
                .verify(&self.public_key, &canonical, &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipient() -> Address {
        "0x00000000000000000000000000000000000000aa".parse().unwrap()
    }

    #[test]
    fn test_with_nonce_keeps_fields() {
        let tx = TransactionRequest::transfer(recipient(), 42)
            .on_chain(7)
            .with_nonce(3);
        assert_eq!(tx.nonce, 3);
        assert_eq!(tx.value, 42);
        assert_eq!(tx.chain_id, Some(7));
    }

    #[test]
    fn test_validate_rejects_malformed() {
        let mut tx = TransactionRequest::transfer(recipient(), 1).with_nonce(0);
        assert!(tx.validate().is_ok());

        tx.gas_limit = 0;
        assert!(matches!(tx.validate(), Err(KeywardError::SigningFailed(_))));

        let oversized = TransactionRequest::transfer(recipient(), 1)
            .with_data(vec![0u8; MAX_DATA_LEN + 1])
            .with_nonce(0);
        assert!(oversized.validate().is_err());

        let mut creation = TransactionRequest::transfer(recipient(), 0).with_nonce(0);
        creation.to = None;
        assert!(creation.validate().is_err());
    }

    #[test]
    fn test_canonical_bytes_depend_on_nonce() {
        let request = TransactionRequest::transfer(recipient(), 5);
        let a = request.clone().with_nonce(0).canonical_bytes().unwrap();
        let b = request.with_nonce(1).canonical_bytes().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_request_json_uses_hex_data() {
        let request = TransactionRequest::transfer(recipient(), 5).with_data(vec![0xde, 0xad]);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["data"], "0xdead");
        assert_eq!(json["to"], "0x00000000000000000000000000000000000000aa");

        let back: TransactionRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, request);
    }
}
