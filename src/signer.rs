// Signing and verification of canonical transaction payloads.
// Both curves sign the sha256 prehash of the payload bytes.
use dashmap::DashMap;
use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::OnceLock;
use tracing::debug;

use crate::error::{ResolverError, ResolverResult};
use crate::transaction::Transaction;

// Parsed verifying keys, keyed by the 33-byte compressed SEC1 pubkey.
static SECP_CACHE: OnceLock<DashMap<[u8; 33], k256::ecdsa::VerifyingKey>> = OnceLock::new();
static P256_CACHE: OnceLock<DashMap<[u8; 33], p256::ecdsa::VerifyingKey>> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    Secp256k1,
    P256,
}

/// Opaque private-key capability. Caller-owned, passed per call, never logged.
#[derive(Clone)]
pub struct SignerKey {
    secret: Vec<u8>,
    key_type: KeyType,
}

impl SignerKey {
    pub fn new(secret: Vec<u8>, key_type: KeyType) -> Self {
        Self { secret, key_type }
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn secret_bytes(&self) -> &[u8] {
        &self.secret
    }

    /// Compressed SEC1 verkey for this secret.
    pub fn public_key(&self) -> ResolverResult<[u8; 33]> {
        let encoded = match self.key_type {
            KeyType::Secp256k1 => {
                let sk = k256::ecdsa::SigningKey::from_slice(&self.secret)
                    .map_err(|e| ResolverError::SigningFailed(format!("invalid secp256k1 key: {}", e)))?;
                sk.verifying_key().to_encoded_point(true).as_bytes().to_vec()
            }
            KeyType::P256 => {
                let sk = p256::ecdsa::SigningKey::from_slice(&self.secret)
                    .map_err(|e| ResolverError::SigningFailed(format!("invalid P-256 key: {}", e)))?;
                sk.verifying_key().to_encoded_point(true).as_bytes().to_vec()
            }
        };
        encoded
            .try_into()
            .map_err(|_| ResolverError::SigningFailed("unexpected public key length".to_string()))
    }
}

impl fmt::Debug for SignerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerKey")
            .field("key_type", &self.key_type)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Signature capability. Implementations must be deterministic or otherwise safe:
/// never fall back to a key other than the one supplied.
pub trait Signer: Send + Sync {
    fn sign(&self, bytes: &[u8], key: &SignerKey) -> Result<Vec<u8>, String>;
}

pub struct Secp256k1Signer;

impl Signer for Secp256k1Signer {
    fn sign(&self, bytes: &[u8], key: &SignerKey) -> Result<Vec<u8>, String> {
        if key.key_type != KeyType::Secp256k1 {
            return Err(format!("expected a secp256k1 key, got {:?}", key.key_type));
        }
        let sk = k256::ecdsa::SigningKey::from_slice(&key.secret).map_err(|e| e.to_string())?;
        let hash = Sha256::digest(bytes);
        let sig: k256::ecdsa::Signature = sk.sign_prehash(&hash).map_err(|e| e.to_string())?;
        Ok(sig.to_bytes().to_vec())
    }
}

pub struct P256Signer;

impl Signer for P256Signer {
    fn sign(&self, bytes: &[u8], key: &SignerKey) -> Result<Vec<u8>, String> {
        if key.key_type != KeyType::P256 {
            return Err(format!("expected a P-256 key, got {:?}", key.key_type));
        }
        let sk = p256::ecdsa::SigningKey::from_slice(&key.secret).map_err(|e| e.to_string())?;
        let hash = Sha256::digest(bytes);
        let sig: p256::ecdsa::Signature = sk.sign_prehash(&hash).map_err(|e| e.to_string())?;
        Ok(sig.to_bytes().to_vec())
    }
}

/// Signer for whichever curve the key declares.
pub struct AnySigner;

impl Signer for AnySigner {
    fn sign(&self, bytes: &[u8], key: &SignerKey) -> Result<Vec<u8>, String> {
        match key.key_type {
            KeyType::Secp256k1 => Secp256k1Signer.sign(bytes, key),
            KeyType::P256 => P256Signer.sign(bytes, key),
        }
    }
}

/// Attaches a single signature over the canonical payload.
pub fn sign_transaction(mut tx: Transaction, signer: &dyn Signer, key: &SignerKey) -> ResolverResult<Transaction> {
    let signature = signer
        .sign(&tx.payload, key)
        .map_err(ResolverError::SigningFailed)?;
    if signature.is_empty() {
        return Err(ResolverError::SigningFailed("signer returned an empty signature".to_string()));
    }
    debug!(req_id = tx.req_id, submitter = %tx.submitter, "transaction signed");
    tx.signature = Some(signature);
    Ok(tx)
}

/// Adds a signature under `signer_did`. A pre-existing single signature is moved
/// under the transaction's own submitter.
pub fn multi_sign_transaction(
    mut tx: Transaction,
    signer_did: &str,
    signer: &dyn Signer,
    key: &SignerKey,
) -> ResolverResult<Transaction> {
    crate::identifier::Identifier::parse(signer_did)?;
    let signature = signer
        .sign(&tx.payload, key)
        .map_err(ResolverError::SigningFailed)?;
    if let Some(existing) = tx.signature.take() {
        tx.signatures.insert(tx.submitter.to_string(), existing);
    }
    tx.signatures.insert(signer_did.to_string(), signature);
    debug!(req_id = tx.req_id, signers = tx.signatures.len(), "transaction multi-signed");
    Ok(tx)
}

pub fn verify_signature(payload: &[u8], sig_bytes: &[u8], pubkey_bytes: &[u8; 33], key_type: KeyType) -> bool {
    let hash = Sha256::digest(payload);

    match key_type {
        KeyType::Secp256k1 => {
            let cache = SECP_CACHE.get_or_init(|| DashMap::with_capacity(1024));
            let signature = match k256::ecdsa::Signature::from_slice(sig_bytes) {
                Ok(s) => s,
                Err(_) => return false,
            };
            if let Some(vk) = cache.get(pubkey_bytes) {
                return vk.verify_prehash(&hash, &signature).is_ok();
            }
            match k256::ecdsa::VerifyingKey::from_sec1_bytes(pubkey_bytes) {
                Ok(vk) => {
                    let ok = vk.verify_prehash(&hash, &signature).is_ok();
                    if cache.len() > 100_000 { cache.clear(); }
                    cache.insert(*pubkey_bytes, vk);
                    ok
                }
                Err(_) => false,
            }
        }
        KeyType::P256 => {
            let cache = P256_CACHE.get_or_init(|| DashMap::with_capacity(1024));
            let signature = match p256::ecdsa::Signature::from_slice(sig_bytes) {
                Ok(s) => s,
                Err(_) => return false,
            };
            if let Some(vk) = cache.get(pubkey_bytes) {
                return vk.verify_prehash(&hash, &signature).is_ok();
            }
            match p256::ecdsa::VerifyingKey::from_sec1_bytes(pubkey_bytes) {
                Ok(vk) => {
                    let ok = vk.verify_prehash(&hash, &signature).is_ok();
                    if cache.len() > 100_000 { cache.clear(); }
                    cache.insert(*pubkey_bytes, vk);
                    ok
                }
                Err(_) => false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::transaction::TransactionBuilder;
    use rand::RngCore;

    fn random_key(key_type: KeyType) -> SignerKey {
        // top bit cleared keeps the scalar below both curve orders
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        secret[0] &= 0x7f;
        SignerKey::new(secret.to_vec(), key_type)
    }

    fn sample_tx() -> Transaction {
        TransactionBuilder::new("sov")
            .build_did_delete("did:sov:Th7MpTaRZVRYnPiabds81Y", "did:sov:WRfXPg8dantKVubE3HX8pw")
            .unwrap()
    }

    #[test]
    fn test_sign_and_verify_both_curves() {
        for kt in [KeyType::Secp256k1, KeyType::P256] {
            let key = random_key(kt);
            let tx = sign_transaction(sample_tx(), &AnySigner, &key).unwrap();
            let pk = key.public_key().unwrap();
            let sig = tx.signature.as_ref().unwrap();
            assert!(verify_signature(&tx.payload, sig, &pk, kt));
            assert!(!verify_signature(b"tampered", sig, &pk, kt));
        }
    }

    #[test]
    fn test_signature_is_reproducible_from_request_bytes() {
        let key = random_key(KeyType::Secp256k1);
        let tx = sign_transaction(sample_tx(), &Secp256k1Signer, &key).unwrap();
        let request: serde_json::Value = serde_json::from_slice(&tx.request_bytes().unwrap()).unwrap();
        let recomputed = crate::parser::canonical::canonicalize_for_signing(&request);
        assert_eq!(recomputed, tx.payload);
        let sig = bs58::decode(request["signature"].as_str().unwrap()).into_vec().unwrap();
        assert!(verify_signature(&recomputed, &sig, &key.public_key().unwrap(), KeyType::Secp256k1));
    }

    #[test]
    fn test_invalid_key_is_signing_failed() {
        let key = SignerKey::new(vec![0u8; 32], KeyType::Secp256k1);
        let err = sign_transaction(sample_tx(), &Secp256k1Signer, &key).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SigningFailed);

        let key = SignerKey::new(vec![1u8; 12], KeyType::P256);
        assert_eq!(sign_transaction(sample_tx(), &P256Signer, &key).unwrap_err().kind(), ErrorKind::SigningFailed);

        let wrong_curve = random_key(KeyType::P256);
        assert!(sign_transaction(sample_tx(), &Secp256k1Signer, &wrong_curve).is_err());
    }

    #[test]
    fn test_multi_sign_moves_single_signature() {
        let a = random_key(KeyType::Secp256k1);
        let b = random_key(KeyType::Secp256k1);
        let tx = sign_transaction(sample_tx(), &AnySigner, &a).unwrap();
        let tx = multi_sign_transaction(tx, "did:sov:V4SGRU86Z58d6TV7PBUe6f", &AnySigner, &b).unwrap();
        assert!(tx.signature.is_none());
        assert_eq!(tx.signatures.len(), 2);
        assert!(tx.signatures.contains_key("did:sov:Th7MpTaRZVRYnPiabds81Y"));
        assert!(tx.signatures.contains_key("did:sov:V4SGRU86Z58d6TV7PBUe6f"));
        assert!(tx.is_signed());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let key = SignerKey::new(vec![0xAB; 32], KeyType::P256);
        let dbg = format!("{:?}", key);
        assert!(dbg.contains("redacted"));
        assert!(!dbg.contains("171"));
    }
}
