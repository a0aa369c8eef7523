//! Namespaced identifiers: `scheme:method:id`.
//!
//! DIDs are `did:<method>:<base58>`; context documents are addressed by the
//! hash of their canonical bytes as `did:<method>:context:<base58 sha256>`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{ResolverError, ResolverResult};

pub const CONTEXT_SEGMENT: &str = "context";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdentifierKind {
    Did,
    Context,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    pub fn parse(raw: &str) -> ResolverResult<Self> {
        let mut parts = raw.splitn(3, ':');
        let scheme = parts.next().unwrap_or("");
        let method = parts.next().unwrap_or("");
        let id = parts.next().unwrap_or("");

        if scheme.is_empty() || method.is_empty() || id.is_empty() {
            return Err(ResolverError::InvalidIdentifier(format!(
                "'{}' does not match scheme:method:id",
                raw
            )));
        }
        if !is_name_segment(scheme) {
            return Err(ResolverError::InvalidIdentifier(format!("bad scheme in '{}'", raw)));
        }
        if !is_name_segment(method) {
            return Err(ResolverError::InvalidIdentifier(format!("bad method in '{}'", raw)));
        }
        if !id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':'))
            || id.ends_with(':')
            || id.contains("::")
        {
            return Err(ResolverError::InvalidIdentifier(format!("bad method-specific id in '{}'", raw)));
        }

        let ident = Identifier(raw.to_string());
        if id.starts_with("context:") && ident.context_hash().is_none() {
            return Err(ResolverError::InvalidIdentifier(format!(
                "'{}' is not a valid content-addressed context id",
                raw
            )));
        }
        Ok(ident)
    }

    /// Parses an optional identifier; empty strings count as absent.
    pub fn parse_opt(raw: Option<&str>) -> ResolverResult<Option<Self>> {
        match raw {
            Some(s) if !s.is_empty() => Ok(Some(Self::parse(s)?)),
            _ => Ok(None),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn scheme(&self) -> &str {
        self.0.split(':').next().unwrap_or("")
    }

    pub fn method(&self) -> &str {
        self.0.split(':').nth(1).unwrap_or("")
    }

    /// Everything after `scheme:method:`.
    pub fn method_specific_id(&self) -> &str {
        self.0.splitn(3, ':').nth(2).unwrap_or("")
    }

    pub fn kind(&self) -> IdentifierKind {
        if self.context_hash().is_some() {
            IdentifierKind::Context
        } else {
            IdentifierKind::Did
        }
    }

    pub fn is_context(&self) -> bool {
        self.kind() == IdentifierKind::Context
    }

    /// The 32-byte content hash encoded in a context identifier.
    pub fn context_hash(&self) -> Option<[u8; 32]> {
        let encoded = self.method_specific_id().strip_prefix("context:")?;
        let decoded = bs58::decode(encoded).into_vec().ok()?;
        decoded.try_into().ok()
    }

    pub fn for_context(method: &str, content_hash: &[u8; 32]) -> Self {
        Identifier(format!(
            "did:{}:{}:{}",
            method,
            CONTEXT_SEGMENT,
            bs58::encode(content_hash).into_string()
        ))
    }

    /// Long-form DID: base58 of the first 16 bytes of the verkey.
    pub fn from_verkey(method: &str, verkey: &[u8]) -> ResolverResult<Self> {
        if verkey.len() < 16 {
            return Err(ResolverError::InvalidIdentifier(format!(
                "verkey of {} bytes is too short to derive a DID",
                verkey.len()
            )));
        }
        Ok(Identifier(format!("did:{}:{}", method, bs58::encode(&verkey[..16]).into_string())))
    }

    /// Short-form DID derived from the submitter and a local nonce.
    pub fn from_submitter_nonce(method: &str, submitter: &Identifier, nonce: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(submitter.as_str().as_bytes());
        hasher.update(nonce.to_be_bytes());
        let digest = hasher.finalize();
        Identifier(format!("did:{}:{}", method, bs58::encode(&digest[..16]).into_string()))
    }
}

fn is_name_segment(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Identifier {
    type Error = ResolverError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Identifier::parse(&value)
    }
}

impl From<Identifier> for String {
    fn from(value: Identifier) -> Self {
        value.0
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        let id = Identifier::parse("did:sov:WRfXPg8dantKVubE3HX8pw").unwrap();
        assert_eq!(id.scheme(), "did");
        assert_eq!(id.method(), "sov");
        assert_eq!(id.method_specific_id(), "WRfXPg8dantKVubE3HX8pw");
        assert_eq!(id.kind(), IdentifierKind::Did);

        let web = Identifier::parse("did:web:example.com:user:alice").unwrap();
        assert_eq!(web.method_specific_id(), "example.com:user:alice");
    }

    #[test]
    fn test_parse_rejects_bad_grammar() {
        for raw in ["", "did", "did:sov", "did:sov:", ":sov:abc", "DID:sov:abc", "did:sov:a b", "did:sov:abc:", "did:s@v:abc"] {
            let err = Identifier::parse(raw).unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::InvalidIdentifier, "{}", raw);
        }
    }

    #[test]
    fn test_context_ids_round_trip() {
        let hash = [7u8; 32];
        let id = Identifier::for_context("sov", &hash);
        let parsed = Identifier::parse(id.as_str()).unwrap();
        assert!(parsed.is_context());
        assert_eq!(parsed.context_hash(), Some(hash));
    }

    #[test]
    fn test_malformed_context_id_rejected() {
        assert!(Identifier::parse("did:sov:context:abc").is_err());
    }

    #[test]
    fn test_derived_dids_are_deterministic() {
        let submitter = Identifier::parse("did:sov:Th7MpTaRZVRYnPiabds81Y").unwrap();
        let a = Identifier::from_submitter_nonce("sov", &submitter, 1);
        let b = Identifier::from_submitter_nonce("sov", &submitter, 1);
        let c = Identifier::from_submitter_nonce("sov", &submitter, 2);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(Identifier::parse(a.as_str()).is_ok());

        let verkey = [3u8; 33];
        let long = Identifier::from_verkey("sov", &verkey).unwrap();
        assert_eq!(long.method_specific_id(), bs58::encode(&verkey[..16]).into_string());
        assert!(Identifier::from_verkey("sov", &[1u8; 4]).is_err());
    }
}
