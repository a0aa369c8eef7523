//! Transaction construction for DID, NYM and context operations.
//!
//! Every builder is a pure transformation from typed parameters into a
//! [`Transaction`] whose payload is the canonical JSON of the request body.
//! Validation failures (bad identifiers, writes against contexts) are raised
//! here, before a pool is ever involved.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{ResolverError, ResolverResult};
use crate::identifier::Identifier;
use crate::parser::canonical;

pub const PROTOCOL_VERSION: u64 = 2;

pub const NYM: &str = "1";
pub const ATTRIB: &str = "100";
pub const GET_ATTRIB: &str = "104";
pub const GET_NYM: &str = "105";
pub const SET_CONTEXT: &str = "200";
pub const GET_CONTEXT: &str = "300";

const SECONDS_PER_DAY: u64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    ContextCreate,
    ContextRead,
    DidCreate,
    DidRead,
    DidUpdate,
    DidDelete,
    NymCreate,
    NymRead,
    NymUpdate,
    NymDelete,
}

impl Operation {
    pub fn is_write(&self) -> bool {
        !matches!(self, Operation::ContextRead | Operation::DidRead | Operation::NymRead)
    }

    pub fn txn_type(&self) -> &'static str {
        match self {
            Operation::ContextCreate => SET_CONTEXT,
            Operation::ContextRead => GET_CONTEXT,
            Operation::DidCreate | Operation::DidUpdate | Operation::DidDelete => ATTRIB,
            Operation::DidRead => GET_ATTRIB,
            Operation::NymCreate | Operation::NymUpdate | Operation::NymDelete => NYM,
            Operation::NymRead => GET_NYM,
        }
    }
}

/// Transaction Author Agreement acceptance attached to a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaaAcceptance {
    pub mechanism: String,
    pub taa_digest: String,
    pub time: u64,
}

impl TaaAcceptance {
    /// Digest is taken from `version ‖ text` when both are present, else `digest` is used as-is.
    /// A digest given alongside text and version must match them.
    /// The acceptance time is truncated to the start of its day.
    pub fn new(
        text: Option<&str>,
        version: Option<&str>,
        digest: Option<&str>,
        mechanism: &str,
        time: u64,
    ) -> ResolverResult<Self> {
        let taa_digest = match (text, version, digest) {
            (Some(text), Some(version), supplied) => {
                let mut hasher = Sha256::new();
                hasher.update(version.as_bytes());
                hasher.update(text.as_bytes());
                let computed = hex::encode(hasher.finalize());
                if let Some(supplied) = supplied {
                    if !supplied.eq_ignore_ascii_case(&computed) {
                        return Err(ResolverError::InvalidDocument(format!(
                            "TAA digest {} does not match text and version (expected {})",
                            supplied, computed
                        )));
                    }
                }
                computed
            }
            (None, None, Some(digest)) if !digest.is_empty() => digest.to_string(),
            _ => {
                return Err(ResolverError::InvalidDocument(
                    "TAA acceptance needs text and version, or a digest".to_string(),
                ))
            }
        };
        if mechanism.is_empty() {
            return Err(ResolverError::InvalidDocument("TAA acceptance mechanism is empty".to_string()));
        }
        Ok(Self {
            mechanism: mechanism.to_string(),
            taa_digest,
            time: time / SECONDS_PER_DAY * SECONDS_PER_DAY,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub kind: Operation,
    /// Ledger identifier the transaction targets (derived for creates).
    pub target: Option<Identifier>,
    pub submitter: Identifier,
    pub req_id: u64,
    /// Canonical bytes of the request body, without signatures.
    pub payload: Vec<u8>,
    pub signature: Option<Vec<u8>>,
    pub signatures: BTreeMap<String, Vec<u8>>,
    pub taa_acceptance: Option<TaaAcceptance>,
    /// Document carried by the write, kept so the engine can cache it on success.
    pub document: Option<Value>,
}

impl Transaction {
    pub fn is_signed(&self) -> bool {
        self.signature.is_some() || !self.signatures.is_empty()
    }

    pub fn body(&self) -> ResolverResult<Value> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| ResolverError::InvalidDocument(format!("transaction payload is not JSON: {}", e)))
    }

    /// Attaches TAA acceptance and re-canonicalizes the payload. Drops existing signatures.
    pub fn with_taa_acceptance(mut self, acceptance: TaaAcceptance) -> ResolverResult<Self> {
        let mut body = self.body()?;
        if let Value::Object(map) = &mut body {
            map.insert("taaAcceptance".to_string(), serde_json::to_value(&acceptance)
                .map_err(|e| ResolverError::InvalidDocument(e.to_string()))?);
        }
        self.payload = canonical::canonicalize(&body);
        self.taa_acceptance = Some(acceptance);
        self.signature = None;
        self.signatures.clear();
        Ok(self)
    }

    /// Bytes sent to nodes: the body plus base58 signature(s).
    pub fn request_bytes(&self) -> ResolverResult<Vec<u8>> {
        let mut body = self.body()?;
        if let Value::Object(map) = &mut body {
            if let Some(sig) = &self.signature {
                map.insert("signature".to_string(), Value::String(bs58::encode(sig).into_string()));
            }
            if !self.signatures.is_empty() {
                let sigs: Map<String, Value> = self
                    .signatures
                    .iter()
                    .map(|(did, sig)| (did.clone(), Value::String(bs58::encode(sig).into_string())))
                    .collect();
                map.insert("signatures".to_string(), Value::Object(sigs));
            }
        }
        Ok(canonical::canonicalize(&body))
    }
}

/// Parameters for DID/NYM creation.
#[derive(Debug, Clone, Default)]
pub struct CreateParams<'a> {
    /// Requested identifier; empty or `None` lets the builder derive one.
    pub identifier: Option<&'a str>,
    pub submitter: &'a str,
    /// Public key material for long-form DIDs and NYM records.
    pub verkey: Option<&'a [u8]>,
    pub document: Option<Value>,
    pub role: Option<&'a str>,
}

/// Builds transactions. Holds the monotonic nonce used for request ids and derived DIDs.
pub struct TransactionBuilder {
    method: String,
    nonce: AtomicU64,
}

impl TransactionBuilder {
    /// Seeds the nonce from the wall clock in nanoseconds, so request ids and
    /// derived DIDs do not repeat across processes or restarts.
    pub fn new(method: &str) -> Self {
        let now = chrono::Utc::now();
        let seed = now
            .timestamp_nanos_opt()
            .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1_000));
        Self::with_nonce(method, seed.max(0) as u64)
    }

    /// Fixed starting nonce. The first transaction built gets `start + 1`.
    pub fn with_nonce(method: &str, start: u64) -> Self {
        Self {
            method: method.to_string(),
            nonce: AtomicU64::new(start),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    fn next_nonce(&self) -> u64 {
        self.nonce.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn finish(
        &self,
        kind: Operation,
        target: Option<Identifier>,
        submitter: Identifier,
        operation: Value,
        document: Option<Value>,
    ) -> Transaction {
        let req_id = self.next_nonce();
        self.finish_with(req_id, kind, target, submitter, operation, document)
    }

    fn finish_with(
        &self,
        req_id: u64,
        kind: Operation,
        target: Option<Identifier>,
        submitter: Identifier,
        operation: Value,
        document: Option<Value>,
    ) -> Transaction {
        let body = json!({
            "identifier": submitter.as_str(),
            "operation": operation,
            "protocolVersion": PROTOCOL_VERSION,
            "reqId": req_id,
        });
        Transaction {
            kind,
            target,
            submitter,
            req_id,
            payload: canonical::canonicalize(&body),
            signature: None,
            signatures: BTreeMap::new(),
            taa_acceptance: None,
            document,
        }
    }

    pub fn build_context_create(&self, submitter: &str, context: &Value) -> ResolverResult<Transaction> {
        let submitter = Identifier::parse(submitter)?;
        let has_context = context.as_object().map_or(false, |m| m.contains_key("@context"));
        if !has_context {
            return Err(ResolverError::InvalidDocument(
                "context document must be an object with an @context member".to_string(),
            ));
        }
        let canonical_bytes = canonical::canonicalize(context);
        let id = Identifier::for_context(&self.method, &canonical::hash_canonical(&canonical_bytes));
        let operation = json!({
            "type": SET_CONTEXT,
            "dest": id.as_str(),
            "data": context,
        });
        Ok(self.finish(Operation::ContextCreate, Some(id), submitter, operation, Some(context.clone())))
    }

    pub fn build_context_read(&self, submitter: Option<&str>, identifier: &str) -> ResolverResult<Transaction> {
        let id = Identifier::parse(identifier)?;
        if !id.is_context() {
            return Err(ResolverError::InvalidIdentifier(format!("{} is not a context identifier", id)));
        }
        let submitter = self.read_submitter(submitter, &id)?;
        let operation = json!({ "type": GET_CONTEXT, "dest": id.as_str() });
        Ok(self.finish(Operation::ContextRead, Some(id), submitter, operation, None))
    }

    pub fn build_did_create(&self, params: CreateParams<'_>) -> ResolverResult<Transaction> {
        if let Some(doc) = &params.document {
            require_object(doc)?;
        }
        let (req_id, submitter, id) = self.create_target(&params)?;
        let document = params.document.clone().unwrap_or_else(|| json!({ "id": id.as_str() }));
        let operation = json!({
            "type": ATTRIB,
            "dest": id.as_str(),
            "raw": String::from_utf8_lossy(&canonical::canonicalize(&document)),
        });
        Ok(self.finish_with(req_id, Operation::DidCreate, Some(id), submitter, operation, Some(document)))
    }

    pub fn build_did_read(&self, submitter: Option<&str>, identifier: &str) -> ResolverResult<Transaction> {
        let id = self.mutable_target(identifier, Operation::DidRead)?;
        let submitter = self.read_submitter(submitter, &id)?;
        let operation = json!({ "type": GET_ATTRIB, "dest": id.as_str(), "raw": "diddoc" });
        Ok(self.finish(Operation::DidRead, Some(id), submitter, operation, None))
    }

    pub fn build_did_update(&self, submitter: &str, identifier: &str, document: &Value) -> ResolverResult<Transaction> {
        let id = self.mutable_target(identifier, Operation::DidUpdate)?;
        let submitter = Identifier::parse(submitter)?;
        require_object(document)?;
        let operation = json!({
            "type": ATTRIB,
            "dest": id.as_str(),
            "raw": String::from_utf8_lossy(&canonical::canonicalize(document)),
        });
        Ok(self.finish(Operation::DidUpdate, Some(id), submitter, operation, Some(document.clone())))
    }

    pub fn build_did_delete(&self, submitter: &str, identifier: &str) -> ResolverResult<Transaction> {
        let id = self.mutable_target(identifier, Operation::DidDelete)?;
        let submitter = Identifier::parse(submitter)?;
        let operation = json!({
            "type": ATTRIB,
            "dest": id.as_str(),
            "raw": Value::Null,
            "deactivated": true,
        });
        Ok(self.finish(Operation::DidDelete, Some(id), submitter, operation, None))
    }

    pub fn build_nym_create(&self, params: CreateParams<'_>) -> ResolverResult<Transaction> {
        if let Some(doc) = &params.document {
            require_object(doc)?;
        }
        let (req_id, submitter, id) = self.create_target(&params)?;
        let verkey = params.verkey.map(|vk| bs58::encode(vk).into_string());
        let document = params.document.clone().unwrap_or_else(|| nym_record(&id, verkey.as_deref(), params.role));
        let operation = json!({
            "type": NYM,
            "dest": id.as_str(),
            "verkey": verkey,
            "role": params.role,
            "data": document,
        });
        Ok(self.finish_with(req_id, Operation::NymCreate, Some(id), submitter, operation, Some(document)))
    }

    pub fn build_nym_read(&self, submitter: Option<&str>, identifier: &str) -> ResolverResult<Transaction> {
        let id = self.mutable_target(identifier, Operation::NymRead)?;
        let submitter = self.read_submitter(submitter, &id)?;
        let operation = json!({ "type": GET_NYM, "dest": id.as_str() });
        Ok(self.finish(Operation::NymRead, Some(id), submitter, operation, None))
    }

    pub fn build_nym_update(
        &self,
        submitter: &str,
        identifier: &str,
        verkey: Option<&[u8]>,
        document: &Value,
    ) -> ResolverResult<Transaction> {
        let id = self.mutable_target(identifier, Operation::NymUpdate)?;
        let submitter = Identifier::parse(submitter)?;
        require_object(document)?;
        let mut operation = json!({
            "type": NYM,
            "dest": id.as_str(),
            "data": document,
        });
        if let (Some(vk), Value::Object(map)) = (verkey, &mut operation) {
            map.insert("verkey".to_string(), Value::String(bs58::encode(vk).into_string()));
        }
        Ok(self.finish(Operation::NymUpdate, Some(id), submitter, operation, Some(document.clone())))
    }

    pub fn build_nym_delete(&self, submitter: &str, identifier: &str) -> ResolverResult<Transaction> {
        let id = self.mutable_target(identifier, Operation::NymDelete)?;
        let submitter = Identifier::parse(submitter)?;
        let operation = json!({
            "type": NYM,
            "dest": id.as_str(),
            "verkey": Value::Null,
            "deactivated": true,
        });
        Ok(self.finish(Operation::NymDelete, Some(id), submitter, operation, None))
    }

    // Reserves the request id up front so a derived DID and its request share one nonce.
    fn create_target(&self, params: &CreateParams<'_>) -> ResolverResult<(u64, Identifier, Identifier)> {
        let submitter = Identifier::parse(params.submitter)?;
        let requested = Identifier::parse_opt(params.identifier)?;
        let req_id = self.next_nonce();
        let id = match requested {
            Some(id) if id.is_context() => {
                return Err(ResolverError::InvalidIdentifier(format!(
                    "{} is a context identifier; contexts are created from their content",
                    id
                )))
            }
            Some(id) => id,
            None => match params.verkey {
                Some(vk) => Identifier::from_verkey(&self.method, vk)?,
                None => Identifier::from_submitter_nonce(&self.method, &submitter, req_id),
            },
        };
        Ok((req_id, submitter, id))
    }

    fn mutable_target(&self, identifier: &str, op: Operation) -> ResolverResult<Identifier> {
        let id = Identifier::parse(identifier)?;
        if id.is_context() && op.is_write() {
            return Err(ResolverError::ImmutableTarget(format!(
                "{} is a context document; {:?} is not permitted",
                id, op
            )));
        }
        if id.is_context() {
            return Err(ResolverError::InvalidIdentifier(format!("{} is a context identifier", id)));
        }
        Ok(id)
    }

    // Reads may be anonymous; the target itself then stands in as the request identifier.
    fn read_submitter(&self, submitter: Option<&str>, target: &Identifier) -> ResolverResult<Identifier> {
        Ok(Identifier::parse_opt(submitter)?.unwrap_or_else(|| target.clone()))
    }
}

fn require_object(document: &Value) -> ResolverResult<()> {
    if document.is_object() {
        Ok(())
    } else {
        Err(ResolverError::InvalidDocument("document must be a JSON object".to_string()))
    }
}

fn nym_record(id: &Identifier, verkey: Option<&str>, role: Option<&str>) -> Value {
    json!({
        "dest": id.as_str(),
        "verkey": verkey,
        "role": role,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const SUBMITTER: &str = "did:sov:Th7MpTaRZVRYnPiabds81Y";

    #[test]
    fn test_context_create_is_content_addressed() {
        let builder = TransactionBuilder::new("sov");
        let a: Value = serde_json::from_str(r#"{"@context":{"name":"http://schema.org/name","mail":"did:sov:x"}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"@context":{"mail":"did:sov:x","name":"http://schema.org/name"}}"#).unwrap();
        let ta = builder.build_context_create(SUBMITTER, &a).unwrap();
        let tb = builder.build_context_create(SUBMITTER, &b).unwrap();
        assert_eq!(ta.target, tb.target);
        assert!(ta.target.as_ref().unwrap().is_context());
        // different req ids, same target
        assert_ne!(ta.req_id, tb.req_id);
    }

    #[test]
    fn test_context_without_context_member_rejected() {
        let builder = TransactionBuilder::new("sov");
        let err = builder.build_context_create(SUBMITTER, &json!({"name": "x"})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDocument);
    }

    #[test]
    fn test_writes_to_context_are_immutable() {
        let builder = TransactionBuilder::new("sov");
        let ctx = builder.build_context_create(SUBMITTER, &json!({"@context": ["https://w3id.org/did/v1"]})).unwrap();
        let id = ctx.target.unwrap();
        let err = builder.build_did_update(SUBMITTER, id.as_str(), &json!({})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ImmutableTarget);
        let err = builder.build_did_delete(SUBMITTER, id.as_str()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ImmutableTarget);
        let err = builder.build_nym_update(SUBMITTER, id.as_str(), None, &json!({})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ImmutableTarget);
        let err = builder.build_nym_delete(SUBMITTER, id.as_str()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ImmutableTarget);
    }

    #[test]
    fn test_invalid_identifiers() {
        let builder = TransactionBuilder::new("sov");
        let err = builder.build_did_read(None, "not-a-did").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidIdentifier);
        let err = builder.build_did_update("bad", "did:sov:abc", &json!({})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidIdentifier);
        let err = builder.build_did_update(SUBMITTER, "did:sov:abc", &json!([1, 2])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDocument);
    }

    #[test]
    fn test_did_create_derives_identifier() {
        let builder = TransactionBuilder::new("sov");
        let tx = builder
            .build_did_create(CreateParams { submitter: SUBMITTER, ..Default::default() })
            .unwrap();
        let expected = Identifier::from_submitter_nonce("sov", &Identifier::parse(SUBMITTER).unwrap(), tx.req_id);
        assert_eq!(tx.target, Some(expected));

        let verkey = [9u8; 33];
        let tx = builder
            .build_did_create(CreateParams { submitter: SUBMITTER, verkey: Some(&verkey), ..Default::default() })
            .unwrap();
        assert_eq!(tx.target, Some(Identifier::from_verkey("sov", &verkey).unwrap()));
    }

    #[test]
    fn test_separate_builders_derive_distinct_identifiers() {
        let first = TransactionBuilder::new("sov");
        std::thread::sleep(std::time::Duration::from_millis(1));
        let second = TransactionBuilder::new("sov");
        let params = || CreateParams { submitter: SUBMITTER, ..Default::default() };
        let a = first.build_did_create(params()).unwrap();
        let b = second.build_did_create(params()).unwrap();
        assert_ne!(a.req_id, b.req_id);
        assert_ne!(a.target, b.target);
        assert!(a.req_id > 1);
    }

    #[test]
    fn test_payload_is_canonical_body() {
        let builder = TransactionBuilder::with_nonce("sov", 41);
        let tx = builder.build_nym_read(None, "did:sov:WRfXPg8dantKVubE3HX8pw").unwrap();
        assert_eq!(tx.req_id, 42);
        let expected = br#"{"identifier":"did:sov:WRfXPg8dantKVubE3HX8pw","operation":{"dest":"did:sov:WRfXPg8dantKVubE3HX8pw","type":"105"},"protocolVersion":2,"reqId":42}"#;
        assert_eq!(tx.payload, expected.to_vec());
        assert!(!tx.kind.is_write());
    }

    #[test]
    fn test_taa_acceptance() {
        let a = TaaAcceptance::new(Some("terms"), Some("1.0"), None, "click_agreement", 1_700_000_123).unwrap();
        let b = TaaAcceptance::new(Some("terms"), Some("1.0"), None, "click_agreement", 1_700_010_000).unwrap();
        assert_eq!(a.taa_digest, b.taa_digest);
        assert_eq!(a.time % 86_400, 0);
        assert_eq!(a.time, b.time);
        assert_eq!(a.taa_digest.len(), 64);

        let c = TaaAcceptance::new(None, None, Some("abcd"), "on_file", 0).unwrap();
        assert_eq!(c.taa_digest, "abcd");
        assert!(TaaAcceptance::new(Some("terms"), None, None, "on_file", 0).is_err());

        // a digest given with text and version must agree with them
        let d = TaaAcceptance::new(Some("terms"), Some("1.0"), Some(&a.taa_digest), "on_file", 0).unwrap();
        assert_eq!(d.taa_digest, a.taa_digest);
        let err = TaaAcceptance::new(Some("terms"), Some("1.0"), Some("abcd"), "on_file", 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDocument);

        let builder = TransactionBuilder::new("sov");
        let tx = builder.build_did_delete(SUBMITTER, "did:sov:WRfXPg8dantKVubE3HX8pw").unwrap();
        let tx = tx.with_taa_acceptance(a.clone()).unwrap();
        assert_eq!(tx.body().unwrap()["taaAcceptance"]["taaDigest"], json!(a.taa_digest));
    }
}
