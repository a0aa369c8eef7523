//! Pool boundary and an in-memory pool.
//!
//! The engine only ever sees `&dyn Pool`: an enumerable node set and a
//! request/response primitive per node. Connection setup and discovery live
//! outside this crate.
//!
//! [`InMemoryPool`] runs a small ledger per node so the engine can be driven
//! end to end (tests, `resolver_sim`). Each node can be scripted to go
//! silent, fail, reject, or answer with a fixed document.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tracing::debug;

use crate::transaction::{ATTRIB, GET_ATTRIB, GET_CONTEXT, GET_NYM, NYM, SET_CONTEXT};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        NodeId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("node timed out")]
    Timeout,

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// An already-connected set of ledger nodes. Borrowed by the engine for one call.
#[async_trait]
pub trait Pool: Send + Sync {
    /// Stable, enumerable node identities for this pool.
    fn node_ids(&self) -> Vec<NodeId>;

    async fn send_to_node(&self, node: &NodeId, request: &[u8], timeout: Duration) -> Result<Vec<u8>, PoolError>;
}

/// Scripted behaviour of one in-memory node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeBehaviour {
    Honest,
    /// Never answers.
    Silent,
    /// Transport-level failure.
    Failing,
    /// Answers every request with REJECT.
    Rejecting(String),
    /// Accepts writes without applying them and answers reads with a fixed record.
    Byzantine { document: Option<Value>, seq_no: u64 },
    /// Answers with bytes that are not a reply.
    Garbage,
}

#[derive(Debug, Clone)]
struct LedgerRecord {
    document: Value,
    seq_no: u64,
    txn_time: u64,
    deactivated: bool,
}

struct SimNode {
    id: NodeId,
    behaviour: RwLock<NodeBehaviour>,
    latency: RwLock<Duration>,
    ledger: Mutex<HashMap<String, LedgerRecord>>,
    seq: AtomicUsize,
}

pub struct InMemoryPool {
    nodes: Vec<SimNode>,
    requests: AtomicUsize,
}

impl InMemoryPool {
    /// `count` honest nodes named `Node1..NodeN`.
    pub fn new(count: usize) -> Self {
        let nodes = (1..=count)
            .map(|i| SimNode {
                id: NodeId(format!("Node{}", i)),
                behaviour: RwLock::new(NodeBehaviour::Honest),
                latency: RwLock::new(Duration::ZERO),
                ledger: Mutex::new(HashMap::new()),
                seq: AtomicUsize::new(0),
            })
            .collect();
        Self { nodes, requests: AtomicUsize::new(0) }
    }

    pub fn with_behaviour(self, index: usize, behaviour: NodeBehaviour) -> Self {
        self.set_behaviour(index, behaviour);
        self
    }

    pub fn set_behaviour(&self, index: usize, behaviour: NodeBehaviour) {
        if let Some(node) = self.nodes.get(index) {
            if let Ok(mut b) = node.behaviour.write() {
                *b = behaviour;
            }
        }
    }

    pub fn set_latency(&self, index: usize, latency: Duration) {
        if let Some(node) = self.nodes.get(index) {
            if let Ok(mut l) = node.latency.write() {
                *l = latency;
            }
        }
    }

    /// Total requests received across all nodes.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn node(&self, id: &NodeId) -> Option<&SimNode> {
        self.nodes.iter().find(|n| &n.id == id)
    }
}

#[async_trait]
impl Pool for InMemoryPool {
    fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }

    async fn send_to_node(&self, node: &NodeId, request: &[u8], timeout: Duration) -> Result<Vec<u8>, PoolError> {
        let sim = self.node(node).ok_or_else(|| PoolError::UnknownNode(node.to_string()))?;
        self.requests.fetch_add(1, Ordering::SeqCst);

        let behaviour = sim.behaviour.read().map(|b| b.clone()).unwrap_or(NodeBehaviour::Failing);
        let latency = sim.latency.read().map(|l| *l).unwrap_or(Duration::ZERO);

        let work = async {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            match behaviour {
                NodeBehaviour::Honest => Ok(sim.handle(request)),
                NodeBehaviour::Silent => std::future::pending::<Result<Vec<u8>, PoolError>>().await,
                NodeBehaviour::Failing => Err(PoolError::Transport(format!("{} refused connection", sim.id))),
                NodeBehaviour::Rejecting(reason) => Ok(reject(&reason)),
                NodeBehaviour::Byzantine { document, seq_no } => Ok(sim.handle_byzantine(request, document, seq_no)),
                NodeBehaviour::Garbage => Ok(vec![0xde, 0xad, 0xbe, 0xef]),
            }
        };

        match tokio::time::timeout(timeout, work).await {
            Ok(res) => res,
            Err(_) => Err(PoolError::Timeout),
        }
    }
}

impl SimNode {
    fn handle(&self, request: &[u8]) -> Vec<u8> {
        let req: Value = match serde_json::from_slice(request) {
            Ok(v) => v,
            Err(e) => return reqnack(&format!("malformed request: {}", e)),
        };
        let op = &req["operation"];
        let txn_type = op["type"].as_str().unwrap_or("");
        let dest = match op["dest"].as_str() {
            Some(d) => d.to_string(),
            None => return reqnack("missing dest"),
        };
        let is_write = matches!(txn_type, NYM | ATTRIB | SET_CONTEXT);
        if is_write && req.get("signature").is_none() && req.get("signatures").is_none() {
            return reqnack("missing signature");
        }

        let mut ledger = match self.ledger.lock() {
            Ok(l) => l,
            Err(_) => return reqnack("node ledger unavailable"),
        };

        match txn_type {
            SET_CONTEXT => {
                if ledger.contains_key(&dest) {
                    // content-addressed: re-submitting identical content is a no-op
                    let rec = &ledger[&dest];
                    return write_reply(rec.seq_no, rec.txn_time);
                }
                let rec = self.append(&op["data"], false);
                let reply = write_reply(rec.seq_no, rec.txn_time);
                ledger.insert(dest, rec);
                reply
            }
            ATTRIB | NYM => {
                if ledger.get(&dest).map_or(false, |r| r.deactivated) {
                    return reject(&format!("{} is deactivated", dest));
                }
                let deactivated = op["deactivated"].as_bool().unwrap_or(false);
                let document = if deactivated {
                    json!({ "deactivated": true })
                } else if txn_type == ATTRIB {
                    match op["raw"].as_str().map(serde_json::from_str::<Value>) {
                        Some(Ok(doc)) => doc,
                        _ => return reqnack("raw attribute is not JSON"),
                    }
                } else {
                    op["data"].clone()
                };
                let rec = self.append(&document, deactivated);
                let reply = write_reply(rec.seq_no, rec.txn_time);
                ledger.insert(dest, rec);
                reply
            }
            GET_CONTEXT => read_reply(ledger.get(&dest), false),
            GET_ATTRIB | GET_NYM => read_reply(ledger.get(&dest), true),
            other => reqnack(&format!("unsupported txn type '{}'", other)),
        }
    }

    fn handle_byzantine(&self, request: &[u8], document: Option<Value>, seq_no: u64) -> Vec<u8> {
        let req: Value = serde_json::from_slice(request).unwrap_or(Value::Null);
        let txn_type = req["operation"]["type"].as_str().unwrap_or("");
        debug!(node = %self.id, txn_type, "byzantine node answering");
        if matches!(txn_type, NYM | ATTRIB | SET_CONTEXT) {
            return write_reply(seq_no, 0);
        }
        let rec = document.map(|document| LedgerRecord { document, seq_no, txn_time: 0, deactivated: false });
        read_reply(rec.as_ref(), false)
    }

    fn append(&self, document: &Value, deactivated: bool) -> LedgerRecord {
        let seq_no = self.seq.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        LedgerRecord {
            document: document.clone(),
            seq_no,
            txn_time: chrono::Utc::now().timestamp().max(0) as u64,
            deactivated,
        }
    }
}

fn write_reply(seq_no: u64, txn_time: u64) -> Vec<u8> {
    json!({
        "op": "REPLY",
        "result": { "seqNo": seq_no, "txnTime": txn_time, "data": Value::Null }
    })
    .to_string()
    .into_bytes()
}

fn read_reply(record: Option<&LedgerRecord>, data_as_string: bool) -> Vec<u8> {
    let reply = match record {
        None => json!({ "op": "REPLY", "result": { "seqNo": Value::Null, "data": Value::Null } }),
        Some(rec) => {
            let data = if data_as_string {
                Value::String(rec.document.to_string())
            } else {
                rec.document.clone()
            };
            json!({
                "op": "REPLY",
                "result": { "seqNo": rec.seq_no, "txnTime": rec.txn_time, "data": data }
            })
        }
    };
    reply.to_string().into_bytes()
}

fn reject(reason: &str) -> Vec<u8> {
    json!({ "op": "REJECT", "reason": reason }).to_string().into_bytes()
}

fn reqnack(reason: &str) -> Vec<u8> {
    json!({ "op": "REQNACK", "reason": reason }).to_string().into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::reply::{parse_reply, ReplyBody};

    fn signed(body: Value) -> Vec<u8> {
        let mut body = body;
        body["signature"] = json!("sig");
        body.to_string().into_bytes()
    }

    #[tokio::test]
    async fn test_honest_node_round_trip() {
        let pool = InMemoryPool::new(1);
        let node = pool.node_ids()[0].clone();
        let t = Duration::from_millis(200);

        let write = signed(json!({"operation": {"type": ATTRIB, "dest": "did:sov:abc", "raw": "{\"id\":\"did:sov:abc\"}"}}));
        let reply = pool.send_to_node(&node, &write, t).await.unwrap();
        assert!(matches!(parse_reply(&reply).unwrap(), ReplyBody::Reply { .. }));

        let read = json!({"operation": {"type": GET_ATTRIB, "dest": "did:sov:abc"}}).to_string().into_bytes();
        match parse_reply(&pool.send_to_node(&node, &read, t).await.unwrap()).unwrap() {
            ReplyBody::Reply { document, metadata, .. } => {
                assert_eq!(document, Some(json!({"id": "did:sov:abc"})));
                assert_eq!(metadata.seq_no, Some(1));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(pool.request_count(), 2);
    }

    #[tokio::test]
    async fn test_unsigned_write_is_nacked() {
        let pool = InMemoryPool::new(1);
        let node = pool.node_ids()[0].clone();
        let write = json!({"operation": {"type": NYM, "dest": "did:sov:abc"}}).to_string().into_bytes();
        let reply = pool.send_to_node(&node, &write, Duration::from_millis(50)).await.unwrap();
        assert!(matches!(parse_reply(&reply).unwrap(), ReplyBody::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_silent_node_times_out() {
        let pool = InMemoryPool::new(2).with_behaviour(1, NodeBehaviour::Silent);
        let node = pool.node_ids()[1].clone();
        let err = pool.send_to_node(&node, b"{}", Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err, PoolError::Timeout);

        let unknown = pool.send_to_node(&NodeId::new("Ghost"), b"{}", Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(unknown, PoolError::UnknownNode(_)));
    }
}
