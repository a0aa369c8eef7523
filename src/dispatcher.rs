//! Concurrent fan-out of one request to a set of pool nodes.
//!
//! Every selected node gets its own future, bounded by the per-node timeout,
//! and the whole call is bounded by that timeout plus the configured
//! aggregation overhead. Whatever has not answered by then is recorded as a
//! timeout. No request is ever retried.

use futures::stream::{FuturesUnordered, StreamExt};
use rand::seq::SliceRandom;
use serde_json::Value;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{ResolverConfig, MIN_FAN_OUT};
use crate::consensus::write_quorum;
use crate::error::{ResolverError, ResolverResult, Tally};
use crate::parser::reply::{parse_reply, ReplyBody};
use crate::pool::{NodeId, Pool, PoolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    /// The node answered with a decodable reply (which may still be a rejection).
    Success,
    Failure(String),
    Timeout,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeResponse {
    pub node: NodeId,
    pub status: NodeStatus,
    /// REPLY rather than REJECT/REQNACK.
    pub accepted: bool,
    pub reject_reason: Option<String>,
    pub document: Option<Value>,
    pub deactivated: bool,
    pub seq_no: Option<u64>,
    pub txn_time: Option<u64>,
}

impl NodeResponse {
    fn bare(node: NodeId, status: NodeStatus) -> Self {
        Self {
            node,
            status,
            accepted: false,
            reject_reason: None,
            document: None,
            deactivated: false,
            seq_no: None,
            txn_time: None,
        }
    }

    pub fn timeout(node: NodeId) -> Self {
        Self::bare(node, NodeStatus::Timeout)
    }

    pub fn failure(node: NodeId, reason: impl Into<String>) -> Self {
        Self::bare(node, NodeStatus::Failure(reason.into()))
    }

    pub fn rejected(node: NodeId, reason: impl Into<String>) -> Self {
        let mut r = Self::bare(node, NodeStatus::Success);
        r.reject_reason = Some(reason.into());
        r
    }

    pub fn reply(node: NodeId, document: Option<Value>, seq_no: Option<u64>) -> Self {
        let deactivated = document
            .as_ref()
            .and_then(|d| d.get("deactivated"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Self {
            node,
            status: NodeStatus::Success,
            accepted: true,
            reject_reason: None,
            document,
            deactivated,
            seq_no,
            txn_time: None,
        }
    }

    pub fn responded(&self) -> bool {
        self.status == NodeStatus::Success
    }

    fn from_reply(node: NodeId, bytes: &[u8]) -> Self {
        match parse_reply(bytes) {
            Ok(ReplyBody::Reply { document, deactivated, metadata }) => Self {
                node,
                status: NodeStatus::Success,
                accepted: true,
                reject_reason: None,
                document,
                deactivated,
                seq_no: metadata.seq_no,
                txn_time: metadata.txn_time.or(metadata.last_txn_time),
            },
            Ok(ReplyBody::Rejected { reason }) => Self::rejected(node, reason),
            Err(reason) => Self::failure(node, reason),
        }
    }
}

/// Counts outcomes across a set of node responses.
pub fn tally(responses: &[NodeResponse]) -> Tally {
    let mut t = Tally::default();
    for r in responses {
        match &r.status {
            NodeStatus::Success if r.accepted => t.accepted += 1,
            NodeStatus::Success => t.rejected += 1,
            NodeStatus::Failure(_) => t.failed += 1,
            NodeStatus::Timeout => t.timed_out += 1,
        }
    }
    t
}

/// Per-call overrides for [`PoolDispatcher::dispatch_with`].
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Send only to these nodes instead of choosing from the pool.
    pub nodes: Option<Vec<NodeId>>,
    /// Replaces the configured per-node timeout.
    pub timeout: Option<Duration>,
}

pub struct PoolDispatcher {
    config: ResolverConfig,
}

impl PoolDispatcher {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    pub async fn dispatch(&self, pool: &dyn Pool, request: &[u8], mode: DispatchMode) -> ResolverResult<Vec<NodeResponse>> {
        self.dispatch_with(pool, request, mode, &DispatchOptions::default()).await
    }

    /// Sends `request` to the selected nodes and returns their responses in arrival order,
    /// followed by a `Timeout` entry for every node that never answered.
    pub async fn dispatch_with(
        &self,
        pool: &dyn Pool,
        request: &[u8],
        mode: DispatchMode,
        options: &DispatchOptions,
    ) -> ResolverResult<Vec<NodeResponse>> {
        let targets = self.select_nodes(pool, mode, options)?;
        let width = targets.len();
        let per_node = options.timeout.unwrap_or(self.config.node_timeout);
        let deadline = tokio::time::Instant::now() + self.config.call_deadline(per_node);
        let started = Instant::now();

        debug!(?mode, width, timeout_ms = per_node.as_millis() as u64, "dispatching request");

        let mut in_flight: FuturesUnordered<_> = targets
            .iter()
            .map(|node| async move {
                let res = tokio::time::timeout(per_node, pool.send_to_node(node, request, per_node)).await;
                (node, res)
            })
            .collect();

        let mut responses = Vec::with_capacity(width);
        let mut answered: HashSet<&NodeId> = HashSet::with_capacity(width);
        loop {
            match tokio::time::timeout_at(deadline, in_flight.next()).await {
                Ok(Some((node, res))) => {
                    answered.insert(node);
                    let response = match res {
                        Ok(Ok(bytes)) => NodeResponse::from_reply(node.clone(), &bytes),
                        Ok(Err(PoolError::Timeout)) | Err(_) => NodeResponse::timeout(node.clone()),
                        Ok(Err(e)) => NodeResponse::failure(node.clone(), e.to_string()),
                    };
                    match &response.status {
                        NodeStatus::Timeout => warn!(node = %node, "node timed out"),
                        NodeStatus::Failure(reason) => warn!(node = %node, %reason, "node failed"),
                        NodeStatus::Success => {}
                    }
                    responses.push(response);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!("call deadline reached with {} of {} nodes outstanding", width - answered.len(), width);
                    break;
                }
            }
        }
        drop(in_flight);

        for node in targets.iter().filter(|n| !answered.contains(n)) {
            responses.push(NodeResponse::timeout(node.clone()));
        }

        let t = tally(&responses);
        let required = match mode {
            DispatchMode::Read => self.config.min_read_responses,
            DispatchMode::Write => write_quorum(width),
        };
        info!(
            ?mode,
            width,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "fan-out complete: {}",
            t
        );
        if t.responded() < required {
            return Err(ResolverError::PoolUnreachable {
                reason: format!("{} of {} nodes responded, {} required", t.responded(), width, required),
                tally: t,
            });
        }
        Ok(responses)
    }

    fn select_nodes(&self, pool: &dyn Pool, mode: DispatchMode, options: &DispatchOptions) -> ResolverResult<Vec<NodeId>> {
        let mut nodes: Vec<NodeId> = match &options.nodes {
            Some(explicit) => {
                let mut seen = HashSet::new();
                explicit.iter().filter(|n| seen.insert(*n)).cloned().collect()
            }
            None => {
                let mut all = pool.node_ids();
                if let Some(width) = self.config.fan_out {
                    if width < all.len() {
                        all.shuffle(&mut rand::thread_rng());
                        all.truncate(width);
                    }
                }
                all
            }
        };
        nodes.sort();

        if nodes.len() < MIN_FAN_OUT {
            return Err(ResolverError::PoolUnreachable {
                reason: format!("{} nodes available, at least {} required", nodes.len(), MIN_FAN_OUT),
                tally: Tally::default(),
            });
        }
        if mode == DispatchMode::Write && nodes.len() < self.config.min_write_nodes() {
            return Err(ResolverError::PoolUnreachable {
                reason: format!(
                    "writes need {} nodes to tolerate {} faults, {} available",
                    self.config.min_write_nodes(),
                    self.config.fault_tolerance,
                    nodes.len()
                ),
                tally: Tally::default(),
            });
        }
        Ok(nodes)
    }
}
