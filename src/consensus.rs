//! Byzantine-tolerant aggregation of node responses.
//!
//! Writes need strictly more than two thirds of the queried nodes to accept.
//! Reads group answers by canonical document bytes; the largest group wins,
//! equal groups are ordered by sequence number, and the winner must still
//! clear the configured read quorum. The result never depends on the order
//! in which responses arrived.

use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::config::ReadQuorum;
use crate::dispatcher::{tally, NodeResponse};
use crate::error::{ResolverError, ResolverResult, Tally};
use crate::parser::canonical;
use crate::pool::NodeId;

/// Smallest acceptance count that is strictly more than 2/3 of `queried`.
pub fn write_quorum(queried: usize) -> usize {
    queried * 2 / 3 + 1
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// A write was accepted by a quorum.
    Accepted,
    /// The agreed read answer; `None` when the ledger has no record.
    Document(Option<Value>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusResult {
    pub outcome: Outcome,
    pub quorum_achieved: bool,
    /// Responders whose answer differs from the agreed one.
    pub dissenting: Vec<NodeId>,
    pub seq_no: Option<u64>,
    pub txn_time: Option<u64>,
    pub deactivated: bool,
    pub tally: Tally,
    /// Set for context reads; such results may be cached forever.
    pub immutable: bool,
}

impl ConsensusResult {
    pub fn document(&self) -> Option<&Value> {
        match &self.outcome {
            Outcome::Document(doc) => doc.as_ref(),
            Outcome::Accepted => None,
        }
    }
}

struct Group<'a> {
    members: Vec<&'a NodeResponse>,
    seq_no: Option<u64>,
}

pub struct ConsensusResolver {
    read_quorum: ReadQuorum,
}

impl ConsensusResolver {
    pub fn new(read_quorum: ReadQuorum) -> Self {
        Self { read_quorum }
    }

    /// `queried` is the number of nodes the write was sent to.
    pub fn resolve_write(&self, responses: &[NodeResponse], queried: usize) -> ResolverResult<ConsensusResult> {
        let t = tally(responses);
        let required = write_quorum(queried);
        if t.accepted < required {
            warn!(required, queried, "write quorum not reached: {}", t);
            return Err(ResolverError::QuorumNotReached { required, queried, tally: t });
        }

        let accepting = responses.iter().filter(|r| r.responded() && r.accepted);
        let seq_no = accepting.clone().filter_map(|r| r.seq_no).max();
        let txn_time = accepting.filter_map(|r| r.txn_time).max();
        let mut dissenting: Vec<NodeId> = responses
            .iter()
            .filter(|r| !(r.responded() && r.accepted))
            .map(|r| r.node.clone())
            .collect();
        dissenting.sort();

        debug!(accepted = t.accepted, queried, ?seq_no, "write quorum reached");
        Ok(ConsensusResult {
            outcome: Outcome::Accepted,
            quorum_achieved: true,
            dissenting,
            seq_no,
            txn_time,
            deactivated: false,
            tally: t,
            immutable: false,
        })
    }

    pub fn resolve_read(&self, responses: &[NodeResponse], immutable: bool) -> ResolverResult<ConsensusResult> {
        let t = tally(responses);
        let responded = t.responded();

        let mut groups: BTreeMap<Option<Vec<u8>>, Group<'_>> = BTreeMap::new();
        for r in responses.iter().filter(|r| r.responded() && r.accepted) {
            let key = r.document.as_ref().map(canonical::canonicalize);
            groups.entry(key).or_insert_with(|| Group { members: Vec::new(), seq_no: None }).members.push(r);
        }
        for group in groups.values_mut() {
            group.seq_no = prevailing_seq_no(&group.members);
        }

        if groups.is_empty() {
            // every responder refused
            let required = self.read_quorum.required(responded);
            warn!(rejected = t.rejected, responded, "read refused by every responder");
            return Err(ResolverError::QuorumNotReached { required, queried: t.total(), tally: t });
        }

        let mut ranked: Vec<&Group<'_>> = groups.values().collect();
        ranked.sort_by(|a, b| b.members.len().cmp(&a.members.len()).then(b.seq_no.cmp(&a.seq_no)));

        let winner = ranked[0];
        if let Some(runner_up) = ranked.get(1) {
            if runner_up.members.len() == winner.members.len() && runner_up.seq_no == winner.seq_no {
                warn!(groups = ranked.len(), responded, "read answers tied on size and sequence number");
                return Err(ResolverError::InconsistentLedgerState {
                    reason: format!(
                        "competing answers of {} nodes each at sequence number {:?}",
                        winner.members.len(),
                        winner.seq_no
                    ),
                    groups: ranked.len(),
                    responded,
                });
            }
        }

        let agreeing = winner.members.len();
        if !self.read_quorum.is_met(agreeing, responded) {
            warn!(agreeing, responded, quorum = ?self.read_quorum, "read quorum not reached");
            return Err(ResolverError::InconsistentLedgerState {
                reason: format!("largest agreeing group has {} of {} responders", agreeing, responded),
                groups: ranked.len(),
                responded,
            });
        }

        let representative = winner.members[0];
        let winners: Vec<&NodeId> = winner.members.iter().map(|r| &r.node).collect();
        let mut dissenting: Vec<NodeId> = responses
            .iter()
            .filter(|r| r.responded() && !winners.contains(&&r.node))
            .map(|r| r.node.clone())
            .collect();
        dissenting.sort();
        let txn_time = winner.members.iter().filter_map(|r| r.txn_time).max();

        debug!(agreeing, responded, seq_no = ?winner.seq_no, dissenting = dissenting.len(), "read resolved");
        Ok(ConsensusResult {
            outcome: Outcome::Document(representative.document.clone()),
            quorum_achieved: true,
            dissenting,
            seq_no: winner.seq_no,
            txn_time,
            deactivated: representative.deactivated,
            tally: t,
            immutable,
        })
    }
}

// Sequence number reported by most members; a tie goes to the lower value.
fn prevailing_seq_no(members: &[&NodeResponse]) -> Option<u64> {
    let mut counts: BTreeMap<u64, usize> = BTreeMap::new();
    for seq in members.iter().filter_map(|r| r.seq_no) {
        *counts.entry(seq).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|(seq_a, n_a), (seq_b, n_b)| n_a.cmp(n_b).then(seq_b.cmp(seq_a)))
        .map(|(seq, _)| seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn node(i: usize) -> NodeId {
        NodeId(format!("Node{}", i))
    }

    fn accept(i: usize) -> NodeResponse {
        NodeResponse::reply(node(i), None, Some(10))
    }

    fn doc(i: usize, value: Value, seq: u64) -> NodeResponse {
        NodeResponse::reply(node(i), Some(value), Some(seq))
    }

    #[test]
    fn test_write_quorum_threshold() {
        assert_eq!(write_quorum(3), 3);
        assert_eq!(write_quorum(4), 3);
        assert_eq!(write_quorum(6), 5);
        assert_eq!(write_quorum(7), 5);
    }

    #[test]
    fn test_write_three_of_four() {
        let resolver = ConsensusResolver::new(ReadQuorum::Byzantine);
        let responses = vec![accept(1), accept(2), NodeResponse::rejected(node(3), "nope"), accept(4)];
        let result = resolver.resolve_write(&responses, 4).unwrap();
        assert_eq!(result.outcome, Outcome::Accepted);
        assert_eq!(result.dissenting, vec![node(3)]);
        assert_eq!(result.seq_no, Some(10));
    }

    #[test]
    fn test_write_two_of_four_fails() {
        let resolver = ConsensusResolver::new(ReadQuorum::Byzantine);
        let responses = vec![accept(1), NodeResponse::timeout(node(2)), NodeResponse::rejected(node(3), "nope"), accept(4)];
        match resolver.resolve_write(&responses, 4).unwrap_err() {
            ResolverError::QuorumNotReached { required, queried, tally } => {
                assert_eq!(required, 3);
                assert_eq!(queried, 4);
                assert_eq!(tally, Tally { accepted: 2, rejected: 1, failed: 0, timed_out: 1 });
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_read_majority_answer_wins() {
        let resolver = ConsensusResolver::new(ReadQuorum::Byzantine);
        let a = json!({"id": "did:sov:a", "v": 1});
        let b = json!({"id": "did:sov:a", "v": 2});
        let responses = vec![doc(1, a.clone(), 5), doc(2, b, 9), doc(3, a.clone(), 5), doc(4, a.clone(), 5)];
        let result = resolver.resolve_read(&responses, false).unwrap();
        assert_eq!(result.document(), Some(&a));
        assert_eq!(result.dissenting, vec![node(2)]);
        assert_eq!(result.seq_no, Some(5));
    }

    #[test]
    fn test_read_order_independent() {
        let resolver = ConsensusResolver::new(ReadQuorum::Byzantine);
        let a = json!({"k": "a"});
        let b = json!({"k": "b"});
        let mut responses = vec![doc(1, a.clone(), 3), doc(2, a.clone(), 3), doc(3, b, 3), doc(4, a.clone(), 3)];
        let first = resolver.resolve_read(&responses, false).unwrap();
        responses.reverse();
        let second = resolver.resolve_read(&responses, false).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_read_even_split_is_inconsistent() {
        let resolver = ConsensusResolver::new(ReadQuorum::Byzantine);
        let responses = vec![
            doc(1, json!({"k": "a"}), 5),
            doc(2, json!({"k": "a"}), 5),
            doc(3, json!({"k": "b"}), 7),
            doc(4, json!({"k": "b"}), 7),
        ];
        let err = resolver.resolve_read(&responses, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InconsistentLedgerState);
    }

    #[test]
    fn test_majority_tie_broken_by_sequence_number() {
        let resolver = ConsensusResolver::new(ReadQuorum::Majority);
        let newer = json!({"k": "b"});
        let responses = vec![
            doc(1, json!({"k": "a"}), 5),
            doc(2, json!({"k": "a"}), 5),
            doc(3, newer.clone(), 7),
            doc(4, newer.clone(), 7),
        ];
        let result = resolver.resolve_read(&responses, false).unwrap();
        assert_eq!(result.document(), Some(&newer));
        assert_eq!(result.seq_no, Some(7));

        let tied = vec![doc(1, json!({"k": "a"}), 5), doc(2, json!({"k": "b"}), 5)];
        let err = resolver.resolve_read(&tied, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InconsistentLedgerState);
    }

    #[test]
    fn test_outlier_sequence_number_does_not_decide() {
        let resolver = ConsensusResolver::new(ReadQuorum::Byzantine);
        let a = json!({"k": "a"});
        let responses = vec![doc(1, a.clone(), 5), doc(2, a.clone(), 5), doc(3, a.clone(), 9_999), doc(4, a.clone(), 5)];
        let result = resolver.resolve_read(&responses, false).unwrap();
        assert_eq!(result.seq_no, Some(5));

        // one member of the older group claims a huge seqNo; the newer group still wins
        let resolver = ConsensusResolver::new(ReadQuorum::Majority);
        let newer = json!({"k": "b"});
        let responses = vec![
            doc(1, a.clone(), 5),
            doc(2, a, 9_999),
            doc(3, newer.clone(), 7),
            doc(4, newer.clone(), 7),
        ];
        let result = resolver.resolve_read(&responses, false).unwrap();
        assert_eq!(result.document(), Some(&newer));
        assert_eq!(result.seq_no, Some(7));
    }

    #[test]
    fn test_read_refused_by_every_responder() {
        let resolver = ConsensusResolver::new(ReadQuorum::Byzantine);
        let responses = vec![
            NodeResponse::rejected(node(1), "unauthorized"),
            NodeResponse::rejected(node(2), "unauthorized"),
            NodeResponse::rejected(node(3), "unauthorized"),
            NodeResponse::timeout(node(4)),
        ];
        match resolver.resolve_read(&responses, false).unwrap_err() {
            ResolverError::QuorumNotReached { required, queried, tally } => {
                assert_eq!(required, 3);
                assert_eq!(queried, 4);
                assert_eq!(tally, Tally { accepted: 0, rejected: 3, failed: 0, timed_out: 1 });
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_absent_document_is_its_own_group() {
        let resolver = ConsensusResolver::new(ReadQuorum::Byzantine);
        let responses = vec![
            NodeResponse::reply(node(1), None, None),
            NodeResponse::reply(node(2), None, None),
            NodeResponse::reply(node(3), None, None),
            doc(4, json!({"k": "ghost"}), 1),
        ];
        let result = resolver.resolve_read(&responses, false).unwrap();
        assert_eq!(result.outcome, Outcome::Document(None));
    }

    #[test]
    fn test_canonical_grouping_and_immutable_flag() {
        let resolver = ConsensusResolver::new(ReadQuorum::Byzantine);
        let x: Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let y: Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        let responses = vec![doc(1, x, 2), doc(2, y.clone(), 2), doc(3, y, 2)];
        let result = resolver.resolve_read(&responses, true).unwrap();
        assert!(result.immutable);
        assert!(result.dissenting.is_empty());
    }
}
