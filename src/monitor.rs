use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::dispatcher::{DispatchMode, NodeResponse, NodeStatus};
use crate::error::ErrorKind;

pub struct ResolverMonitor {
    pub dispatches: AtomicU64,
    pub reads: AtomicU64,
    pub writes: AtomicU64,

    // Cache
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    /// Context creates answered from cache without a write.
    pub skipped_writes: AtomicU64,

    // Outcomes
    pub quorum_failures: AtomicU64,
    pub inconsistent_reads: AtomicU64,
    pub unreachable: AtomicU64,
    pub local_rejections: AtomicU64,

    // Per node (NodeId -> Count)
    pub node_timeouts: DashMap<String, u64>,
    pub node_failures: DashMap<String, u64>,

    pub start_time: Instant,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonitorSnapshot {
    pub dispatches: u64,
    pub reads: u64,
    pub writes: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub skipped_writes: u64,
    pub quorum_failures: u64,
    pub inconsistent_reads: u64,
    pub unreachable: u64,
    pub local_rejections: u64,
}

impl Default for ResolverMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolverMonitor {
    pub fn new() -> Self {
        Self {
            dispatches: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            skipped_writes: AtomicU64::new(0),
            quorum_failures: AtomicU64::new(0),
            inconsistent_reads: AtomicU64::new(0),
            unreachable: AtomicU64::new(0),
            local_rejections: AtomicU64::new(0),
            node_timeouts: DashMap::with_capacity(64),
            node_failures: DashMap::with_capacity(64),
            start_time: Instant::now(),
        }
    }

    pub fn record_dispatch(&self, mode: DispatchMode, responses: &[NodeResponse]) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
        match mode {
            DispatchMode::Read => self.reads.fetch_add(1, Ordering::Relaxed),
            DispatchMode::Write => self.writes.fetch_add(1, Ordering::Relaxed),
        };
        for r in responses {
            match r.status {
                NodeStatus::Timeout => *self.node_timeouts.entry(r.node.to_string()).or_insert(0) += 1,
                NodeStatus::Failure(_) => *self.node_failures.entry(r.node.to_string()).or_insert(0) += 1,
                NodeStatus::Success => {}
            }
        }
    }

    pub fn record_cache(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_skipped_write(&self) {
        self.skipped_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, kind: ErrorKind) {
        match kind {
            ErrorKind::QuorumNotReached => { self.quorum_failures.fetch_add(1, Ordering::Relaxed); },
            ErrorKind::InconsistentLedgerState => { self.inconsistent_reads.fetch_add(1, Ordering::Relaxed); },
            ErrorKind::PoolUnreachable => { self.unreachable.fetch_add(1, Ordering::Relaxed); },
            k if k.is_local() => { self.local_rejections.fetch_add(1, Ordering::Relaxed); },
            _ => {}
        };
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            dispatches: self.dispatches.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            skipped_writes: self.skipped_writes.load(Ordering::Relaxed),
            quorum_failures: self.quorum_failures.load(Ordering::Relaxed),
            inconsistent_reads: self.inconsistent_reads.load(Ordering::Relaxed),
            unreachable: self.unreachable.load(Ordering::Relaxed),
            local_rejections: self.local_rejections.load(Ordering::Relaxed),
        }
    }

    pub fn render(&self) {
        let s = self.snapshot();
        let lookups = s.cache_hits + s.cache_misses;
        let hit_pct = if lookups > 0 { (s.cache_hits as f64 / lookups as f64) * 100.0 } else { 0.0 };

        println!("\x1B[1;36m╔═══════════════════════════════════════════════════════════════════════╗\x1B[0m");
        println!("\x1B[1;36m║                 INDY RESOLVER - LEDGER CALL SUMMARY                   ║\x1B[0m");
        println!("\x1B[1;36m╚═══════════════════════════════════════════════════════════════════════╝\x1B[0m");

        println!("\x1B[1;37mDispatches:\x1B[0m {} (reads {}, writes {})", s.dispatches, s.reads, s.writes);
        println!("\x1B[1;37mCache:\x1B[0m \x1B[1;32m{:>3.1}%\x1B[0m hit rate ({} hits / {} misses)", hit_pct, s.cache_hits, s.cache_misses);
        println!("\x1B[1;37mWrites skipped:\x1B[0m {} (context already known)", s.skipped_writes);
        println!();

        println!("\x1B[1;37m[ Error Diagnostics ]\x1B[0m");
        println!("  Quorum not reached:  \x1B[1;31m{}\x1B[0m", s.quorum_failures);
        println!("  Inconsistent reads:  \x1B[1;31m{}\x1B[0m", s.inconsistent_reads);
        println!("  Pool unreachable:    \x1B[1;31m{}\x1B[0m", s.unreachable);
        println!("  Rejected locally:    \x1B[1;33m{}\x1B[0m", s.local_rejections);
        println!();

        println!("\x1B[1;37m[ Unhealthy Nodes ]\x1B[0m");
        let mut board: Vec<(String, u64, u64)> = self
            .node_timeouts
            .iter()
            .map(|kv| kv.key().clone())
            .chain(self.node_failures.iter().map(|kv| kv.key().clone()))
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .map(|node| {
                let t = self.node_timeouts.get(&node).map(|v| *v).unwrap_or(0);
                let f = self.node_failures.get(&node).map(|v| *v).unwrap_or(0);
                (node, t, f)
            })
            .collect();
        board.sort_by(|a, b| (b.1 + b.2).cmp(&(a.1 + a.2)));
        if board.is_empty() {
            println!("  \x1B[32mnone\x1B[0m");
        }
        for (node, timeouts, failures) in board.iter().take(10) {
            println!("  \x1B[33m{:<12}\x1B[0m timeouts {:>5} | failures {:>5}", node, timeouts, failures);
        }

        println!("\x1B[90m-------------------------------------------------------------------------");
        println!(" Uptime: {:?}\x1B[0m", self.start_time.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::NodeId;

    #[test]
    fn test_counts_node_problems() {
        let monitor = ResolverMonitor::new();
        let responses = vec![
            NodeResponse::reply(NodeId::new("Node1"), None, None),
            NodeResponse::timeout(NodeId::new("Node2")),
            NodeResponse::failure(NodeId::new("Node3"), "refused"),
        ];
        monitor.record_dispatch(DispatchMode::Read, &responses);
        monitor.record_dispatch(DispatchMode::Write, &responses[1..]);
        assert_eq!(*monitor.node_timeouts.get("Node2").unwrap(), 2);
        assert_eq!(*monitor.node_failures.get("Node3").unwrap(), 2);
        let s = monitor.snapshot();
        assert_eq!((s.dispatches, s.reads, s.writes), (2, 1, 1));
    }

    #[test]
    fn test_error_buckets() {
        let monitor = ResolverMonitor::new();
        monitor.record_error(ErrorKind::QuorumNotReached);
        monitor.record_error(ErrorKind::ImmutableTarget);
        monitor.record_error(ErrorKind::SigningFailed);
        monitor.record_cache(true);
        monitor.record_cache(false);
        let s = monitor.snapshot();
        assert_eq!(s.quorum_failures, 1);
        assert_eq!(s.local_rejections, 1);
        assert_eq!((s.cache_hits, s.cache_misses), (1, 1));
    }
}
