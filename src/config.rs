//! Engine configuration: fan-out, timeouts, quorum rules and cache freshness.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::{ResolverError, ResolverResult};

/// Fan-out below this many nodes is never allowed.
pub const MIN_FAN_OUT: usize = 3;

/// How much agreement a read needs before it is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadQuorum {
    /// Winning answer held by strictly more than 2/3 of responders.
    Byzantine,
    /// Winning answer held by at least half of responders; ties go to the higher sequence number.
    Majority,
}

impl ReadQuorum {
    pub fn is_met(&self, agreeing: usize, responded: usize) -> bool {
        match self {
            ReadQuorum::Byzantine => agreeing * 3 > responded * 2,
            ReadQuorum::Majority => agreeing * 2 >= responded,
        }
    }

    /// Smallest agreeing group that meets the rule for `responded` answers.
    pub fn required(&self, responded: usize) -> usize {
        match self {
            ReadQuorum::Byzantine => responded * 2 / 3 + 1,
            ReadQuorum::Majority => (responded + 1) / 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// DID method used for derived identifiers.
    pub did_method: String,
    /// Nodes contacted per call; `None` means every node in the pool.
    pub fan_out: Option<usize>,
    /// Per-node timeout.
    pub node_timeout: Duration,
    /// Added to `node_timeout` for the whole call.
    pub aggregation_overhead: Duration,
    /// Byzantine faults tolerated; writes need at least 3f+1 nodes.
    pub fault_tolerance: usize,
    /// Responders required before a read is aggregated at all.
    pub min_read_responses: usize,
    pub read_quorum: ReadQuorum,
    /// Mutable cache entries older than this are refreshed. `None` keeps them until invalidated.
    pub freshness_threshold: Option<Duration>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            did_method: "sov".to_string(),
            fan_out: None,
            node_timeout: Duration::from_secs(20),
            aggregation_overhead: Duration::from_millis(500),
            fault_tolerance: 1,
            min_read_responses: 1,
            read_quorum: ReadQuorum::Byzantine,
            freshness_threshold: None,
        }
    }
}

impl ResolverConfig {
    /// Loads overrides from `INDY_RESOLVER_*` environment variables on top of the defaults.
    pub fn from_env() -> ResolverResult<Self> {
        let mut config = Self::default();

        if let Ok(method) = env::var("INDY_RESOLVER_DID_METHOD") {
            config.did_method = method;
        }
        if let Ok(v) = env::var("INDY_RESOLVER_FAN_OUT") {
            config.fan_out = Some(parse_var("INDY_RESOLVER_FAN_OUT", &v)?);
        }
        if let Ok(v) = env::var("INDY_RESOLVER_NODE_TIMEOUT_MS") {
            config.node_timeout = Duration::from_millis(parse_var("INDY_RESOLVER_NODE_TIMEOUT_MS", &v)?);
        }
        if let Ok(v) = env::var("INDY_RESOLVER_AGGREGATION_OVERHEAD_MS") {
            config.aggregation_overhead = Duration::from_millis(parse_var("INDY_RESOLVER_AGGREGATION_OVERHEAD_MS", &v)?);
        }
        if let Ok(v) = env::var("INDY_RESOLVER_FAULT_TOLERANCE") {
            config.fault_tolerance = parse_var("INDY_RESOLVER_FAULT_TOLERANCE", &v)?;
        }
        if let Ok(v) = env::var("INDY_RESOLVER_MIN_READ_RESPONSES") {
            config.min_read_responses = parse_var("INDY_RESOLVER_MIN_READ_RESPONSES", &v)?;
        }
        if let Ok(v) = env::var("INDY_RESOLVER_READ_QUORUM") {
            config.read_quorum = match v.to_lowercase().as_str() {
                "byzantine" => ReadQuorum::Byzantine,
                "majority" => ReadQuorum::Majority,
                other => {
                    return Err(ResolverError::InvalidDocument(format!(
                        "INDY_RESOLVER_READ_QUORUM must be 'byzantine' or 'majority', got '{}'",
                        other
                    )))
                }
            };
        }
        if let Ok(v) = env::var("INDY_RESOLVER_FRESHNESS_SECS") {
            config.freshness_threshold = Some(Duration::from_secs(parse_var("INDY_RESOLVER_FRESHNESS_SECS", &v)?));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ResolverResult<()> {
        if self.did_method.is_empty() || !self.did_method.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
            return Err(ResolverError::InvalidDocument(format!("invalid DID method '{}'", self.did_method)));
        }
        if let Some(w) = self.fan_out {
            if w < MIN_FAN_OUT {
                return Err(ResolverError::InvalidDocument(format!(
                    "fan-out {} is below the minimum of {}",
                    w, MIN_FAN_OUT
                )));
            }
        }
        if self.node_timeout.is_zero() {
            return Err(ResolverError::InvalidDocument("node timeout must be non-zero".to_string()));
        }
        if self.min_read_responses == 0 {
            return Err(ResolverError::InvalidDocument("min_read_responses must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Nodes a write must reach: 3f+1.
    pub fn min_write_nodes(&self) -> usize {
        3 * self.fault_tolerance + 1
    }

    pub fn call_deadline(&self, node_timeout: Duration) -> Duration {
        node_timeout + self.aggregation_overhead
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> ResolverResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| ResolverError::InvalidDocument(format!("{} has an invalid value '{}'", name, raw)))
}
