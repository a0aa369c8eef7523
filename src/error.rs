//! Error types shared by every engine entry point.
//!
//! Callers match on [`ErrorKind`], which is stable across releases. The
//! human-readable message comes from the `Display` impl of [`ResolverError`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-node outcome counts attached to network and consensus failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub accepted: usize,
    pub rejected: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl Tally {
    pub fn responded(&self) -> usize {
        self.accepted + self.rejected
    }

    pub fn total(&self) -> usize {
        self.accepted + self.rejected + self.failed + self.timed_out
    }
}

impl fmt::Display for Tally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "accepted={} rejected={} failed={} timed_out={}",
            self.accepted, self.rejected, self.failed, self.timed_out
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Target is immutable: {0}")]
    ImmutableTarget(String),

    #[error("Target has been deleted: {0}")]
    TargetDeleted(String),

    #[error("No ledger record for {0}")]
    NotFound(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Pool unreachable: {reason} ({tally})")]
    PoolUnreachable { reason: String, tally: Tally },

    #[error("Quorum not reached: {required} acceptances required of {queried} nodes ({tally})")]
    QuorumNotReached {
        required: usize,
        queried: usize,
        tally: Tally,
    },

    #[error("Inconsistent ledger state: {reason} ({groups} distinct answers from {responded} nodes)")]
    InconsistentLedgerState {
        reason: String,
        groups: usize,
        responded: usize,
    },

    #[error("Cache corruption: {0}")]
    CacheCorruption(String),
}

/// Stable discriminant for [`ResolverError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidIdentifier,
    InvalidDocument,
    ImmutableTarget,
    TargetDeleted,
    NotFound,
    SigningFailed,
    PoolUnreachable,
    QuorumNotReached,
    InconsistentLedgerState,
    CacheCorruption,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidIdentifier => "InvalidIdentifier",
            ErrorKind::InvalidDocument => "InvalidDocument",
            ErrorKind::ImmutableTarget => "ImmutableTarget",
            ErrorKind::TargetDeleted => "TargetDeleted",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::SigningFailed => "SigningFailed",
            ErrorKind::PoolUnreachable => "PoolUnreachable",
            ErrorKind::QuorumNotReached => "QuorumNotReached",
            ErrorKind::InconsistentLedgerState => "InconsistentLedgerState",
            ErrorKind::CacheCorruption => "CacheCorruption",
        }
    }

    /// Validation kinds are raised before any node is contacted.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ErrorKind::InvalidIdentifier
                | ErrorKind::InvalidDocument
                | ErrorKind::ImmutableTarget
                | ErrorKind::TargetDeleted
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flattened error for language bindings: a kind plus a message, never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl ResolverError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResolverError::InvalidIdentifier(_) => ErrorKind::InvalidIdentifier,
            ResolverError::InvalidDocument(_) => ErrorKind::InvalidDocument,
            ResolverError::ImmutableTarget(_) => ErrorKind::ImmutableTarget,
            ResolverError::TargetDeleted(_) => ErrorKind::TargetDeleted,
            ResolverError::NotFound(_) => ErrorKind::NotFound,
            ResolverError::SigningFailed(_) => ErrorKind::SigningFailed,
            ResolverError::PoolUnreachable { .. } => ErrorKind::PoolUnreachable,
            ResolverError::QuorumNotReached { .. } => ErrorKind::QuorumNotReached,
            ResolverError::InconsistentLedgerState { .. } => ErrorKind::InconsistentLedgerState,
            ResolverError::CacheCorruption(_) => ErrorKind::CacheCorruption,
        }
    }

    /// Node tally, for the network and consensus kinds that carry one.
    pub fn tally(&self) -> Option<Tally> {
        match self {
            ResolverError::PoolUnreachable { tally, .. }
            | ResolverError::QuorumNotReached { tally, .. } => Some(*tally),
            _ => None,
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

pub type ResolverResult<T> = Result<T, ResolverError>;
