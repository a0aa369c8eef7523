//! indy_resolver: client engine for DID, NYM and context records on an Indy-style ledger
//!
//! # Usage
//! Build a [`LedgerEngine`] from a [`ResolverConfig`], then pass it a connected
//! [`Pool`] and a [`Signer`] per call. See `src/bin/resolver_sim.rs` for an
//! end-to-end run against the in-memory pool.

pub mod identifier;
pub mod parser {
	pub mod canonical;
	pub mod reply;
}
pub mod transaction;
pub mod signer;
pub mod pool;
pub mod dispatcher;
pub mod consensus;
pub mod cache;
pub mod monitor;
pub mod engine;
pub mod error;
pub mod config;

pub use config::{ReadQuorum, ResolverConfig};
pub use engine::{LedgerEngine, ReadOptions};
pub use error::{ErrorKind, ErrorReport, ResolverError, ResolverResult};
pub use identifier::Identifier;
pub use pool::{InMemoryPool, NodeId, Pool};
pub use signer::{KeyType, Signer, SignerKey};
pub use transaction::{CreateParams, TaaAcceptance, Transaction};
