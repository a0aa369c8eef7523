//! Caller-facing ledger engine.
//!
//! A [`LedgerEngine`] owns the resolution cache, the transaction builder and
//! the call monitor for one process. Pools, signers and keys are borrowed per
//! call. Every operation validates locally before touching the network, so
//! malformed identifiers, writes against contexts and writes against deleted
//! records never produce a node request.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, EntryState, ResolutionCache};
use crate::config::ResolverConfig;
use crate::consensus::{ConsensusResolver, ConsensusResult};
use crate::dispatcher::{DispatchMode, DispatchOptions, PoolDispatcher};
use crate::error::{ResolverError, ResolverResult};
use crate::identifier::Identifier;
use crate::monitor::{MonitorSnapshot, ResolverMonitor};
use crate::pool::Pool;
use crate::signer::{sign_transaction, Signer, SignerKey};
use crate::transaction::{CreateParams, Operation, TaaAcceptance, Transaction, TransactionBuilder};

/// Per-read options.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Skip a cached mutable entry and ask the pool again. Context entries are always served from cache.
    pub force_refresh: bool,
    pub dispatch: DispatchOptions,
}

impl ReadOptions {
    pub fn refresh() -> Self {
        Self { force_refresh: true, ..Self::default() }
    }
}

pub struct LedgerEngine {
    config: ResolverConfig,
    builder: TransactionBuilder,
    dispatcher: PoolDispatcher,
    consensus: ConsensusResolver,
    cache: ResolutionCache,
    monitor: ResolverMonitor,
    taa_acceptance: Option<TaaAcceptance>,
}

impl LedgerEngine {
    pub fn new(config: ResolverConfig) -> ResolverResult<Self> {
        config.validate()?;
        info!(method = %config.did_method, fan_out = ?config.fan_out, "ledger engine ready");
        Ok(Self {
            builder: TransactionBuilder::new(&config.did_method),
            dispatcher: PoolDispatcher::new(config.clone()),
            consensus: ConsensusResolver::new(config.read_quorum),
            cache: ResolutionCache::new(),
            monitor: ResolverMonitor::new(),
            taa_acceptance: None,
            config,
        })
    }

    /// Attaches this acceptance to every write signed by the engine.
    pub fn with_taa_acceptance(mut self, acceptance: TaaAcceptance) -> Self {
        self.taa_acceptance = Some(acceptance);
        self
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Builder sharing the engine's nonce, for callers assembling transactions for [`submit`](Self::submit).
    pub fn builder(&self) -> &TransactionBuilder {
        &self.builder
    }

    pub fn cache(&self) -> &ResolutionCache {
        &self.cache
    }

    pub fn monitor(&self) -> &ResolverMonitor {
        &self.monitor
    }

    /// Drops every cached entry and returns the final counters.
    pub fn shutdown(self) -> MonitorSnapshot {
        if let Err(e) = self.cache.clear() {
            warn!("cache not cleared on shutdown: {}", e);
        }
        let snapshot = self.monitor.snapshot();
        info!(dispatches = snapshot.dispatches, "ledger engine shut down");
        snapshot
    }

    pub async fn context_create(
        &self,
        pool: &dyn Pool,
        submitter: &str,
        signer: &dyn Signer,
        key: &SignerKey,
        document: &Value,
    ) -> ResolverResult<Identifier> {
        self.observe(async {
            let tx = self.builder.build_context_create(submitter, document)?;
            let id = target_of(&tx)?;
            if self.cache.get(&id)?.is_some() {
                self.monitor.record_skipped_write();
                debug!(identifier = %id, "context already resolved, skipping write");
                return Ok(id);
            }
            self.write(pool, tx, signer, key).await?;
            Ok::<_, ResolverError>(id)
        }
        .await)
    }

    pub async fn context_read(&self, pool: &dyn Pool, identifier: &str) -> ResolverResult<Value> {
        self.observe(async {
            let tx = self.builder.build_context_read(None, identifier)?;
            self.read(pool, tx, &ReadOptions::default()).await
        }
        .await)
    }

    pub async fn did_create(
        &self,
        pool: &dyn Pool,
        params: CreateParams<'_>,
        signer: &dyn Signer,
        key: &SignerKey,
    ) -> ResolverResult<Identifier> {
        self.observe(async {
            let tx = self.builder.build_did_create(params)?;
            let id = target_of(&tx)?;
            self.write(pool, tx, signer, key).await?;
            Ok::<_, ResolverError>(id)
        }
        .await)
    }

    pub async fn did_read(&self, pool: &dyn Pool, identifier: &str, options: &ReadOptions) -> ResolverResult<Value> {
        self.observe(async {
            let tx = self.builder.build_did_read(None, identifier)?;
            self.read(pool, tx, options).await
        }
        .await)
    }

    pub async fn did_update(
        &self,
        pool: &dyn Pool,
        submitter: &str,
        identifier: &str,
        document: &Value,
        signer: &dyn Signer,
        key: &SignerKey,
    ) -> ResolverResult<()> {
        self.observe(async {
            let tx = self.builder.build_did_update(submitter, identifier, document)?;
            self.write(pool, tx, signer, key).await.map(|_| ())
        }
        .await)
    }

    pub async fn did_delete(
        &self,
        pool: &dyn Pool,
        submitter: &str,
        identifier: &str,
        signer: &dyn Signer,
        key: &SignerKey,
    ) -> ResolverResult<()> {
        self.observe(async {
            let tx = self.builder.build_did_delete(submitter, identifier)?;
            self.write(pool, tx, signer, key).await.map(|_| ())
        }
        .await)
    }

    pub async fn nym_create(
        &self,
        pool: &dyn Pool,
        params: CreateParams<'_>,
        signer: &dyn Signer,
        key: &SignerKey,
    ) -> ResolverResult<Identifier> {
        self.observe(async {
            let tx = self.builder.build_nym_create(params)?;
            let id = target_of(&tx)?;
            self.write(pool, tx, signer, key).await?;
            Ok::<_, ResolverError>(id)
        }
        .await)
    }

    pub async fn nym_read(&self, pool: &dyn Pool, identifier: &str, options: &ReadOptions) -> ResolverResult<Value> {
        self.observe(async {
            let tx = self.builder.build_nym_read(None, identifier)?;
            self.read(pool, tx, options).await
        }
        .await)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn nym_update(
        &self,
        pool: &dyn Pool,
        submitter: &str,
        identifier: &str,
        verkey: Option<&[u8]>,
        document: &Value,
        signer: &dyn Signer,
        key: &SignerKey,
    ) -> ResolverResult<()> {
        self.observe(async {
            let tx = self.builder.build_nym_update(submitter, identifier, verkey, document)?;
            self.write(pool, tx, signer, key).await.map(|_| ())
        }
        .await)
    }

    pub async fn nym_delete(
        &self,
        pool: &dyn Pool,
        submitter: &str,
        identifier: &str,
        signer: &dyn Signer,
        key: &SignerKey,
    ) -> ResolverResult<()> {
        self.observe(async {
            let tx = self.builder.build_nym_delete(submitter, identifier)?;
            self.write(pool, tx, signer, key).await.map(|_| ())
        }
        .await)
    }

    /// Sends an already signed write, optionally to an explicit node subset.
    /// Cache effects are the same as for the typed operations.
    pub async fn submit(&self, pool: &dyn Pool, tx: Transaction, options: &DispatchOptions) -> ResolverResult<ConsensusResult> {
        self.observe(self.commit(pool, tx, options).await)
    }

    fn observe<T>(&self, result: ResolverResult<T>) -> ResolverResult<T> {
        if let Err(e) = &result {
            self.monitor.record_error(e.kind());
        }
        result
    }

    fn ensure_live(&self, target: &Identifier) -> ResolverResult<()> {
        match self.cache.get(target)? {
            Some(entry) if entry.is_deleted() => Err(ResolverError::TargetDeleted(target.to_string())),
            _ => Ok(()),
        }
    }

    async fn write(
        &self,
        pool: &dyn Pool,
        tx: Transaction,
        signer: &dyn Signer,
        key: &SignerKey,
    ) -> ResolverResult<ConsensusResult> {
        self.ensure_live(&target_of(&tx)?)?;
        let tx = match &self.taa_acceptance {
            Some(taa) if tx.taa_acceptance.is_none() => tx.with_taa_acceptance(taa.clone())?,
            _ => tx,
        };
        let tx = sign_transaction(tx, signer, key)?;
        self.commit(pool, tx, &DispatchOptions::default()).await
    }

    async fn commit(&self, pool: &dyn Pool, tx: Transaction, options: &DispatchOptions) -> ResolverResult<ConsensusResult> {
        if !tx.kind.is_write() {
            return Err(ResolverError::InvalidDocument(format!("{:?} is not a write", tx.kind)));
        }
        if !tx.is_signed() {
            return Err(ResolverError::SigningFailed("write transaction carries no signature".to_string()));
        }
        let target = target_of(&tx)?;
        self.ensure_live(&target)?;

        let request = tx.request_bytes()?;
        let responses = self.dispatcher.dispatch_with(pool, &request, DispatchMode::Write, options).await?;
        self.monitor.record_dispatch(DispatchMode::Write, &responses);
        let result = self.consensus.resolve_write(&responses, responses.len())?;

        // read-your-own-write: the stale entry goes first, then the written value is stored
        match tx.kind {
            Operation::DidDelete | Operation::NymDelete => {
                self.cache.invalidate(&target)?;
                self.cache.mark_deleted(&target, result.seq_no)?;
            }
            kind => {
                let state = match kind {
                    Operation::DidUpdate | Operation::NymUpdate => EntryState::Updated,
                    _ => EntryState::Created,
                };
                self.cache.invalidate(&target)?;
                if let Some(document) = tx.document.clone() {
                    self.cache.insert(CacheEntry::new(target.clone(), document, result.seq_no, state))?;
                }
            }
        }

        info!(
            kind = ?tx.kind,
            identifier = %target,
            seq_no = ?result.seq_no,
            "write committed ({} of {} nodes accepted)",
            result.tally.accepted,
            result.tally.total()
        );
        Ok(result)
    }

    async fn read(&self, pool: &dyn Pool, tx: Transaction, options: &ReadOptions) -> ResolverResult<Value> {
        let target = target_of(&tx)?;
        let cached = self.cache.get(&target)?;

        if let Some(entry) = &cached {
            if entry.is_deleted() {
                return Err(ResolverError::TargetDeleted(target.to_string()));
            }
            let usable = entry.immutable || (!options.force_refresh && entry.is_fresh(self.config.freshness_threshold));
            if let (true, Some(document)) = (usable, &entry.document) {
                self.monitor.record_cache(true);
                debug!(identifier = %target, "cache hit");
                return Ok(document.clone());
            }
        }
        self.monitor.record_cache(false);

        let request = tx.request_bytes()?;
        let responses = self.dispatcher.dispatch_with(pool, &request, DispatchMode::Read, &options.dispatch).await?;
        self.monitor.record_dispatch(DispatchMode::Read, &responses);
        let result = self.consensus.resolve_read(&responses, target.is_context())?;

        if result.deactivated {
            if !target.is_context() {
                self.cache.mark_deleted(&target, result.seq_no)?;
            }
            return Err(ResolverError::TargetDeleted(target.to_string()));
        }
        let document = result
            .document()
            .cloned()
            .ok_or_else(|| ResolverError::NotFound(target.to_string()))?;

        let state = match &cached {
            Some(prev) if prev.seq_no.is_some() && prev.seq_no != result.seq_no => EntryState::Updated,
            Some(prev) => prev.state,
            None => EntryState::Created,
        };
        self.cache.insert(CacheEntry::new(target.clone(), document.clone(), result.seq_no, state))?;
        debug!(identifier = %target, seq_no = ?result.seq_no, "resolved from pool");
        Ok(document)
    }
}

fn target_of(tx: &Transaction) -> ResolverResult<Identifier> {
    tx.target
        .clone()
        .ok_or_else(|| ResolverError::InvalidIdentifier("transaction has no target identifier".to_string()))
}
