//! Resolution cache - process-scoped store of resolved documents and tombstones

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::debug;

use crate::error::{ResolverError, ResolverResult};
use crate::identifier::Identifier;
use crate::parser::canonical;

/// Lifecycle of a DID/NYM record as seen by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryState {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub identifier: Identifier,
    /// `None` only for tombstones.
    pub document: Option<Value>,
    pub seq_no: Option<u64>,
    pub refreshed_at: DateTime<Utc>,
    pub immutable: bool,
    pub state: EntryState,
}

impl CacheEntry {
    pub fn new(identifier: Identifier, document: Value, seq_no: Option<u64>, state: EntryState) -> Self {
        let immutable = identifier.is_context();
        Self {
            identifier,
            document: Some(document),
            seq_no,
            refreshed_at: Utc::now(),
            immutable,
            state,
        }
    }

    pub fn tombstone(identifier: Identifier, seq_no: Option<u64>) -> Self {
        Self {
            identifier,
            document: None,
            seq_no,
            refreshed_at: Utc::now(),
            immutable: false,
            state: EntryState::Deleted,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.state == EntryState::Deleted
    }

    /// Immutable entries are always fresh; mutable ones expire after `threshold` when one is set.
    pub fn is_fresh(&self, threshold: Option<Duration>) -> bool {
        if self.immutable {
            return true;
        }
        match threshold.and_then(|t| chrono::Duration::from_std(t).ok()) {
            Some(limit) => Utc::now() - self.refreshed_at < limit,
            None => true,
        }
    }
}

/// Identifier-keyed cache. Readers share the lock; writers hold it exclusively.
#[derive(Default)]
pub struct ResolutionCache {
    entries: RwLock<HashMap<Identifier, CacheEntry>>,
}

impl ResolutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> ResolverResult<RwLockReadGuard<'_, HashMap<Identifier, CacheEntry>>> {
        self.entries
            .read()
            .map_err(|_| ResolverError::CacheCorruption("cache lock poisoned".to_string()))
    }

    fn write(&self) -> ResolverResult<RwLockWriteGuard<'_, HashMap<Identifier, CacheEntry>>> {
        self.entries
            .write()
            .map_err(|_| ResolverError::CacheCorruption("cache lock poisoned".to_string()))
    }

    pub fn get(&self, identifier: &Identifier) -> ResolverResult<Option<CacheEntry>> {
        Ok(self.read()?.get(identifier).cloned())
    }

    /// Stores an entry. Context entries must hash to their identifier and can never be replaced
    /// by different content; live entries cannot replace a tombstone.
    pub fn insert(&self, entry: CacheEntry) -> ResolverResult<()> {
        if entry.identifier.is_context() {
            verify_context(&entry)?;
        }
        let mut entries = self.write()?;

        if let Some(existing) = entries.get(&entry.identifier) {
            if existing.immutable {
                let same = existing.document.as_ref().map(canonical::canonicalize)
                    == entry.document.as_ref().map(canonical::canonicalize);
                if !same {
                    return Err(ResolverError::CacheCorruption(format!(
                        "immutable entry {} would be replaced by different content",
                        entry.identifier
                    )));
                }
                return Ok(());
            }
            if existing.is_deleted() && !entry.is_deleted() {
                return Err(ResolverError::TargetDeleted(entry.identifier.to_string()));
            }
        }

        debug!(identifier = %entry.identifier, state = ?entry.state, seq_no = ?entry.seq_no, "cache store");
        entries.insert(entry.identifier.clone(), entry);
        Ok(())
    }

    /// Drops a mutable live entry. Immutable entries and tombstones stay. Returns whether anything was removed.
    pub fn invalidate(&self, identifier: &Identifier) -> ResolverResult<bool> {
        let mut entries = self.write()?;
        let removable = entries.get(identifier).map_or(false, |e| !e.immutable && !e.is_deleted());
        if removable {
            entries.remove(identifier);
            debug!(identifier = %identifier, "cache invalidate");
        }
        Ok(removable)
    }

    pub fn mark_deleted(&self, identifier: &Identifier, seq_no: Option<u64>) -> ResolverResult<()> {
        if identifier.is_context() {
            return Err(ResolverError::ImmutableTarget(identifier.to_string()));
        }
        let mut entries = self.write()?;
        debug!(identifier = %identifier, "cache tombstone");
        entries.insert(identifier.clone(), CacheEntry::tombstone(identifier.clone(), seq_no));
        Ok(())
    }

    pub fn clear(&self) -> ResolverResult<()> {
        self.write()?.clear();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn verify_context(entry: &CacheEntry) -> ResolverResult<()> {
    let expected = entry.identifier.context_hash().ok_or_else(|| {
        ResolverError::CacheCorruption(format!("{} carries no content hash", entry.identifier))
    })?;
    let document = entry
        .document
        .as_ref()
        .ok_or_else(|| ResolverError::CacheCorruption(format!("context {} has no document", entry.identifier)))?;
    if canonical::content_hash(document) != expected {
        return Err(ResolverError::CacheCorruption(format!(
            "content of {} does not match its identifier",
            entry.identifier
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn did(s: &str) -> Identifier {
        Identifier::parse(s).unwrap()
    }

    fn context_entry(doc: Value) -> CacheEntry {
        let id = Identifier::for_context("sov", &canonical::content_hash(&doc));
        CacheEntry::new(id, doc, Some(1), EntryState::Created)
    }

    #[test]
    fn test_insert_get_invalidate() {
        let cache = ResolutionCache::new();
        let id = did("did:sov:WRfXPg8dantKVubE3HX8pw");
        cache.insert(CacheEntry::new(id.clone(), json!({"v": 1}), Some(4), EntryState::Created)).unwrap();
        assert_eq!(cache.get(&id).unwrap().unwrap().seq_no, Some(4));
        assert!(cache.invalidate(&id).unwrap());
        assert!(cache.get(&id).unwrap().is_none());
        assert!(!cache.invalidate(&id).unwrap());
    }

    #[test]
    fn test_context_entries_are_immutable() {
        let cache = ResolutionCache::new();
        let entry = context_entry(json!({"@context": {"name": "http://schema.org/name"}}));
        let id = entry.identifier.clone();
        assert!(entry.immutable);
        cache.insert(entry.clone()).unwrap();
        // same content is a no-op
        cache.insert(entry.clone()).unwrap();
        assert!(!cache.invalidate(&id).unwrap());
        assert!(cache.get(&id).unwrap().is_some());
        assert!(cache.get(&id).unwrap().unwrap().is_fresh(Some(Duration::ZERO)));

        let forged = CacheEntry::new(id, json!({"@context": {"name": "http://evil"}}), Some(2), EntryState::Created);
        assert_eq!(cache.insert(forged).unwrap_err().kind(), ErrorKind::CacheCorruption);
    }

    #[test]
    fn test_tombstones_persist() {
        let cache = ResolutionCache::new();
        let id = did("did:sov:WRfXPg8dantKVubE3HX8pw");
        cache.insert(CacheEntry::new(id.clone(), json!({"v": 1}), Some(1), EntryState::Created)).unwrap();
        cache.mark_deleted(&id, Some(2)).unwrap();
        assert!(cache.get(&id).unwrap().unwrap().is_deleted());
        assert!(!cache.invalidate(&id).unwrap());

        let revived = CacheEntry::new(id.clone(), json!({"v": 3}), Some(3), EntryState::Updated);
        assert_eq!(cache.insert(revived).unwrap_err().kind(), ErrorKind::TargetDeleted);
    }

    #[test]
    fn test_freshness_threshold() {
        let id = did("did:sov:WRfXPg8dantKVubE3HX8pw");
        let mut entry = CacheEntry::new(id, json!({}), None, EntryState::Created);
        assert!(entry.is_fresh(None));
        assert!(entry.is_fresh(Some(Duration::from_secs(60))));
        entry.refreshed_at = Utc::now() - chrono::Duration::seconds(120);
        assert!(!entry.is_fresh(Some(Duration::from_secs(60))));
    }

    #[test]
    fn test_clear() {
        let cache = ResolutionCache::new();
        cache.insert(context_entry(json!({"@context": ["https://w3id.org/did/v1"]}))).unwrap();
        assert_eq!(cache.len(), 1);
        cache.clear().unwrap();
        assert!(cache.is_empty());
    }
}
