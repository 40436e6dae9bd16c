//! Generic write-behind cache over an [`EntityStore`].
//!
//! Mutations land in memory immediately and mark the id dirty with a fresh
//! generation. `flush` writes the sampled batch and clears only ids whose
//! generation did not move in the meantime, so an update that races a flush
//! is persisted by the next one.

use std::{
    collections::{BTreeSet, HashMap},
    fmt::{Debug, Display},
    hash::Hash,
    thread,
    time::Duration,
};

use sim_proto::{BuildingId, CompanyId, CorporationId, TownId, TycoonId};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::{EntityStore, StoreError, StoreMode, StoreRecord};

/// Bounded retry for transient store failures during load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_secs(2),
        }
    }
}

/// Secondary index key. Each entity kind declares the keys it is reachable by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexKey {
    Company(CompanyId),
    Corporation(CorporationId),
    Tycoon(TycoonId),
    Town(TownId),
    Chunk { x: u32, y: u32 },
    Source(BuildingId),
    Sink(BuildingId),
}

pub trait CacheEntry: StoreRecord {
    type Id: Copy + Eq + Hash + Ord + Display + Debug + Send + Sync + 'static;

    fn id(&self) -> Self::Id;

    fn index_keys(&self) -> Vec<IndexKey> {
        Vec::new()
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("{kind} load failed after {attempts} attempts: {source}")]
    LoadExhausted {
        kind: &'static str,
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl FlushReport {
    pub fn merge(&mut self, other: FlushReport) {
        self.written += other.written;
        self.deleted += other.deleted;
        self.failed += other.failed;
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0 && self.deleted == 0 && self.failed == 0
    }
}

/// Dirty ids sampled for one flush, with the generation each was sampled at.
#[derive(Debug)]
pub struct FlushBatch<T: CacheEntry> {
    pub writes: Vec<(T::Id, u64, T)>,
    pub deletes: Vec<(T::Id, u64)>,
}

impl<T: CacheEntry> FlushBatch<T> {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }
}

pub struct WriteBehindCache<T: CacheEntry> {
    entries: HashMap<T::Id, T>,
    indices: HashMap<IndexKey, BTreeSet<T::Id>>,
    dirty: HashMap<T::Id, u64>,
    generation: u64,
    store: Box<dyn EntityStore<T>>,
}

impl<T: CacheEntry> WriteBehindCache<T> {
    pub fn new(store: Box<dyn EntityStore<T>>) -> Self {
        Self {
            entries: HashMap::new(),
            indices: HashMap::new(),
            dirty: HashMap::new(),
            generation: 0,
            store,
        }
    }

    pub fn kind(&self) -> &'static str {
        T::KIND
    }

    pub fn is_writable(&self) -> bool {
        self.store.mode() == StoreMode::ReadWrite
    }

    /// Replace the in-memory contents with the store's, retrying transient
    /// failures per `policy`.
    pub fn load(&mut self, policy: &RetryPolicy) -> Result<usize, CacheError> {
        let attempts = policy.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.all() {
                Ok(records) => {
                    self.entries.clear();
                    self.indices.clear();
                    self.dirty.clear();
                    for record in records {
                        self.insert(record);
                    }
                    info!(
                        target: "tycoon::cache",
                        kind = T::KIND,
                        count = self.entries.len(),
                        attempt,
                        "cache.loaded"
                    );
                    return Ok(self.entries.len());
                }
                Err(source) if attempt >= attempts => {
                    return Err(CacheError::LoadExhausted {
                        kind: T::KIND,
                        attempts,
                        source,
                    });
                }
                Err(err) => {
                    warn!(
                        target: "tycoon::cache",
                        kind = T::KIND,
                        attempt,
                        error = %err,
                        "cache.load_retry"
                    );
                    if !policy.backoff.is_zero() {
                        thread::sleep(policy.backoff);
                    }
                }
            }
        }
    }

    /// Upsert and mark dirty.
    pub fn update(&mut self, entity: T) {
        let id = entity.id();
        self.insert(entity);
        self.mark_dirty(id);
    }

    pub fn update_all(&mut self, entities: impl IntoIterator<Item = T>) {
        for entity in entities {
            self.update(entity);
        }
    }

    /// Drop from the index and mark dirty so the flush deletes the row.
    pub fn remove(&mut self, id: &T::Id) -> Option<T> {
        let removed = self.detach(id);
        self.mark_dirty(*id);
        removed
    }

    /// Upsert without marking dirty; replicas never persist.
    pub fn replicate(&mut self, entity: T) {
        self.insert(entity);
    }

    pub fn replicate_removal(&mut self, id: &T::Id) -> Option<T> {
        self.detach(id)
    }

    /// Replace the replica's contents with `entities`. Nothing is marked dirty.
    pub fn replicate_snapshot(&mut self, entities: impl IntoIterator<Item = T>) {
        let entities: Vec<T> = entities.into_iter().collect();
        let keep: BTreeSet<T::Id> = entities.iter().map(CacheEntry::id).collect();
        for id in self.ids() {
            if !keep.contains(&id) {
                self.detach(&id);
            }
        }
        for entity in entities {
            self.insert(entity);
        }
    }

    pub fn get(&self, id: &T::Id) -> Option<&T> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &T::Id) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every entry, ordered by id.
    pub fn all(&self) -> Vec<&T> {
        let mut entries: Vec<&T> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.id());
        entries
    }

    pub fn ids(&self) -> Vec<T::Id> {
        let mut ids: Vec<T::Id> = self.entries.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn ids_by_index(&self, key: &IndexKey) -> Vec<T::Id> {
        self.indices
            .get(key)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn by_index(&self, key: &IndexKey) -> Vec<&T> {
        self.indices
            .get(key)
            .map(|ids| ids.iter().filter_map(|id| self.entries.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn is_dirty(&self, id: &T::Id) -> bool {
        self.dirty.contains_key(id)
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Sample the dirty set. Ids present in the index are written, absent ones
    /// deleted.
    pub fn take_flush_batch(&self) -> FlushBatch<T> {
        let mut sampled: Vec<(T::Id, u64)> = self
            .dirty
            .iter()
            .map(|(id, generation)| (*id, *generation))
            .collect();
        sampled.sort();

        let mut batch = FlushBatch {
            writes: Vec::new(),
            deletes: Vec::new(),
        };
        for (id, generation) in sampled {
            match self.entries.get(&id) {
                Some(entity) => batch.writes.push((id, generation, entity.clone())),
                None => batch.deletes.push((id, generation)),
            }
        }
        batch
    }

    /// Clear `id` from the dirty set if it was not touched since `generation`.
    pub fn acknowledge(&mut self, id: &T::Id, generation: u64) -> bool {
        if self.dirty.get(id) == Some(&generation) {
            self.dirty.remove(id);
            true
        } else {
            false
        }
    }

    /// Persist the dirty set through this cache's own store.
    pub fn flush(&mut self) -> FlushReport {
        let batch = self.take_flush_batch();
        self.write_batch(batch)
    }

    /// Persist a previously sampled batch.
    pub fn write_batch(&mut self, batch: FlushBatch<T>) -> FlushReport {
        let mut report = FlushReport::default();
        if batch.is_empty() {
            return report;
        }

        for (id, generation, entity) in batch.writes {
            match self.store.set(&id.to_string(), &entity) {
                Ok(()) => {
                    self.acknowledge(&id, generation);
                    report.written += 1;
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        target: "tycoon::cache",
                        kind = T::KIND,
                        id = %id,
                        error = %err,
                        "cache.write_failed"
                    );
                }
            }
        }

        for (id, generation) in batch.deletes {
            match self.store.remove(&id.to_string()) {
                Ok(()) => {
                    self.acknowledge(&id, generation);
                    report.deleted += 1;
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        target: "tycoon::cache",
                        kind = T::KIND,
                        id = %id,
                        error = %err,
                        "cache.delete_failed"
                    );
                }
            }
        }

        debug!(
            target: "tycoon::cache",
            kind = T::KIND,
            written = report.written,
            deleted = report.deleted,
            failed = report.failed,
            "cache.flushed"
        );
        report
    }

    pub fn close(&mut self) -> Result<(), StoreError> {
        self.store.close()
    }

    fn mark_dirty(&mut self, id: T::Id) {
        self.generation += 1;
        self.dirty.insert(id, self.generation);
    }

    fn insert(&mut self, entity: T) {
        let id = entity.id();
        let keys = entity.index_keys();
        if let Some(previous) = self.entries.insert(id, entity) {
            self.unindex(id, &previous.index_keys());
        }
        for key in keys {
            self.indices.entry(key).or_default().insert(id);
        }
    }

    fn detach(&mut self, id: &T::Id) -> Option<T> {
        let removed = self.entries.remove(id)?;
        self.unindex(*id, &removed.index_keys());
        Some(removed)
    }

    fn unindex(&mut self, id: T::Id, keys: &[IndexKey]) {
        for key in keys {
            if let Some(ids) = self.indices.get_mut(key) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.indices.remove(key);
                }
            }
        }
    }
}
