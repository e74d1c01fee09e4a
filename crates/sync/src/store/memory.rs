//! In-memory record store.
//!
//! Implements the full adapter contract, including live subscriptions: every
//! write re-sends a fresh snapshot to each subscriber whose result set the
//! written record entered, left, or changed within. Used by the CLI
//! simulation and by tests, which can also inject failures.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc;
use tracing::{debug, trace};

use comanda_core::RecordId;

use super::{Document, Fields, RecordStore, Snapshot, SnapshotStream};
use crate::error::StoreError;

type SnapshotSender = mpsc::UnboundedSender<Result<Snapshot, StoreError>>;

struct Watcher {
    collection: String,
    field: String,
    value: String,
    tx: SnapshotSender,
}

impl Watcher {
    fn wants(&self, fields: Option<&Fields>) -> bool {
        fields.is_some_and(|f| matches(f, &self.field, &self.value))
    }
}

#[derive(Default)]
struct Faults {
    writes: Option<StoreError>,
    reads: Option<StoreError>,
    subscriptions: HashMap<String, StoreError>,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, BTreeMap<RecordId, Fields>>,
    watchers: Vec<Watcher>,
    faults: Faults,
    writes: usize,
}

impl Inner {
    fn snapshot(&self, collection: &str, field: &str, value: &str) -> Snapshot {
        self.collections
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .filter(|(_, fields)| matches(fields, field, value))
                    .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Store `after` under `id` and notify every subscriber whose result set
    /// is affected.
    fn put(&mut self, collection: &str, id: &RecordId, after: Fields) {
        let before = self
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), after.clone());

        let mut notify = Vec::new();
        for (index, watcher) in self.watchers.iter().enumerate() {
            if watcher.collection == collection
                && (watcher.wants(before.as_ref()) || watcher.wants(Some(&after)))
            {
                notify.push(index);
            }
        }

        let mut closed = Vec::new();
        for index in notify {
            let Some(watcher) = self.watchers.get(index) else {
                continue;
            };
            let snapshot = self.snapshot(&watcher.collection, &watcher.field, &watcher.value);
            if watcher.tx.unbounded_send(Ok(snapshot)).is_err() {
                closed.push(index);
            }
        }
        if !closed.is_empty() {
            let mut index = 0;
            self.watchers.retain(|_| {
                let keep = !closed.contains(&index);
                index += 1;
                keep
            });
        }
    }

    fn check_write(&mut self) -> Result<(), StoreError> {
        if let Some(err) = &self.faults.writes {
            return Err(err.clone());
        }
        self.writes += 1;
        Ok(())
    }
}

fn matches(fields: &Fields, field: &str, value: &str) -> bool {
    fields
        .get(field)
        .and_then(serde_json::Value::as_str)
        .is_some_and(|v| v == value)
}

/// A process-local record store with live subscriptions.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a record without counting it as a client write.
    ///
    /// Subscribers are notified exactly as for a regular write, so seeding can
    /// also simulate a change made by another client or by staff tooling.
    pub fn seed(&self, collection: &str, id: RecordId, fields: Fields) {
        self.lock().put(collection, &id, fields);
    }

    /// Current fields of a record.
    #[must_use]
    pub fn get(&self, collection: &str, id: &RecordId) -> Option<Fields> {
        self.lock()
            .collections
            .get(collection)
            .and_then(|records| records.get(id))
            .cloned()
    }

    /// Number of records in a collection.
    #[must_use]
    pub fn len(&self, collection: &str) -> usize {
        self.lock().collections.get(collection).map_or(0, BTreeMap::len)
    }

    /// Whether a collection has no records.
    #[must_use]
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Number of successful client writes (`write_fields` + `write_whole`).
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    /// Number of subscriptions whose stream is still alive.
    #[must_use]
    pub fn live_subscriptions(&self) -> usize {
        let mut inner = self.lock();
        inner.watchers.retain(|w| !w.tx.is_closed());
        inner.watchers.len()
    }

    /// Make every subsequent write fail with `error` (`None` restores writes).
    pub fn fail_writes(&self, error: Option<StoreError>) {
        self.lock().faults.writes = error;
    }

    /// Make every subsequent one-shot read fail with `error`.
    pub fn fail_reads(&self, error: Option<StoreError>) {
        self.lock().faults.reads = error;
    }

    /// Make subscriptions filtered on `field` fail to open.
    pub fn fail_subscriptions_on(&self, field: &str, error: Option<StoreError>) {
        let mut inner = self.lock();
        match error {
            Some(err) => {
                inner.faults.subscriptions.insert(field.to_string(), err);
            }
            None => {
                inner.faults.subscriptions.remove(field);
            }
        }
    }

    /// Push `error` into every live subscription on `collection`/`field`,
    /// simulating a stream that breaks after it was established.
    pub fn break_subscriptions(&self, collection: &str, field: &str, error: &StoreError) {
        let inner = self.lock();
        for watcher in inner
            .watchers
            .iter()
            .filter(|w| w.collection == collection && w.field == field)
        {
            let _ = watcher.tx.unbounded_send(Err(error.clone()));
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn subscribe_equals(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<SnapshotStream, StoreError> {
        let mut inner = self.lock();
        if let Some(err) = inner.faults.subscriptions.get(field) {
            return Err(err.clone());
        }

        let (tx, rx) = mpsc::unbounded();
        let initial = inner.snapshot(collection, field, value);
        // The receiver is still held here, so the initial send cannot fail.
        let _ = tx.unbounded_send(Ok(initial));
        inner.watchers.push(Watcher {
            collection: collection.to_string(),
            field: field.to_string(),
            value: value.to_string(),
            tx,
        });
        debug!(collection, field, "Opened memory subscription");

        Ok(rx.boxed())
    }

    async fn read_equals(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Snapshot, StoreError> {
        let inner = self.lock();
        if let Some(err) = &inner.faults.reads {
            return Err(err.clone());
        }
        Ok(inner.snapshot(collection, field, value))
    }

    async fn write_fields(
        &self,
        collection: &str,
        id: &RecordId,
        fields: Fields,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let mut merged = inner
            .collections
            .get(collection)
            .and_then(|records| records.get(id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.clone(),
            })?;
        inner.check_write()?;

        merged.extend(fields);
        inner.put(collection, id, merged);
        trace!(collection, %id, "Patched record");
        Ok(())
    }

    async fn write_whole(
        &self,
        collection: &str,
        id: &RecordId,
        fields: Fields,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check_write()?;
        inner.put(collection, id, fields);
        trace!(collection, %id, "Replaced record");
        Ok(())
    }
}
