//! Scenario tests for the Comanda sync engine.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p comanda-integration-tests
//! ```
//!
//! # Test Categories
//!
//! - `aggregation` - Readiness gating, dedup, ordering and cancellation
//! - `cart_sync` - Optimistic cart writes and echo handling
//! - `backfill` - Patch shape and guard short-circuit for order linking
//! - `session` - Identity switches, backfill and checkout end to end
//!
//! # Harness
//!
//! [`ManualStore`] is a record store whose subscriptions deliver only what a
//! test pushes into them, so tests decide exactly when each source reports.
//! Tests that only need realistic store behavior use
//! [`comanda_sync::MemoryStore`] instead.

#![cfg_attr(not(test), forbid(unsafe_code))]

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures::StreamExt;
use futures::channel::mpsc;
use serde_json::{Value, json};

use comanda_core::RecordId;
use comanda_sync::{Document, Fields, RecordStore, Snapshot, SnapshotStream, StoreError};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(2);

/// How long a test watches for something that must not happen.
pub const QUIET: Duration = Duration::from_millis(50);

// =============================================================================
// Manual Store
// =============================================================================

type Key = (String, String, String);
type SnapshotSender = mpsc::UnboundedSender<Result<Snapshot, StoreError>>;

fn key(collection: &str, field: &str, value: &str) -> Key {
    (collection.to_string(), field.to_string(), value.to_string())
}

/// A write recorded by [`ManualStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct Write {
    pub collection: String,
    pub id: RecordId,
    pub fields: Fields,
    /// `true` for `write_whole`, `false` for `write_fields`.
    pub whole: bool,
}

#[derive(Default)]
struct State {
    subscribers: HashMap<Key, Vec<SnapshotSender>>,
    subscribe_failures: HashMap<String, StoreError>,
    reads: HashMap<Key, Snapshot>,
    writes: Vec<Write>,
}

/// Record store driven entirely by the test.
///
/// Subscriptions start silent; [`ManualStore::emit`] delivers a snapshot.
/// Writes are recorded and never echoed.
#[derive(Default)]
pub struct ManualStore {
    state: Mutex<State>,
}

impl ManualStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver `documents` to every open subscription on the key.
    ///
    /// Returns the number of subscriptions reached.
    pub fn emit(&self, collection: &str, field: &str, value: &str, documents: Vec<Document>) -> usize {
        self.send(collection, field, value, &Ok(documents))
    }

    /// Break every open subscription on the key with `error`.
    pub fn break_stream(&self, collection: &str, field: &str, value: &str, error: StoreError) -> usize {
        self.send(collection, field, value, &Err(error))
    }

    fn send(
        &self,
        collection: &str,
        field: &str,
        value: &str,
        item: &Result<Snapshot, StoreError>,
    ) -> usize {
        let mut state = self.lock();
        let Some(senders) = state.subscribers.get_mut(&key(collection, field, value)) else {
            return 0;
        };
        senders.retain(|tx| tx.unbounded_send(item.clone()).is_ok());
        senders.len()
    }

    /// End every open subscription on the key without a final snapshot.
    ///
    /// Returns the number of subscriptions closed.
    pub fn close(&self, collection: &str, field: &str, value: &str) -> usize {
        self.lock()
            .subscribers
            .remove(&key(collection, field, value))
            .map_or(0, |senders| senders.len())
    }

    /// Make subscriptions filtered on `field` fail to open.
    pub fn fail_subscribe(&self, field: &str, error: StoreError) {
        self.lock()
            .subscribe_failures
            .insert(field.to_string(), error);
    }

    /// Result returned by `read_equals` for the key.
    pub fn set_read(&self, collection: &str, field: &str, value: &str, documents: Vec<Document>) {
        self.lock()
            .reads
            .insert(key(collection, field, value), documents);
    }

    /// Number of live subscriptions on the key.
    #[must_use]
    pub fn subscribers(&self, collection: &str, field: &str, value: &str) -> usize {
        let mut state = self.lock();
        state
            .subscribers
            .get_mut(&key(collection, field, value))
            .map_or(0, |senders| {
                senders.retain(|tx| !tx.is_closed());
                senders.len()
            })
    }

    /// Wait until at least `count` subscriptions are open on the key.
    pub async fn wait_for_subscribers(&self, collection: &str, field: &str, value: &str, count: usize) {
        eventually(|| self.subscribers(collection, field, value) >= count).await;
    }

    /// Every write so far, in order.
    #[must_use]
    pub fn writes(&self) -> Vec<Write> {
        self.lock().writes.clone()
    }

    /// Wait until at least `count` writes were made, then return them all.
    pub async fn wait_for_writes(&self, count: usize) -> Vec<Write> {
        eventually(|| self.lock().writes.len() >= count).await;
        self.writes()
    }
}

#[async_trait]
impl RecordStore for ManualStore {
    async fn subscribe_equals(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<SnapshotStream, StoreError> {
        let mut state = self.lock();
        if let Some(error) = state.subscribe_failures.get(field) {
            return Err(error.clone());
        }
        let (tx, rx) = mpsc::unbounded();
        state
            .subscribers
            .entry(key(collection, field, value))
            .or_default()
            .push(tx);
        Ok(rx.boxed())
    }

    async fn read_equals(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Snapshot, StoreError> {
        Ok(self
            .lock()
            .reads
            .get(&key(collection, field, value))
            .cloned()
            .unwrap_or_default())
    }

    async fn write_fields(
        &self,
        collection: &str,
        id: &RecordId,
        fields: Fields,
    ) -> Result<(), StoreError> {
        self.lock().writes.push(Write {
            collection: collection.to_string(),
            id: id.clone(),
            fields,
            whole: false,
        });
        Ok(())
    }

    async fn write_whole(
        &self,
        collection: &str,
        id: &RecordId,
        fields: Fields,
    ) -> Result<(), StoreError> {
        self.lock().writes.push(Write {
            collection: collection.to_string(),
            id: id.clone(),
            fields,
            whole: true,
        });
        Ok(())
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// A fixed point in time shifted by `minutes`.
#[must_use]
pub fn at(minutes: i64) -> DateTime<Utc> {
    let base = DateTime::from_timestamp(1_704_067_200, 0).unwrap_or_default();
    base + TimeDelta::minutes(minutes)
}

/// Builder for order documents.
#[derive(Debug, Clone)]
pub struct OrderDoc {
    id: String,
    fields: Fields,
}

impl OrderDoc {
    /// A pending one-line order created `created` minutes after [`at`]`(0)`.
    #[must_use]
    pub fn new(id: &str, created: i64) -> Self {
        let mut fields = Fields::new();
        fields.insert("orderNumber".into(), json!(format!("CMD-TEST-{id}")));
        fields.insert(
            "items".into(),
            json!([{"menuItemId": "soup", "name": "Soup", "quantity": 1, "price": "4.00"}]),
        );
        fields.insert("status".into(), json!("pending"));
        fields.insert("paymentStatus".into(), json!("pending"));
        fields.insert("createdAt".into(), json!(at(created).to_rfc3339()));
        fields.insert("updatedAt".into(), json!(at(created).to_rfc3339()));
        Self {
            id: id.to_string(),
            fields,
        }
    }

    #[must_use]
    pub fn user_id(self, user_id: &str) -> Self {
        self.field("userId", json!(user_id))
    }

    #[must_use]
    pub fn email(self, email: &str) -> Self {
        self.field("userEmail", json!(email))
    }

    #[must_use]
    pub fn status(self, status: &str) -> Self {
        self.field("status", json!(status))
    }

    #[must_use]
    pub fn updated(self, minutes: i64) -> Self {
        self.field("updatedAt", json!(at(minutes).to_rfc3339()))
    }

    #[must_use]
    pub fn field(mut self, name: &str, value: Value) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    #[must_use]
    pub fn fields(&self) -> Fields {
        self.fields.clone()
    }

    #[must_use]
    pub fn doc(&self) -> Document {
        Document::new(RecordId::new(self.id.as_str()), self.fields.clone())
    }
}

// =============================================================================
// Waiting
// =============================================================================

/// Poll `check` until it holds.
///
/// # Panics
///
/// Panics if `check` does not hold within [`WAIT`].
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {WAIT:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Await `future`, failing the test if it takes longer than [`WAIT`].
///
/// # Panics
///
/// Panics on timeout.
pub async fn within<F: Future>(future: F) -> F::Output {
    match tokio::time::timeout(WAIT, future).await {
        Ok(output) => output,
        Err(_) => panic!("timed out after {WAIT:?}"),
    }
}

/// Whether `future` stays pending for [`QUIET`].
pub async fn stays_pending<F: Future>(future: F) -> bool {
    tokio::time::timeout(QUIET, future).await.is_err()
}
