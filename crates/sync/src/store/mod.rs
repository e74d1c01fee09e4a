//! Record store adapter contract.
//!
//! The remote document database is an external collaborator. The engine only
//! relies on the four operations of [`RecordStore`]: equality-filtered live
//! subscriptions delivering full result-set snapshots, a one-shot equality
//! read, a point patch, and a whole-record write.
//!
//! # Snapshots
//!
//! A subscription stream yields the complete current result set every time it
//! changes, never a delta. The first item is the result set at subscription
//! time. Dropping the stream cancels the subscription.

pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::{Map, Value};

use comanda_core::RecordId;

use crate::error::StoreError;

pub use memory::MemoryStore;

/// Top-level fields of a stored document.
pub type Fields = Map<String, Value>;

/// A stored document: store-assigned id plus untyped fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: RecordId,
    pub fields: Fields,
}

impl Document {
    #[must_use]
    pub const fn new(id: RecordId, fields: Fields) -> Self {
        Self { id, fields }
    }

    /// The string value of a top-level field, if present and a string.
    #[must_use]
    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }
}

/// A complete, point-in-time result set.
pub type Snapshot = Vec<Document>;

/// A live stream of snapshots for one subscription.
pub type SnapshotStream = BoxStream<'static, Result<Snapshot, StoreError>>;

/// Adapter over the external record store.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Open a live subscription to every record in `collection` whose `field`
    /// equals `value`.
    async fn subscribe_equals(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<SnapshotStream, StoreError>;

    /// Read every record in `collection` whose `field` equals `value`, once.
    async fn read_equals(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Snapshot, StoreError>;

    /// Merge `fields` into an existing record.
    async fn write_fields(
        &self,
        collection: &str,
        id: &RecordId,
        fields: Fields,
    ) -> Result<(), StoreError>;

    /// Create or fully replace a record.
    async fn write_whole(
        &self,
        collection: &str,
        id: &RecordId,
        fields: Fields,
    ) -> Result<(), StoreError>;
}
