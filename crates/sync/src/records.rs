//! Typed records at the adapter boundary.
//!
//! Documents arrive as untyped JSON objects. They are decoded into core record
//! types here and nowhere else; a document that does not decode is quarantined
//! (logged and skipped) so one malformed record never poisons a whole view.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::error::RecordError;
use crate::store::{Document, Fields};

/// Owner-key field names shared by orders and carts.
pub mod fields {
    /// Primary owner key (account id).
    pub const USER_ID: &str = "userId";
    /// Secondary owner key (contact email).
    pub const USER_EMAIL: &str = "userEmail";
    /// Last-update timestamp.
    pub const UPDATED_AT: &str = "updatedAt";
}

/// Decode one document into a typed record.
///
/// The document id is exposed to the record as an `id` field.
///
/// # Errors
///
/// Returns [`RecordError::Decode`] naming the document if its fields do not
/// match `T`.
pub fn decode<T: DeserializeOwned>(document: &Document) -> Result<T, RecordError> {
    let mut object = document.fields.clone();
    object.insert("id".to_string(), Value::String(document.id.to_string()));
    serde_json::from_value(Value::Object(object)).map_err(|source| RecordError::Decode {
        id: document.id.clone(),
        source,
    })
}

/// Decode every document of a snapshot, quarantining the ones that fail.
pub fn decode_snapshot<T: DeserializeOwned>(documents: &[Document], kind: &str) -> Vec<T> {
    documents
        .iter()
        .filter_map(|document| match decode(document) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(kind, id = %document.id, error = %err, "Quarantined malformed record");
                None
            }
        })
        .collect()
}

/// Encode a typed record into document fields.
///
/// Any `id` field is dropped: the id travels beside the fields, never inside.
///
/// # Errors
///
/// Returns [`RecordError`] if serialization fails or does not yield an object.
pub fn encode<T: Serialize>(record: &T) -> Result<Fields, RecordError> {
    match serde_json::to_value(record)? {
        Value::Object(mut object) => {
            object.remove("id");
            Ok(object)
        }
        _ => Err(RecordError::NotAnObject),
    }
}
