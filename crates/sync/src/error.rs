//! Error types shared by the sync engine, plus Sentry context helpers.
//!
//! Live-subscription failures are logged and swallowed where they occur; only
//! user-triggered one-shot operations (backfill, checkout) return these errors
//! to their caller.

use thiserror::Error;

use comanda_core::RecordId;

/// Errors reported by a [`RecordStore`](crate::store::RecordStore) adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or refused the operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A point patch targeted a record that does not exist.
    #[error("Record not found: {collection}/{id}")]
    NotFound {
        collection: String,
        id: RecordId,
    },

    /// The store rejected the write (permissions, validation).
    #[error("Write rejected: {0}")]
    Rejected(String),

    /// A live subscription could not be opened or broke mid-stream.
    #[error("Subscription failed: {0}")]
    Subscription(String),
}

/// Errors converting between store documents and typed records.
#[derive(Debug, Error)]
pub enum RecordError {
    /// A document did not match the expected record shape.
    #[error("Malformed record {id}: {source}")]
    Decode {
        id: RecordId,
        #[source]
        source: serde_json::Error,
    },

    /// A record could not be turned into a document.
    #[error("Failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    /// Records must encode to JSON objects.
    #[error("Record did not encode to an object")]
    NotAnObject,
}

/// Set the Sentry user context for the active session.
///
/// Call this after the identity is resolved to associate errors with users.
pub fn set_sentry_user(user_id: &impl ToString, email: Option<&str>) {
    sentry::configure_scope(|scope| {
        scope.set_user(Some(sentry::User {
            id: Some(user_id.to_string()),
            email: email.map(String::from),
            ..Default::default()
        }));
    });
}

/// Clear the Sentry user context when the session ends.
pub fn clear_sentry_user() {
    sentry::configure_scope(|scope| {
        scope.set_user(None);
    });
}

/// Add a breadcrumb for a customer action.
///
/// Breadcrumbs appear in Sentry error reports to show the trail of actions
/// leading up to an error.
///
/// # Example
///
/// ```rust,ignore
/// add_breadcrumb("checkout", "Placed order", Some(&[("order_number", "CMD-260101-AB12CD")]));
/// ```
pub fn add_breadcrumb(category: &str, message: &str, data: Option<&[(&str, &str)]>) {
    let mut breadcrumb = sentry::Breadcrumb {
        category: Some(category.to_string()),
        message: Some(message.to_string()),
        level: sentry::Level::Info,
        ..Default::default()
    };

    if let Some(pairs) = data {
        for (key, value) in pairs {
            breadcrumb.data.insert(
                (*key).to_string(),
                serde_json::Value::String((*value).to_string()),
            );
        }
    }

    sentry::add_breadcrumb(breadcrumb);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::NotFound {
            collection: "orders".to_string(),
            id: RecordId::new("ord-9"),
        };
        assert_eq!(err.to_string(), "Record not found: orders/ord-9");

        let err = StoreError::Unavailable("connection reset".to_string());
        assert_eq!(err.to_string(), "Store unavailable: connection reset");
    }

    #[test]
    fn test_record_error_names_the_record() {
        let source = serde_json::from_str::<u32>("\"x\"").unwrap_err();
        let err = RecordError::Decode {
            id: RecordId::new("ord-3"),
            source,
        };
        assert!(err.to_string().starts_with("Malformed record ord-3"));
    }
}
