//! Retroactive linking of email-keyed orders to the account id.
//!
//! Orders placed before a customer had an account carry only `userEmail`.
//! The first time a session starts for an account, every order matching the
//! session email is patched to also carry the account `userId`. Afterwards
//! those orders are reachable through the primary key alone.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument};

use comanda_core::{Email, UserId};

use crate::error::StoreError;
use crate::records::fields;
use crate::store::{Fields, RecordStore};

/// Errors from a backfill run.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Backfill read timed out after {0:?}")]
    Timeout(Duration),
}

/// Remembers which accounts were already linked during this session.
pub trait LinkGuard: Send + Sync {
    fn has_linked(&self, user_id: &UserId) -> bool;

    fn mark_linked(&self, user_id: &UserId);
}

/// In-process [`LinkGuard`] backed by a set of account ids.
///
/// Markers outlive individual sessions of the same process, so signing out and
/// back in does not repeat the backfill.
#[derive(Debug, Default)]
pub struct SessionMarkers {
    linked: Mutex<HashSet<UserId>>,
}

impl SessionMarkers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<UserId>> {
        self.linked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the marker for `user_id` so the next session links again.
    pub fn forget(&self, user_id: &UserId) -> bool {
        self.lock().remove(user_id)
    }
}

impl LinkGuard for SessionMarkers {
    fn has_linked(&self, user_id: &UserId) -> bool {
        self.lock().contains(user_id)
    }

    fn mark_linked(&self, user_id: &UserId) {
        self.lock().insert(user_id.clone());
    }
}

/// Patches email-keyed orders with the account id, once per account.
#[derive(Clone)]
pub struct BackfillLinker {
    store: Arc<dyn RecordStore>,
    guard: Arc<dyn LinkGuard>,
    collection: String,
    read_timeout: Option<Duration>,
}

impl BackfillLinker {
    #[must_use]
    pub fn new(
        store: Arc<dyn RecordStore>,
        guard: Arc<dyn LinkGuard>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            store,
            guard,
            collection: collection.into(),
            read_timeout: None,
        }
    }

    /// Bound the one-shot read with `timeout`.
    #[must_use]
    pub const fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Link every order keyed by `secondary` to `primary`.
    ///
    /// Returns the number of orders patched. Returns 0 without touching the
    /// store if this account was already linked. The account is marked as
    /// linked only after every patch succeeded, so a failed run is retried by
    /// the next session.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError`] if the read times out or any read or patch fails.
    #[instrument(skip_all, fields(user_id = %primary, collection = %self.collection))]
    pub async fn link_once(&self, primary: &UserId, secondary: &Email) -> Result<usize, LinkError> {
        if self.guard.has_linked(primary) {
            debug!("Backfill already ran for this account");
            return Ok(0);
        }

        let read = self
            .store
            .read_equals(&self.collection, fields::USER_EMAIL, secondary.as_str());
        let documents = match self.read_timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| LinkError::Timeout(limit))??,
            None => read.await?,
        };

        let mut patched = 0;
        for document in &documents {
            if document.str_field(fields::USER_ID) == Some(primary.as_str()) {
                continue;
            }
            let mut patch = Fields::new();
            patch.insert(
                fields::USER_ID.to_string(),
                Value::String(primary.to_string()),
            );
            patch.insert(
                fields::UPDATED_AT.to_string(),
                Value::String(Utc::now().to_rfc3339()),
            );
            self.store
                .write_fields(&self.collection, &document.id, patch)
                .await?;
            patched += 1;
        }

        self.guard.mark_linked(primary);
        info!(matched = documents.len(), patched, "Backfill complete");
        Ok(patched)
    }
}
