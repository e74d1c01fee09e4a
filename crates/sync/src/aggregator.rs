//! Live aggregation of a customer's orders across identity keys.
//!
//! One live subscription is opened per identity key. Each subscription is a
//! *source* whose latest snapshot replaces its own `{id → order}` map. Once
//! every source has delivered at least once, the maps are merged into a single
//! deduplicated list sorted newest first, and the merge is recomputed and
//! re-emitted on every later snapshot from any source.
//!
//! # Merge order
//!
//! Primary-source orders are inserted first, then secondary-source orders.
//! When both report the same id the [`MergePolicy`] decides which copy
//! survives; the result never contains an id twice.
//!
//! # Failure
//!
//! A source that fails to open, whose stream reports an error, or whose stream
//! ends before its first snapshot, counts as ready and empty for the rest of
//! the subscription. The remaining sources keep the view alive. A source that
//! ends after reporting keeps its last snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt;
use futures::future::join_all;
use futures::stream::{self, select_all};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use comanda_core::{IdentityKeys, Order, RecordId};

use crate::records::{self, fields};
use crate::store::RecordStore;
use crate::subscription::Subscription;

/// Rule deciding which copy wins when an order is reported by both sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// The secondary (email-keyed) copy always wins.
    #[default]
    SecondaryWins,
    /// The copy with the later `updated_at` wins; ties go to the secondary.
    NewestUpdate,
}

impl std::fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SecondaryWins => write!(f, "secondary_wins"),
            Self::NewestUpdate => write!(f, "newest_update"),
        }
    }
}

impl std::str::FromStr for MergePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "secondary_wins" => Ok(Self::SecondaryWins),
            "newest_update" => Ok(Self::NewestUpdate),
            other => Err(format!("invalid merge policy: {other}")),
        }
    }
}

/// Which identity key a source is filtered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRole {
    Primary,
    Secondary,
}

/// Materialized state of one source.
#[derive(Debug, Default)]
pub struct StreamState {
    records: HashMap<RecordId, Order>,
    ready: bool,
    failed: bool,
}

impl StreamState {
    /// Replace the whole map with a new snapshot and mark the source ready.
    pub fn replace(&mut self, orders: Vec<Order>) {
        self.records = orders.into_iter().map(|o| (o.id.clone(), o)).collect();
        self.ready = true;
    }

    /// Mark the source permanently empty.
    pub fn fail(&mut self) {
        self.records.clear();
        self.ready = true;
        self.failed = true;
    }

    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn orders(&self) -> impl Iterator<Item = &Order> {
        self.records.values()
    }
}

/// Merge the orders of both sources and sort them newest first.
pub fn merge_orders<'a>(
    primary: impl IntoIterator<Item = &'a Order>,
    secondary: impl IntoIterator<Item = &'a Order>,
    policy: MergePolicy,
) -> Vec<Order> {
    let mut merged: HashMap<&RecordId, &Order> = HashMap::new();
    for order in primary {
        merged.insert(&order.id, order);
    }
    for order in secondary {
        let keep_existing = policy == MergePolicy::NewestUpdate
            && merged
                .get(&order.id)
                .is_some_and(|existing| existing.updated_at > order.updated_at);
        if !keep_existing {
            merged.insert(&order.id, order);
        }
    }

    let mut orders: Vec<Order> = merged.into_values().cloned().collect();
    sort_newest_first(&mut orders);
    orders
}

/// Sort by creation time descending, ties broken by id ascending.
pub fn sort_newest_first(orders: &mut [Order]) {
    orders.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

type Sink = Arc<Mutex<Option<Box<dyn FnMut(&[Order]) + Send>>>>;

struct Source {
    role: SourceRole,
    field: &'static str,
    value: String,
}

fn sources_for(keys: &IdentityKeys) -> Vec<Source> {
    let mut sources = vec![Source {
        role: SourceRole::Primary,
        field: fields::USER_ID,
        value: keys.primary.to_string(),
    }];
    if let Some(email) = &keys.secondary {
        sources.push(Source {
            role: SourceRole::Secondary,
            field: fields::USER_EMAIL,
            value: email.to_string(),
        });
    }
    sources
}

/// Produces a live, deduplicated order history for an identity.
#[derive(Clone)]
pub struct LiveAggregator {
    store: Arc<dyn RecordStore>,
    collection: String,
    policy: MergePolicy,
}

impl LiveAggregator {
    /// Create an aggregator over `collection`.
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, collection: impl Into<String>, policy: MergePolicy) -> Self {
        Self {
            store,
            collection: collection.into(),
            policy,
        }
    }

    /// Start observing every order owned by `keys`.
    ///
    /// `on_update` receives the merged list, first once every source is ready
    /// and then after every later snapshot. It runs on the aggregation task and
    /// must not cancel its own subscription. After the returned handle is
    /// cancelled (or dropped) `on_update` is never called again.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn observe<F>(&self, keys: &IdentityKeys, on_update: F) -> Subscription
    where
        F: FnMut(&[Order]) + Send + 'static,
    {
        let token = CancellationToken::new();
        let callback: Box<dyn FnMut(&[Order]) + Send> = Box::new(on_update);
        let sink: Sink = Arc::new(Mutex::new(Some(callback)));
        let span = info_span!("aggregate_orders", user_id = %keys.primary);

        let task = tokio::spawn(
            self.clone()
                .run(sources_for(keys), sink.clone(), token.clone())
                .instrument(span),
        );

        Subscription::new("orders", token, task).on_cancel(move || {
            sink.lock().unwrap_or_else(PoisonError::into_inner).take();
        })
    }

    async fn run(self, sources: Vec<Source>, sink: Sink, token: CancellationToken) {
        let opening = join_all(sources.iter().map(|source| {
            self.store
                .subscribe_equals(&self.collection, source.field, &source.value)
        }));
        let opened = tokio::select! {
            () = token.cancelled() => return,
            opened = opening => opened,
        };

        let mut states: Vec<StreamState> = sources.iter().map(|_| StreamState::default()).collect();
        let mut streams = Vec::with_capacity(sources.len());
        for (index, (source, result)) in sources.iter().zip(opened).enumerate() {
            match result {
                Ok(stream) => streams.push(
                    stream
                        .map(move |item| (index, Some(item)))
                        .chain(stream::once(async move { (index, None) }))
                        .boxed(),
                ),
                Err(err) => {
                    warn!(field = source.field, error = %err, "Order source failed to open, treating as empty");
                    if let Some(state) = states.get_mut(index) {
                        state.fail();
                    }
                }
            }
        }
        self.emit_if_ready(&sources, &states, &sink);

        let mut events = select_all(streams);
        loop {
            let next = tokio::select! {
                () = token.cancelled() => break,
                next = events.next() => next,
            };
            let Some((index, item)) = next else {
                debug!("All order sources closed");
                break;
            };
            let (Some(state), Some(source)) = (states.get_mut(index), sources.get(index)) else {
                continue;
            };
            if state.failed {
                continue;
            }
            match item {
                Some(Ok(documents)) => state.replace(records::decode_snapshot(&documents, "order")),
                Some(Err(err)) => {
                    warn!(field = source.field, error = %err, "Order source broke, treating as empty");
                    state.fail();
                }
                None if state.is_ready() => {
                    debug!(field = source.field, "Order source closed");
                    continue;
                }
                None => {
                    warn!(field = source.field, "Order source closed before reporting, treating as empty");
                    state.fail();
                }
            }
            self.emit_if_ready(&sources, &states, &sink);
        }
    }

    fn emit_if_ready(&self, sources: &[Source], states: &[StreamState], sink: &Sink) {
        if !states.iter().all(StreamState::is_ready) {
            return;
        }
        let by_role = move |role: SourceRole| {
            sources
                .iter()
                .zip(states)
                .filter(move |(source, _)| source.role == role)
                .flat_map(|(_, state)| state.orders())
        };
        let orders = merge_orders(
            by_role(SourceRole::Primary),
            by_role(SourceRole::Secondary),
            self.policy,
        );
        debug!(count = orders.len(), "Emitting merged orders");

        if let Some(on_update) = sink.lock().unwrap_or_else(PoisonError::into_inner).as_mut() {
            on_update(&orders);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tokio::sync::mpsc;

    use comanda_core::{Email, UserId};

    use super::*;
    use crate::store::{Fields, MemoryStore};

    fn order(id: &str, minute: u32, updated_minute: u32) -> Order {
        let fields = order_fields(id, minute, updated_minute, json!({"userId": "uid-1"}));
        records::decode(&crate::store::Document::new(RecordId::new(id), fields)).unwrap()
    }

    fn order_fields(id: &str, minute: u32, updated_minute: u32, owners: serde_json::Value) -> Fields {
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 12, minute, 0).unwrap();
        let updated = Utc.with_ymd_and_hms(2026, 3, 1, 13, updated_minute, 0).unwrap();
        let mut value = json!({
            "orderNumber": format!("CMD-{id}"),
            "items": [{"menuItemId": "soup", "name": "Soup", "quantity": 1, "price": "4.00"}],
            "status": "pending",
            "paymentStatus": "pending",
            "createdAt": created.to_rfc3339(),
            "updatedAt": updated.to_rfc3339()
        });
        for (key, owner) in owners.as_object().unwrap() {
            value[key] = owner.clone();
        }
        value.as_object().cloned().unwrap()
    }

    fn keys() -> IdentityKeys {
        IdentityKeys::new(
            UserId::new("uid-1"),
            Some(Email::parse("ana@example.com").unwrap()),
        )
    }

    fn ids(orders: &[Order]) -> Vec<&str> {
        orders.iter().map(|o| o.id.as_str()).collect()
    }

    #[test]
    fn test_merge_deduplicates_with_secondary_winning() {
        let primary = [order("a", 1, 5)];
        let mut secondary_a = order("a", 1, 0);
        secondary_a.status = comanda_core::OrderStatus::Ready;
        let secondary = [secondary_a, order("b", 2, 0)];

        let merged = merge_orders(&primary, &secondary, MergePolicy::SecondaryWins);
        assert_eq!(ids(&merged), vec!["b", "a"]);
        assert_eq!(merged[1].status, comanda_core::OrderStatus::Ready);
    }

    #[test]
    fn test_merge_newest_update_policy() {
        let mut fresher = order("a", 1, 30);
        fresher.status = comanda_core::OrderStatus::Delivered;
        let stale = order("a", 1, 10);

        let merged = merge_orders([&fresher], [&stale], MergePolicy::NewestUpdate);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, comanda_core::OrderStatus::Delivered);

        // Ties go to the secondary copy.
        let mut tie = order("a", 1, 30);
        tie.status = comanda_core::OrderStatus::Cancelled;
        let merged = merge_orders([&fresher], [&tie], MergePolicy::NewestUpdate);
        assert_eq!(merged[0].status, comanda_core::OrderStatus::Cancelled);
    }

    #[test]
    fn test_sort_is_newest_first_with_id_tiebreak() {
        let mut orders = vec![order("c", 10, 0), order("b", 30, 0), order("a", 10, 0)];
        sort_newest_first(&mut orders);
        assert_eq!(ids(&orders), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_merge_policy_parse() {
        assert_eq!("newest_update".parse(), Ok(MergePolicy::NewestUpdate));
        assert_eq!(MergePolicy::SecondaryWins.to_string(), "secondary_wins");
        assert!("latest".parse::<MergePolicy>().is_err());
    }

    #[test]
    fn test_failed_state_is_ready_and_empty() {
        let mut state = StreamState::default();
        state.replace(vec![order("a", 1, 0)]);
        state.fail();
        assert!(state.is_ready());
        assert_eq!(state.orders().count(), 0);
    }

    #[tokio::test]
    async fn test_observe_merges_both_sources() {
        let store = Arc::new(MemoryStore::new());
        store.seed("orders", RecordId::new("a"), order_fields("a", 1, 0, json!({"userId": "uid-1"})));
        store.seed(
            "orders",
            RecordId::new("b"),
            order_fields("b", 2, 0, json!({"userEmail": "ana@example.com"})),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let aggregator = LiveAggregator::new(store.clone(), "orders", MergePolicy::default());
        let subscription = aggregator.observe(&keys(), move |orders| {
            let _ = tx.send(ids(orders).into_iter().map(String::from).collect::<Vec<_>>());
        });

        let first = rx.recv().await.unwrap();
        assert_eq!(first, vec!["b".to_string(), "a".to_string()]);

        // Linking b to the primary key makes it visible through both sources.
        let mut patch = Fields::new();
        patch.insert("userId".to_string(), json!("uid-1"));
        store
            .write_fields("orders", &RecordId::new("b"), patch)
            .await
            .unwrap();
        let after_link = rx.recv().await.unwrap();
        assert_eq!(after_link, vec!["b".to_string(), "a".to_string()]);

        subscription.shutdown().await;
        assert_eq!(store.live_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_source_failure_degrades_gracefully() {
        let store = Arc::new(MemoryStore::new());
        store.seed("orders", RecordId::new("a"), order_fields("a", 1, 0, json!({"userId": "uid-1"})));
        store.fail_subscriptions_on(
            fields::USER_EMAIL,
            Some(crate::error::StoreError::Subscription("index missing".to_string())),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let aggregator = LiveAggregator::new(store.clone(), "orders", MergePolicy::default());
        let _subscription = aggregator.observe(&keys(), move |orders| {
            let _ = tx.send(orders.len());
        });

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, 1);
    }

    #[tokio::test]
    async fn test_no_updates_after_cancel() {
        let store = Arc::new(MemoryStore::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let aggregator = LiveAggregator::new(store.clone(), "orders", MergePolicy::default());
        let subscription = aggregator.observe(&keys(), move |orders| {
            let _ = tx.send(orders.len());
        });
        assert_eq!(rx.recv().await.unwrap(), 0);

        assert!(subscription.cancel());
        assert!(!subscription.cancel());
        store.seed("orders", RecordId::new("a"), order_fields("a", 1, 0, json!({"userId": "uid-1"})));

        // The sender lives inside the detached callback, so the channel closes.
        assert_eq!(rx.recv().await, None);
    }
}
