//! Optimistic cart synchronized with the remote cart document.
//!
//! Mutations apply to the in-memory cart immediately and are published to
//! observers before anything touches the network. Each mutation then queues a
//! full replace of the owner's cart document; a single writer task persists
//! the queue in mutation order. A write that fails is logged and the local
//! state stands.
//!
//! A live subscription on the owner's cart feeds remote changes back in.
//! Every local mutation bumps the cart `revision`, which is written along with
//! the lines. A remote snapshot older than the local revision is an echo of a
//! write that has since been superseded and is ignored.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, trace, warn};

use comanda_core::{Cart, CartItem, CartLines, MenuItemId, Price, RecordId, Supplement, UserId};

use crate::records::{self, fields};
use crate::store::{Document, RecordStore};
use crate::subscription::Subscription;

/// Read-only view of the cart published to observers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CartView {
    /// Owner of the cart; `None` when no session is active.
    pub owner: Option<UserId>,
    pub lines: CartLines,
    pub revision: u64,
    /// Whether the remote cart has been received since the session started.
    pub loaded: bool,
}

impl CartView {
    /// Total units across all lines.
    #[must_use]
    pub fn total_items(&self) -> u32 {
        self.lines.total_items()
    }

    /// Total price, supplements included.
    #[must_use]
    pub fn total_price(&self) -> Price {
        self.lines.total_price()
    }
}

#[derive(Default)]
struct CartState {
    owner: Option<UserId>,
    lines: CartLines,
    revision: u64,
    loaded: bool,
    epoch: u64,
    writes: Option<mpsc::UnboundedSender<Cart>>,
    writer: Option<JoinHandle<()>>,
    follow: Option<Subscription>,
}

impl CartState {
    fn view(&self) -> CartView {
        CartView {
            owner: self.owner.clone(),
            lines: self.lines.clone(),
            revision: self.revision,
            loaded: self.loaded,
        }
    }

    /// Queue a full write of the current lines.
    fn persist(&self) {
        let (Some(owner), Some(writes)) = (&self.owner, &self.writes) else {
            return;
        };
        let cart = Cart {
            user_id: owner.clone(),
            items: self.lines.clone(),
            revision: self.revision,
            updated_at: Some(Utc::now()),
        };
        if writes.send(cart).is_err() {
            warn!(user_id = %owner, "Cart writer is gone, dropping write");
        }
    }
}

struct CartInner {
    store: Arc<dyn RecordStore>,
    collection: String,
    state: Mutex<CartState>,
    view: watch::Sender<CartView>,
}

impl CartInner {
    fn lock(&self) -> MutexGuard<'_, CartState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &CartState) {
        self.view.send_replace(state.view());
    }

    /// Fold a remote snapshot of the cart into local state.
    ///
    /// `remote` is `None` when the owner has no cart document yet, which reads
    /// as an empty cart at revision zero.
    fn apply_remote(&self, epoch: u64, remote: Option<Cart>) {
        let mut state = self.lock();
        if state.epoch != epoch {
            trace!("Dropping cart snapshot from a previous session");
            return;
        }

        let (lines, revision) = remote.map_or_else(
            || (CartLines::new(), 0),
            |cart| (cart.items, cart.revision),
        );

        if !state.loaded {
            state.loaded = true;
            if state.revision > 0 {
                // Mutations made before the first snapshot win over the
                // stored cart and are written again on top of it.
                state.revision = state.revision.max(revision) + 1;
                debug!(revision = state.revision, "Rebasing early cart mutations");
                state.persist();
                self.publish(&state);
                return;
            }
        }

        if revision < state.revision {
            debug!(
                remote = revision,
                local = state.revision,
                "Ignoring stale cart echo"
            );
            return;
        }

        state.lines = lines;
        state.revision = revision;
        self.publish(&state);
    }
}

/// Optimistic cart for the active session.
///
/// Clones share the same cart.
#[derive(Clone)]
pub struct CartStore {
    inner: Arc<CartInner>,
}

impl CartStore {
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, collection: impl Into<String>) -> Self {
        let (view, _) = watch::channel(CartView::default());
        Self {
            inner: Arc::new(CartInner {
                store,
                collection: collection.into(),
                state: Mutex::new(CartState::default()),
                view,
            }),
        }
    }

    /// Bind the cart to `owner` and start following its remote document.
    ///
    /// Any previous owner is stopped first.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub async fn start(&self, owner: &UserId) {
        self.stop().await;

        let (writes, queue) = mpsc::unbounded_channel();
        let writer = tokio::spawn(
            write_loop(self.inner.store.clone(), self.inner.collection.clone(), queue)
                .instrument(info_span!("cart_writer", user_id = %owner)),
        );

        let token = CancellationToken::new();
        let epoch = {
            let mut state = self.inner.lock();
            state.epoch += 1;
            state.owner = Some(owner.clone());
            state.lines = CartLines::new();
            state.revision = 0;
            state.loaded = false;
            state.writes = Some(writes);
            state.writer = Some(writer);
            self.inner.publish(&state);
            state.epoch
        };

        let task = tokio::spawn(
            follow(
                Arc::downgrade(&self.inner),
                owner.clone(),
                epoch,
                token.clone(),
            )
            .instrument(info_span!("cart_follow", user_id = %owner)),
        );
        self.inner.lock().follow = Some(Subscription::new("cart", token, task));
        debug!(user_id = %owner, "Cart started");
    }

    /// Detach from the current owner.
    ///
    /// The view empties immediately. Writes already queued are still
    /// persisted; this waits until they have been.
    pub async fn stop(&self) {
        let (follow, writer) = {
            let mut state = self.inner.lock();
            if state.owner.is_none() && state.writer.is_none() {
                return;
            }
            state.epoch += 1;
            state.owner = None;
            state.lines = CartLines::new();
            state.revision = 0;
            state.loaded = false;
            state.writes = None;
            self.inner.publish(&state);
            (state.follow.take(), state.writer.take())
        };

        if let Some(follow) = follow {
            follow.shutdown().await;
        }
        if let Some(writer) = writer
            && let Err(e) = writer.await
        {
            error!(error = %e, "Cart writer task failed");
        }
        debug!("Cart stopped");
    }

    /// Add one unit of `item`, creating the line if needed.
    pub fn add_item(&self, item: CartItem) -> bool {
        self.mutate("add_item", |lines| lines.add_item(item))
    }

    /// Remove one unit of `id`; the line disappears at zero.
    pub fn remove_one_unit(&self, id: &MenuItemId) -> bool {
        self.mutate("remove_one_unit", |lines| lines.remove_one_unit(id))
    }

    /// Set the quantity of `id`; zero or less removes the line.
    pub fn set_quantity(&self, id: &MenuItemId, quantity: i64) -> bool {
        self.mutate("set_quantity", |lines| lines.set_quantity(id, quantity))
    }

    /// Replace the supplements of `id`, keeping its quantity.
    pub fn set_supplements(&self, id: &MenuItemId, supplements: Vec<Supplement>) -> bool {
        self.mutate("set_supplements", |lines| {
            lines.set_supplements(id, supplements)
        })
    }

    /// Empty the cart. The remote document is kept with no lines.
    pub fn clear(&self) -> bool {
        self.mutate("clear", CartLines::clear)
    }

    /// Empty the cart only if it is still at `revision`.
    ///
    /// Returns `false` and leaves the cart alone if anything changed it
    /// since `revision` was observed.
    pub fn clear_at(&self, revision: u64) -> bool {
        self.mutate_at("clear_at", Some(revision), CartLines::clear)
    }

    fn mutate(&self, action: &'static str, change: impl FnOnce(&mut CartLines) -> bool) -> bool {
        self.mutate_at(action, None, change)
    }

    /// Apply `change` and, if it changed anything, publish and persist.
    ///
    /// Without an owner, or when the revision differs from `expected`,
    /// nothing happens.
    fn mutate_at(
        &self,
        action: &'static str,
        expected: Option<u64>,
        change: impl FnOnce(&mut CartLines) -> bool,
    ) -> bool {
        let mut state = self.inner.lock();
        if state.owner.is_none() {
            trace!(action, "Ignoring cart mutation without a session");
            return false;
        }
        if let Some(expected) = expected
            && expected != state.revision
        {
            debug!(action, expected, revision = state.revision, "Cart moved on, skipping");
            return false;
        }
        if !change(&mut state.lines) {
            return false;
        }
        state.revision += 1;
        trace!(action, revision = state.revision, "Cart mutated");
        self.inner.publish(&state);
        state.persist();
        true
    }

    /// Watch the cart view.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CartView> {
        self.inner.view.subscribe()
    }

    /// The current cart view.
    #[must_use]
    pub fn snapshot(&self) -> CartView {
        self.inner.view.borrow().clone()
    }

    #[must_use]
    pub fn total_items(&self) -> u32 {
        self.inner.view.borrow().total_items()
    }

    #[must_use]
    pub fn total_price(&self) -> Price {
        self.inner.view.borrow().total_price()
    }
}

impl std::fmt::Debug for CartStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CartStore")
            .field("collection", &self.inner.collection)
            .field("view", &*self.inner.view.borrow())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Background Tasks
// =============================================================================

/// Persist queued carts one at a time until the queue's sender is dropped.
async fn write_loop(
    store: Arc<dyn RecordStore>,
    collection: String,
    mut queue: mpsc::UnboundedReceiver<Cart>,
) {
    while let Some(cart) = queue.recv().await {
        let id = RecordId::from(&cart.user_id);
        let fields = match records::encode(&cart) {
            Ok(fields) => fields,
            Err(e) => {
                error!(revision = cart.revision, error = %e, "Failed to encode cart");
                continue;
            }
        };
        match store.write_whole(&collection, &id, fields).await {
            Ok(()) => trace!(revision = cart.revision, "Cart persisted"),
            Err(e) => error!(revision = cart.revision, error = %e, "Failed to persist cart"),
        }
    }
}

/// Follow the owner's cart document until cancelled.
async fn follow(inner: Weak<CartInner>, owner: UserId, epoch: u64, token: CancellationToken) {
    let (store, collection) = match inner.upgrade() {
        Some(inner) => (inner.store.clone(), inner.collection.clone()),
        None => return,
    };

    let opening = store.subscribe_equals(&collection, fields::USER_ID, owner.as_str());
    let mut stream = tokio::select! {
        () = token.cancelled() => return,
        opened = opening => match opened {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Cart subscription failed to open, local changes only");
                return;
            }
        },
    };

    let cart_id = RecordId::from(&owner);
    loop {
        let next = tokio::select! {
            () = token.cancelled() => break,
            next = stream.next() => next,
        };
        let documents = match next {
            Some(Ok(documents)) => documents,
            Some(Err(e)) => {
                warn!(error = %e, "Cart subscription broke, local changes only");
                break;
            }
            None => break,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.apply_remote(epoch, decode_cart(&documents, &cart_id));
    }
}

fn decode_cart(documents: &[Document], cart_id: &RecordId) -> Option<Cart> {
    let document = documents.iter().find(|d| &d.id == cart_id)?;
    match records::decode(document) {
        Ok(cart) => Some(cart),
        Err(e) => {
            warn!(error = %e, "Quarantined malformed cart, reading as empty");
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::error::StoreError;
    use crate::store::MemoryStore;

    fn pizza() -> CartItem {
        CartItem::new(
            MenuItemId::new("margherita"),
            "Margherita",
            Price::from_cents(900).unwrap(),
        )
    }

    fn soda() -> CartItem {
        CartItem::new(MenuItemId::new("soda"), "Soda", Price::from_cents(250).unwrap())
    }

    fn remote(revision: u64, items: Vec<CartItem>) -> Cart {
        Cart {
            user_id: UserId::new("uid-1"),
            items: CartLines::try_from(items).unwrap(),
            revision,
            updated_at: None,
        }
    }

    async fn until_loaded(cart: &CartStore) {
        let mut view = cart.subscribe();
        tokio::time::timeout(Duration::from_secs(2), view.wait_for(|v| v.loaded))
            .await
            .unwrap()
            .unwrap();
    }

    async fn started(store: &Arc<MemoryStore>) -> CartStore {
        let cart = CartStore::new(store.clone(), "carts");
        cart.start(&UserId::new("uid-1")).await;
        until_loaded(&cart).await;
        cart
    }

    #[tokio::test]
    async fn test_without_owner_mutations_are_noops() {
        let store = Arc::new(MemoryStore::new());
        let cart = CartStore::new(store.clone(), "carts");

        assert!(!cart.add_item(pizza()));
        assert!(!cart.clear());
        assert_eq!(cart.total_items(), 0);
        assert!(cart.snapshot().owner.is_none());
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_quantity_floor_and_totals() {
        let store = Arc::new(MemoryStore::new());
        let cart = started(&store).await;

        assert!(cart.add_item(pizza()));
        assert!(cart.add_item(pizza()));
        assert!(cart.add_item(soda()));
        assert_eq!(cart.total_items(), 3);
        assert_eq!(cart.total_price(), Price::from_cents(2050).unwrap());

        assert!(cart.remove_one_unit(&MenuItemId::new("soda")));
        assert!(!cart.remove_one_unit(&MenuItemId::new("soda")));
        assert!(!cart.set_quantity(&MenuItemId::new("unknown"), 4));
        assert!(cart.set_quantity(&MenuItemId::new("margherita"), 0));
        assert!(cart.snapshot().lines.is_empty());
    }

    #[tokio::test]
    async fn test_writes_full_cart_in_order() {
        let store = Arc::new(MemoryStore::new());
        let cart = started(&store).await;

        cart.add_item(pizza());
        cart.add_item(soda());
        cart.set_quantity(&MenuItemId::new("soda"), 3);
        cart.stop().await;

        let stored = store.get("carts", &RecordId::new("uid-1")).unwrap();
        assert_eq!(stored.get("revision"), Some(&json!(3)));
        assert_eq!(stored.get("userId"), Some(&json!("uid-1")));
        assert_eq!(stored.get("items").unwrap().as_array().unwrap().len(), 2);
        assert_eq!(store.write_count(), 3);
    }

    #[tokio::test]
    async fn test_clear_keeps_the_document() {
        let store = Arc::new(MemoryStore::new());
        let cart = started(&store).await;

        cart.add_item(pizza());
        assert!(cart.clear());
        assert!(!cart.clear());
        cart.stop().await;

        let stored = store.get("carts", &RecordId::new("uid-1")).unwrap();
        assert_eq!(stored.get("items"), Some(&json!([])));
    }

    #[tokio::test]
    async fn test_clear_at_requires_unchanged_revision() {
        let store = Arc::new(MemoryStore::new());
        let cart = started(&store).await;

        cart.add_item(pizza());
        let seen = cart.snapshot().revision;
        cart.add_item(soda());

        assert!(!cart.clear_at(seen));
        assert_eq!(cart.total_items(), 2);
        assert!(cart.clear_at(seen + 1));
        assert!(cart.snapshot().lines.is_empty());
    }

    #[tokio::test]
    async fn test_stale_echo_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let cart = started(&store).await;
        let epoch = cart.inner.lock().epoch;

        cart.add_item(pizza());
        cart.add_item(pizza());
        cart.inner.apply_remote(epoch, Some(remote(1, vec![pizza()])));
        assert_eq!(cart.total_items(), 2);
        assert_eq!(cart.snapshot().revision, 2);

        cart.inner.apply_remote(epoch, Some(remote(5, vec![soda()])));
        let view = cart.snapshot();
        assert_eq!(view.revision, 5);
        assert!(view.lines.get(&MenuItemId::new("soda")).is_some());

        // The next local mutation continues from the adopted revision.
        cart.add_item(pizza());
        assert_eq!(cart.snapshot().revision, 6);
    }

    #[tokio::test]
    async fn test_snapshot_from_previous_session_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let cart = started(&store).await;
        let old_epoch = cart.inner.lock().epoch;

        cart.start(&UserId::new("uid-1")).await;
        cart.inner.apply_remote(old_epoch, Some(remote(9, vec![soda()])));
        assert_ne!(cart.snapshot().revision, 9);
    }

    #[tokio::test]
    async fn test_mutations_before_load_survive_first_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let cart = CartStore::new(store.clone(), "carts");
        cart.inner.lock().owner = Some(UserId::new("uid-1"));
        let epoch = cart.inner.lock().epoch;

        cart.add_item(soda());
        cart.inner.apply_remote(epoch, Some(remote(4, vec![pizza()])));

        let view = cart.snapshot();
        assert!(view.loaded);
        assert_eq!(view.revision, 5);
        assert!(view.lines.get(&MenuItemId::new("soda")).is_some());
        assert!(view.lines.get(&MenuItemId::new("margherita")).is_none());
    }

    #[tokio::test]
    async fn test_remote_change_is_adopted() {
        let store = Arc::new(MemoryStore::new());
        let cart = started(&store).await;
        let mut view = cart.subscribe();

        let fields = records::encode(&remote(3, vec![soda()])).unwrap();
        store.seed("carts", RecordId::new("uid-1"), fields);

        let adopted = tokio::time::timeout(Duration::from_secs(2), view.wait_for(|v| v.revision == 3))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert_eq!(adopted.total_items(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_is_not_rolled_back() {
        let store = Arc::new(MemoryStore::new());
        let cart = started(&store).await;
        store.fail_writes(Some(StoreError::Unavailable("offline".to_string())));

        assert!(cart.add_item(pizza()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(cart.total_items(), 1);
        assert!(store.get("carts", &RecordId::new("uid-1")).is_none());
    }

    #[tokio::test]
    async fn test_stop_empties_view_and_ends_subscription() {
        let store = Arc::new(MemoryStore::new());
        let cart = started(&store).await;
        cart.add_item(pizza());

        cart.stop().await;
        assert_eq!(cart.snapshot(), CartView::default());
        assert!(!cart.add_item(pizza()));
        assert_eq!(store.live_subscriptions(), 0);
    }
}
