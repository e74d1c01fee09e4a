//! Turning the session cart into an order.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::seq::IndexedRandom;
use thiserror::Error;
use tracing::{info, instrument, warn};

use comanda_core::{
    CartItem, IdentityKeys, Order, OrderLine, OrderNumber, OrderStatus, PaymentStatus, RecordId,
};

use crate::cart::CartStore;
use crate::error::{RecordError, StoreError, add_breadcrumb};
use crate::records;
use crate::store::RecordStore;

/// Order numbers avoid characters that are easy to misread (0/O, 1/I).
const ORDER_NUMBER_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const ORDER_NUMBER_SUFFIX_LEN: usize = 6;

/// Errors placing an order.
#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("No active session")]
    NoSession,

    #[error("Cart is empty")]
    EmptyCart,

    #[error("Cart does not belong to the signed-in customer")]
    NotCartOwner,

    #[error("Failed to save order: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Places orders for the active session.
#[derive(Clone)]
pub struct Checkout {
    store: Arc<dyn RecordStore>,
    collection: String,
}

impl Checkout {
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
        }
    }

    /// Write the contents of `cart` as a new pending order, then clear it.
    ///
    /// The order is written with a single whole-record write, so it either
    /// exists completely or not at all. The cart is cleared only once the
    /// write succeeded, and only if it did not change while the write was in
    /// flight; otherwise it is kept as it is.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError::EmptyCart`] for an empty cart,
    /// [`CheckoutError::NotCartOwner`] if the cart is bound to another
    /// account, or a store error if the order could not be written.
    #[instrument(skip_all, fields(user_id = %identity.primary))]
    pub async fn place_order(
        &self,
        identity: &IdentityKeys,
        cart: &CartStore,
    ) -> Result<Order, CheckoutError> {
        let view = cart.snapshot();
        if view.owner.as_ref() != Some(&identity.primary) {
            return Err(CheckoutError::NotCartOwner);
        }
        if view.lines.is_empty() {
            return Err(CheckoutError::EmptyCart);
        }

        let now = Utc::now();
        let order = Order {
            id: RecordId::generate(),
            order_number: order_number(now, &mut rand::rng()),
            user_id: Some(identity.primary.clone()),
            user_email: identity.secondary.clone(),
            items: view.lines.iter().map(order_line).collect(),
            status: OrderStatus::Pending,
            payment_status: PaymentStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        let fields = records::encode(&order)?;
        self.store
            .write_whole(&self.collection, &order.id, fields)
            .await?;
        if !cart.clear_at(view.revision) {
            warn!(
                order_number = %order.order_number,
                "Cart changed while the order was saved, keeping it"
            );
        }

        add_breadcrumb(
            "checkout",
            "Placed order",
            Some(&[("order_number", order.order_number.as_str())]),
        );
        info!(
            order_number = %order.order_number,
            total = %order.total(),
            items = order.item_count(),
            "Order placed"
        );
        Ok(order)
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Generate a customer-facing order number like `CMD-260301-K7QX2M`.
fn order_number(at: DateTime<Utc>, rng: &mut impl Rng) -> OrderNumber {
    let suffix: String = (0..ORDER_NUMBER_SUFFIX_LEN)
        .filter_map(|_| ORDER_NUMBER_ALPHABET.choose(&mut *rng))
        .map(|&byte| char::from(byte))
        .collect();
    OrderNumber::new(format!("CMD-{}-{suffix}", at.format("%y%m%d")))
}

/// Snapshot a cart line into an order line, folding supplements into the
/// name and the unit price.
fn order_line(item: &CartItem) -> OrderLine {
    let name = if item.supplements.is_empty() {
        item.name.clone()
    } else {
        let extras: Vec<&str> = item.supplements.iter().map(|s| s.name.as_str()).collect();
        format!("{} ({})", item.name, extras.join(", "))
    };
    OrderLine {
        menu_item_id: item.id.clone(),
        name,
        quantity: item.quantity,
        price: item.unit_total(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tokio::sync::{Notify, oneshot};

    use comanda_core::{Email, MenuItemId, Price, Supplement, SupplementId, UserId};

    use super::*;
    use crate::store::{Fields, MemoryStore, Snapshot, SnapshotStream};

    /// Holds the first order write until released.
    struct HeldOrderWrite {
        inner: Arc<MemoryStore>,
        release: Mutex<Option<oneshot::Receiver<()>>>,
        reached: Notify,
    }

    #[async_trait]
    impl RecordStore for HeldOrderWrite {
        async fn subscribe_equals(
            &self,
            collection: &str,
            field: &str,
            value: &str,
        ) -> Result<SnapshotStream, StoreError> {
            self.inner.subscribe_equals(collection, field, value).await
        }

        async fn read_equals(
            &self,
            collection: &str,
            field: &str,
            value: &str,
        ) -> Result<Snapshot, StoreError> {
            self.inner.read_equals(collection, field, value).await
        }

        async fn write_fields(
            &self,
            collection: &str,
            id: &RecordId,
            fields: Fields,
        ) -> Result<(), StoreError> {
            self.inner.write_fields(collection, id, fields).await
        }

        async fn write_whole(
            &self,
            collection: &str,
            id: &RecordId,
            fields: Fields,
        ) -> Result<(), StoreError> {
            let release = self.release.lock().unwrap().take();
            if let Some(release) = release {
                self.reached.notify_one();
                release.await.unwrap();
            }
            self.inner.write_whole(collection, id, fields).await
        }
    }

    fn identity() -> IdentityKeys {
        IdentityKeys::new(
            UserId::new("uid-1"),
            Some(Email::parse("ana@example.com").unwrap()),
        )
    }

    fn pizza() -> CartItem {
        CartItem::new(
            MenuItemId::new("margherita"),
            "Margherita",
            Price::from_cents(900).unwrap(),
        )
    }

    async fn started_cart(store: &Arc<MemoryStore>) -> CartStore {
        let cart = CartStore::new(store.clone(), "carts");
        cart.start(&UserId::new("uid-1")).await;
        let mut view = cart.subscribe();
        tokio::time::timeout(Duration::from_secs(2), view.wait_for(|v| v.loaded))
            .await
            .unwrap()
            .unwrap();
        cart
    }

    #[test]
    fn test_order_number_format() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();
        let number = order_number(at, &mut StdRng::seed_from_u64(7));
        let text = number.as_str();

        assert!(text.starts_with("CMD-260301-"));
        assert_eq!(text.len(), "CMD-260301-".len() + ORDER_NUMBER_SUFFIX_LEN);
        assert!(
            text.bytes()
                .skip("CMD-260301-".len())
                .all(|b| ORDER_NUMBER_ALPHABET.contains(&b))
        );
    }

    #[test]
    fn test_order_line_folds_supplements() {
        let mut item = pizza();
        item.supplements = vec![
            Supplement {
                id: SupplementId::new("cheese"),
                name: "Extra cheese".to_string(),
                price: Price::from_cents(150).unwrap(),
            },
            Supplement {
                id: SupplementId::new("basil"),
                name: "Basil".to_string(),
                price: Price::from_cents(50).unwrap(),
            },
        ];

        let line = order_line(&item);
        assert_eq!(line.name, "Margherita (Extra cheese, Basil)");
        assert_eq!(line.price, Price::from_cents(1100).unwrap());
    }

    #[tokio::test]
    async fn test_place_order_writes_and_clears_cart() {
        let store = Arc::new(MemoryStore::new());
        let cart = started_cart(&store).await;
        cart.add_item(pizza());
        cart.add_item(pizza());

        let checkout = Checkout::new(store.clone(), "orders");
        let order = checkout.place_order(&identity(), &cart).await.unwrap();

        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.payment_status, PaymentStatus::Pending);
        assert_eq!(order.total(), Price::from_cents(1800).unwrap());
        assert_eq!(store.len("orders"), 1);
        let stored = store.get("orders", &order.id).unwrap();
        assert_eq!(stored.get("userEmail").unwrap(), "ana@example.com");
        assert_eq!(cart.total_items(), 0);
    }

    #[tokio::test]
    async fn test_empty_cart_rejected() {
        let store = Arc::new(MemoryStore::new());
        let cart = started_cart(&store).await;

        let checkout = Checkout::new(store.clone(), "orders");
        let result = checkout.place_order(&identity(), &cart).await;
        assert!(matches!(result, Err(CheckoutError::EmptyCart)));
        assert!(store.is_empty("orders"));
    }

    #[tokio::test]
    async fn test_failed_write_keeps_cart() {
        let store = Arc::new(MemoryStore::new());
        let cart = started_cart(&store).await;
        cart.add_item(pizza());
        store.fail_writes(Some(StoreError::Rejected("permission denied".to_string())));

        let checkout = Checkout::new(store.clone(), "orders");
        let result = checkout.place_order(&identity(), &cart).await;
        assert!(matches!(result, Err(CheckoutError::Store(_))));
        assert_eq!(cart.total_items(), 1);
    }

    #[tokio::test]
    async fn test_cart_changed_during_write_is_kept() {
        let memory = Arc::new(MemoryStore::new());
        let cart = started_cart(&memory).await;
        cart.add_item(pizza());

        let (release, held) = oneshot::channel();
        let store = Arc::new(HeldOrderWrite {
            inner: memory.clone(),
            release: Mutex::new(Some(held)),
            reached: Notify::new(),
        });
        let checkout = Checkout::new(store.clone(), "orders");
        let placing = {
            let cart = cart.clone();
            tokio::spawn(async move { checkout.place_order(&identity(), &cart).await })
        };

        store.reached.notified().await;
        let soda = CartItem::new(MenuItemId::new("soda"), "Soda", Price::from_cents(250).unwrap());
        cart.add_item(soda);
        release.send(()).unwrap();

        let order = placing.await.unwrap().unwrap();
        assert_eq!(order.item_count(), 1);
        assert_eq!(memory.len("orders"), 1);
        assert_eq!(cart.total_items(), 2);
        assert!(cart.snapshot().lines.get(&MenuItemId::new("soda")).is_some());
    }

    #[tokio::test]
    async fn test_foreign_cart_rejected() {
        let store = Arc::new(MemoryStore::new());
        let cart = started_cart(&store).await;
        cart.add_item(pizza());

        let other = IdentityKeys::new(UserId::new("uid-2"), None);
        let checkout = Checkout::new(store, "orders");
        let result = checkout.place_order(&other, &cart).await;
        assert!(matches!(result, Err(CheckoutError::NotCartOwner)));
    }
}
