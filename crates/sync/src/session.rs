//! Session lifecycle: one live order view, one cart and one backfill run per
//! signed-in identity.
//!
//! [`SessionManager::start`] tears the previous identity down completely
//! (order subscription, backfill, cart) before anything is opened for the new
//! one, so nothing keyed by an old identity can reach the new session's views.

use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use comanda_core::{Email, IdentityKeys, Order};

use crate::aggregator::LiveAggregator;
use crate::cart::CartStore;
use crate::checkout::{Checkout, CheckoutError};
use crate::config::SyncConfig;
use crate::error::{clear_sentry_user, set_sentry_user};
use crate::identity::{self, AuthSession, IdentityError};
use crate::linker::{BackfillLinker, LinkGuard, SessionMarkers};
use crate::store::RecordStore;
use crate::subscription::Subscription;

/// Progress of the session's backfill run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BackfillStatus {
    /// No session is active.
    #[default]
    Idle,
    Running,
    /// Finished; the number of orders patched.
    Linked(usize),
    /// The session has no email, so there is nothing to link.
    Skipped,
    Failed(String),
}

impl BackfillStatus {
    /// Whether the run has reached a final state for this session.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        matches!(self, Self::Linked(_) | Self::Skipped | Self::Failed(_))
    }
}

struct ActiveSession {
    identity: IdentityKeys,
    orders: Subscription,
    backfill: Option<Subscription>,
}

/// Owns everything tied to the signed-in identity.
pub struct SessionManager {
    aggregator: LiveAggregator,
    linker: BackfillLinker,
    cart: CartStore,
    checkout: Checkout,
    orders: Arc<watch::Sender<Option<Vec<Order>>>>,
    backfill: Arc<watch::Sender<BackfillStatus>>,
    active: Mutex<Option<ActiveSession>>,
}

impl SessionManager {
    /// Create a manager with in-process backfill markers.
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, config: &SyncConfig) -> Self {
        Self::with_guard(store, config, Arc::new(SessionMarkers::new()))
    }

    /// Create a manager with a custom backfill guard.
    #[must_use]
    pub fn with_guard(
        store: Arc<dyn RecordStore>,
        config: &SyncConfig,
        guard: Arc<dyn LinkGuard>,
    ) -> Self {
        let (orders, _) = watch::channel(None);
        let (backfill, _) = watch::channel(BackfillStatus::Idle);
        Self {
            aggregator: LiveAggregator::new(
                store.clone(),
                config.orders_collection.clone(),
                config.merge_policy,
            ),
            linker: BackfillLinker::new(store.clone(), guard, config.orders_collection.clone())
                .with_read_timeout(config.backfill_timeout),
            cart: CartStore::new(store.clone(), config.carts_collection.clone()),
            checkout: Checkout::new(store, config.orders_collection.clone()),
            orders: Arc::new(orders),
            backfill: Arc::new(backfill),
            active: Mutex::new(None),
        }
    }

    /// Start a session for `session`, replacing any active one.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] if the session has no usable account id. The
    /// previous session is left running in that case.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub async fn start(&self, session: &AuthSession) -> Result<IdentityKeys, IdentityError> {
        let keys = identity::resolve(session)?;
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            self.teardown(previous).await;
        }

        set_sentry_user(&keys.primary, keys.secondary.as_ref().map(Email::as_str));
        self.orders.send_replace(None);

        let view = self.orders.clone();
        let orders = self.aggregator.observe(&keys, move |orders| {
            view.send_replace(Some(orders.to_vec()));
        });
        self.cart.start(&keys.primary).await;
        let backfill = self.spawn_backfill(&keys);

        info!(
            user_id = %keys.primary,
            has_email = keys.secondary.is_some(),
            "Session started"
        );
        *active = Some(ActiveSession {
            identity: keys.clone(),
            orders,
            backfill,
        });
        Ok(keys)
    }

    /// End the active session, if any, and reset every view.
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        let Some(previous) = active.take() else {
            return;
        };
        let user_id = previous.identity.primary.clone();
        self.teardown(previous).await;
        clear_sentry_user();
        info!(%user_id, "Session stopped");
    }

    async fn teardown(&self, session: ActiveSession) {
        session.orders.shutdown().await;
        if let Some(backfill) = session.backfill {
            backfill.shutdown().await;
        }
        self.cart.stop().await;
        self.orders.send_replace(None);
        self.backfill.send_replace(BackfillStatus::Idle);
    }

    fn spawn_backfill(&self, keys: &IdentityKeys) -> Option<Subscription> {
        let Some(email) = keys.secondary.clone() else {
            self.backfill.send_replace(BackfillStatus::Skipped);
            return None;
        };

        self.backfill.send_replace(BackfillStatus::Running);
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let linker = self.linker.clone();
        let status = self.backfill.clone();
        let primary = keys.primary.clone();

        let task = tokio::spawn(
            async move {
                let outcome = tokio::select! {
                    () = cancelled.cancelled() => return,
                    outcome = linker.link_once(&primary, &email) => outcome,
                };
                match outcome {
                    Ok(patched) => {
                        status.send_replace(BackfillStatus::Linked(patched));
                    }
                    Err(e) => {
                        warn!(error = %e, "Backfill failed, will retry next session");
                        status.send_replace(BackfillStatus::Failed(e.to_string()));
                    }
                }
            }
            .instrument(info_span!("backfill", user_id = %keys.primary)),
        );
        Some(Subscription::new("backfill", token, task))
    }

    /// Identity keys of the active session.
    pub async fn identity(&self) -> Option<IdentityKeys> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|session| session.identity.clone())
    }

    /// Watch the merged order history. `None` until every source has
    /// reported for the active session.
    #[must_use]
    pub fn orders(&self) -> watch::Receiver<Option<Vec<Order>>> {
        self.orders.subscribe()
    }

    /// Watch the backfill progress.
    #[must_use]
    pub fn backfill_status(&self) -> watch::Receiver<BackfillStatus> {
        self.backfill.subscribe()
    }

    /// The session cart.
    #[must_use]
    pub const fn cart(&self) -> &CartStore {
        &self.cart
    }

    /// Place an order from the session cart.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError::NoSession`] without an active session, or any
    /// error from [`Checkout::place_order`].
    pub async fn checkout(&self) -> Result<Order, CheckoutError> {
        let identity = self.identity().await.ok_or(CheckoutError::NoSession)?;
        self.checkout.place_order(&identity, &self.cart).await
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("cart", &self.cart)
            .field("backfill", &*self.backfill.borrow())
            .finish_non_exhaustive()
    }
}
