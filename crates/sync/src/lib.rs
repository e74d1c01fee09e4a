//! Comanda Sync - Live order and cart synchronization for a signed-in customer.
//!
//! # Architecture
//!
//! The engine sits between a storefront client and a remote document store
//! reached through the [`RecordStore`] trait:
//!
//! - [`LiveAggregator`] merges the orders keyed by the account id with the
//!   orders keyed by the account email into one live, deduplicated history
//! - [`BackfillLinker`] patches email-only orders with the account id, once
//!   per account
//! - [`CartStore`] keeps an optimistic cart and persists it in the background
//! - [`Checkout`] turns the cart into a pending order
//! - [`SessionManager`] owns all of the above for one identity at a time
//!
//! Live-subscription failures are logged and swallowed; one-shot operations
//! the customer triggers return errors.
//!
//! # Modules
//!
//! - [`store`] - Record store contract and the in-memory store
//! - [`records`] - Typed decoding at the store boundary
//! - [`config`] - Environment configuration

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod aggregator;
pub mod cart;
pub mod checkout;
pub mod config;
pub mod error;
pub mod identity;
pub mod linker;
pub mod records;
pub mod session;
pub mod store;
pub mod subscription;

pub use aggregator::{LiveAggregator, MergePolicy};
pub use cart::{CartStore, CartView};
pub use checkout::{Checkout, CheckoutError};
pub use config::{ConfigError, SyncConfig};
pub use error::{RecordError, StoreError};
pub use identity::{AuthSession, IdentityError};
pub use linker::{BackfillLinker, LinkError, LinkGuard, SessionMarkers};
pub use session::{BackfillStatus, SessionManager};
pub use store::{Document, Fields, MemoryStore, RecordStore, Snapshot, SnapshotStream};
pub use subscription::Subscription;
