//! Comanda Core - Shared record types.
//!
//! This crate provides the types that cross the record store boundary:
//! - `comanda-sync` - Live order aggregation, backfill and optimistic cart engine
//! - `comanda-cli` - Fixture-driven simulation of a customer session
//!
//! # Architecture
//!
//! The core crate contains only types and pure cart arithmetic - no I/O, no
//! subscriptions, no runtime. This keeps it lightweight and allows it to be
//! used anywhere.
//!
//! # Modules
//!
//! - [`types`] - Newtype ids, prices, emails, statuses, orders and carts

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
