//! Core types for Comanda.
//!
//! This module provides type-safe wrappers for the ordering domain.

pub mod cart;
pub mod email;
pub mod id;
pub mod identity;
pub mod order;
pub mod price;
pub mod status;

pub use cart::{Cart, CartItem, CartLines, CartLinesError, Supplement};
pub use email::{Email, EmailError};
pub use id::*;
pub use identity::IdentityKeys;
pub use order::{Order, OrderLine};
pub use price::{Price, PriceError};
pub use status::*;
