//! Type-safe price representation using decimal arithmetic.

use std::iter::Sum;
use std::ops::{Add, Mul};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Errors that can occur when constructing a [`Price`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PriceError {
    /// Prices are never negative.
    #[error("price cannot be negative: {0}")]
    Negative(Decimal),
}

/// A non-negative amount in the shop's single currency.
///
/// Arithmetic saturates at the largest representable amount instead of
/// panicking, since stored prices are not bounded.
///
/// Serialized as a decimal string (`"12.50"`) so no precision is lost across
/// the record store boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Price(Decimal);

impl Price {
    /// The zero price.
    pub const ZERO: Self = Self(Decimal::ZERO);

    /// Create a price, rejecting negative amounts.
    ///
    /// # Errors
    ///
    /// Returns [`PriceError::Negative`] if `amount` is below zero.
    pub fn new(amount: Decimal) -> Result<Self, PriceError> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(PriceError::Negative(amount));
        }
        Ok(Self(amount))
    }

    /// Create a price from an amount in cents.
    ///
    /// # Errors
    ///
    /// Returns [`PriceError::Negative`] if `cents` is below zero.
    pub fn from_cents(cents: i64) -> Result<Self, PriceError> {
        Self::new(Decimal::new(cents, 2))
    }

    /// Get the underlying decimal amount.
    #[must_use]
    pub const fn amount(&self) -> Decimal {
        self.0
    }

    /// Format for display (e.g., "$19.99").
    #[must_use]
    pub fn display(&self) -> String {
        format!("${:.2}", self.0)
    }
}

impl TryFrom<Decimal> for Price {
    type Error = PriceError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Price> for Decimal {
    fn from(price: Price) -> Self {
        price.0
    }
}

impl Add for Price {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Mul<u32> for Price {
    type Output = Self;

    fn mul(self, quantity: u32) -> Self {
        Self(self.0.saturating_mul(Decimal::from(quantity)))
    }
}

impl Sum for Price {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

impl std::fmt::Display for Price {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_negative() {
        assert!(matches!(
            Price::from_cents(-1),
            Err(PriceError::Negative(_))
        ));
        assert!(Price::from_cents(0).is_ok());
    }

    #[test]
    fn test_arithmetic() {
        let base = Price::from_cents(850).unwrap();
        let extra = Price::from_cents(150).unwrap();
        assert_eq!((base + extra) * 3, Price::from_cents(3000).unwrap());
    }

    #[test]
    fn test_arithmetic_saturates_on_overflow() {
        let huge: Price = serde_json::from_str("\"79228162514264337593543950335\"").unwrap();
        assert_eq!((huge * 2).amount(), Decimal::MAX);
        assert_eq!((huge + huge).amount(), Decimal::MAX);
        assert_eq!([huge, huge, huge].into_iter().sum::<Price>().amount(), Decimal::MAX);
    }

    #[test]
    fn test_sum_of_empty_is_zero() {
        let total: Price = Vec::<Price>::new().into_iter().sum();
        assert_eq!(total, Price::ZERO);
    }

    #[test]
    fn test_display() {
        let price = Price::from_cents(1999).unwrap();
        assert_eq!(price.display(), "$19.99");
        assert_eq!(price.to_string(), "19.99");
    }

    #[test]
    fn test_serializes_as_string() {
        let price = Price::from_cents(1250).unwrap();
        assert_eq!(serde_json::to_string(&price).unwrap(), "\"12.50\"");

        let parsed: Price = serde_json::from_str("\"12.50\"").unwrap();
        assert_eq!(parsed, price);

        let negative: Result<Price, _> = serde_json::from_str("\"-3.00\"");
        assert!(negative.is_err());
    }
}
