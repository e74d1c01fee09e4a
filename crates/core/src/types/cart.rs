//! Cart records and line arithmetic.
//!
//! [`CartLines`] owns every quantity rule: a line is keyed by its menu item id,
//! quantities never drop below one, and any update that would reach zero
//! removes the line instead.

use std::num::NonZeroU32;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::id::{MenuItemId, SupplementId, UserId};
use super::price::Price;

/// An optional extra selected for a cart line (extra cheese, large size, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Supplement {
    pub id: SupplementId,
    pub name: String,
    pub price: Price,
}

/// One line in a cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    /// Menu item id, doubling as the line id.
    pub id: MenuItemId,
    pub name: String,
    /// Unit price before supplements.
    pub price: Price,
    pub quantity: NonZeroU32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supplements: Vec<Supplement>,
}

impl CartItem {
    /// A fresh line with quantity one and no supplements.
    #[must_use]
    pub fn new(id: MenuItemId, name: impl Into<String>, price: Price) -> Self {
        Self {
            id,
            name: name.into(),
            price,
            quantity: NonZeroU32::MIN,
            image: None,
            supplements: Vec::new(),
        }
    }

    /// Attach an image reference.
    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Unit price including all selected supplements.
    #[must_use]
    pub fn unit_total(&self) -> Price {
        self.price + self.supplements.iter().map(|s| s.price).sum::<Price>()
    }

    /// Unit total multiplied by quantity.
    #[must_use]
    pub fn line_total(&self) -> Price {
        self.unit_total() * self.quantity.get()
    }
}

/// Errors building [`CartLines`] from a raw list.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CartLinesError {
    #[error("duplicate cart line for menu item: {0}")]
    DuplicateLine(MenuItemId),
}

/// The ordered list of lines in a cart.
///
/// Every mutator returns whether the list changed so callers can skip
/// persistence for no-ops. Line ids are unique; a stored list that repeats
/// one fails to deserialize.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<CartItem>", into = "Vec<CartItem>")]
pub struct CartLines(Vec<CartItem>);

impl CartLines {
    /// An empty cart.
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Add one unit of `item`. An existing line with the same id is
    /// incremented by one; otherwise `item` is appended with quantity one.
    pub fn add_item(&mut self, item: CartItem) -> bool {
        if let Some(line) = self.line_mut(&item.id) {
            line.quantity = line.quantity.saturating_add(1);
        } else {
            self.0.push(CartItem {
                quantity: NonZeroU32::MIN,
                ..item
            });
        }
        true
    }

    /// Remove one unit of the line, dropping it when it reaches zero.
    pub fn remove_one_unit(&mut self, id: &MenuItemId) -> bool {
        let Some(index) = self.0.iter().position(|line| line.id == *id) else {
            return false;
        };
        let Some(line) = self.0.get_mut(index) else {
            return false;
        };
        match NonZeroU32::new(line.quantity.get() - 1) {
            Some(quantity) => line.quantity = quantity,
            None => {
                self.0.remove(index);
            }
        }
        true
    }

    /// Set the quantity of an existing line; `quantity <= 0` removes it.
    pub fn set_quantity(&mut self, id: &MenuItemId, quantity: i64) -> bool {
        let next = u32::try_from(quantity).ok().and_then(NonZeroU32::new);
        match next {
            None => {
                let before = self.0.len();
                self.0.retain(|line| line.id != *id);
                self.0.len() != before
            }
            Some(quantity) => match self.line_mut(id) {
                Some(line) if line.quantity != quantity => {
                    line.quantity = quantity;
                    true
                }
                _ => false,
            },
        }
    }

    /// Replace the supplements of an existing line without touching quantity.
    pub fn set_supplements(&mut self, id: &MenuItemId, supplements: Vec<Supplement>) -> bool {
        match self.line_mut(id) {
            Some(line) if line.supplements != supplements => {
                line.supplements = supplements;
                true
            }
            _ => false,
        }
    }

    /// Remove every line.
    pub fn clear(&mut self) -> bool {
        let changed = !self.0.is_empty();
        self.0.clear();
        changed
    }

    /// Look up a line by menu item id.
    #[must_use]
    pub fn get(&self, id: &MenuItemId) -> Option<&CartItem> {
        self.0.iter().find(|line| line.id == *id)
    }

    /// Number of units across all lines.
    #[must_use]
    pub fn total_items(&self) -> u32 {
        self.0.iter().map(|line| line.quantity.get()).sum()
    }

    /// Sum of all line totals, supplements included.
    #[must_use]
    pub fn total_price(&self) -> Price {
        self.0.iter().map(CartItem::line_total).sum()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[CartItem] {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CartItem> {
        self.0.iter()
    }

    fn line_mut(&mut self, id: &MenuItemId) -> Option<&mut CartItem> {
        self.0.iter_mut().find(|line| line.id == *id)
    }
}

impl TryFrom<Vec<CartItem>> for CartLines {
    type Error = CartLinesError;

    fn try_from(items: Vec<CartItem>) -> Result<Self, Self::Error> {
        let mut seen = std::collections::HashSet::with_capacity(items.len());
        for item in &items {
            if !seen.insert(&item.id) {
                return Err(CartLinesError::DuplicateLine(item.id.clone()));
            }
        }
        Ok(Self(items))
    }
}

impl From<CartLines> for Vec<CartItem> {
    fn from(lines: CartLines) -> Self {
        lines.0
    }
}

impl<'a> IntoIterator for &'a CartLines {
    type Item = &'a CartItem;
    type IntoIter = std::slice::Iter<'a, CartItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// A cart document in the `carts` collection, keyed by its owner.
///
/// `revision` increases with every local mutation that produced the document;
/// records written before revisions existed read as revision zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cart {
    pub user_id: UserId,
    #[serde(default)]
    pub items: CartLines,
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

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

    fn cheese() -> Supplement {
        Supplement {
            id: SupplementId::new("extra-cheese"),
            name: "Extra cheese".to_string(),
            price: Price::from_cents(150).unwrap(),
        }
    }

    #[test]
    fn test_add_item_increments_existing_line() {
        let mut lines = CartLines::new();
        lines.add_item(pizza());
        lines.add_item(soda());
        lines.add_item(pizza());

        assert_eq!(lines.len(), 2);
        assert_eq!(lines.get(&MenuItemId::new("margherita")).unwrap().quantity.get(), 2);
        assert_eq!(lines.total_items(), 3);
    }

    #[test]
    fn test_add_item_ignores_incoming_quantity() {
        let mut lines = CartLines::new();
        let mut item = pizza();
        item.quantity = NonZeroU32::new(5).unwrap();
        lines.add_item(item);
        assert_eq!(lines.total_items(), 1);
    }

    #[test]
    fn test_remove_one_unit_floors_at_removal() {
        let id = MenuItemId::new("margherita");
        let mut lines = CartLines::new();
        lines.add_item(pizza());

        assert!(lines.remove_one_unit(&id));
        assert!(lines.is_empty());
        assert!(!lines.remove_one_unit(&id));
        assert!(lines.is_empty());
    }

    #[test]
    fn test_set_quantity_non_positive_removes() {
        let id = MenuItemId::new("margherita");
        let mut lines = CartLines::new();
        lines.add_item(pizza());

        assert!(lines.set_quantity(&id, 4));
        assert_eq!(lines.total_items(), 4);
        assert!(!lines.set_quantity(&id, 4));
        assert!(lines.set_quantity(&id, -2));
        assert!(lines.is_empty());
    }

    #[test]
    fn test_set_quantity_on_unknown_line_is_noop() {
        let mut lines = CartLines::new();
        assert!(!lines.set_quantity(&MenuItemId::new("ghost"), 3));
        assert!(lines.is_empty());
    }

    #[test]
    fn test_set_supplements_keeps_quantity() {
        let id = MenuItemId::new("margherita");
        let mut lines = CartLines::new();
        lines.add_item(pizza());
        lines.add_item(pizza());

        assert!(lines.set_supplements(&id, vec![cheese()]));
        let line = lines.get(&id).unwrap();
        assert_eq!(line.quantity.get(), 2);
        assert_eq!(line.supplements.len(), 1);
    }

    #[test]
    fn test_totals_include_supplements() {
        let mut lines = CartLines::new();
        lines.add_item(pizza());
        lines.add_item(pizza());
        lines.add_item(soda());
        lines.set_supplements(&MenuItemId::new("margherita"), vec![cheese()]);

        // (9.00 + 1.50) * 2 + 2.50
        assert_eq!(lines.total_price(), Price::from_cents(2350).unwrap());
    }

    #[test]
    fn test_clear_reports_change() {
        let mut lines = CartLines::new();
        assert!(!lines.clear());
        lines.add_item(soda());
        assert!(lines.clear());
    }

    #[test]
    fn test_duplicate_line_ids_fail_to_deserialize() {
        let raw = serde_json::json!([
            {"id": "x", "name": "X", "price": "1.00", "quantity": 1},
            {"id": "x", "name": "X", "price": "1.00", "quantity": 5}
        ]);
        let err = serde_json::from_value::<CartLines>(raw).unwrap_err();
        assert!(err.to_string().contains("duplicate cart line"));

        let err = CartLines::try_from(vec![pizza(), soda(), pizza()]).unwrap_err();
        assert_eq!(err, CartLinesError::DuplicateLine(MenuItemId::new("margherita")));
    }

    #[test]
    fn test_remove_last_unit_keeps_other_lines() {
        let mut lines = CartLines::try_from(vec![pizza(), soda()]).unwrap();
        lines.set_quantity(&MenuItemId::new("soda"), 5);

        assert!(lines.remove_one_unit(&MenuItemId::new("margherita")));
        assert_eq!(lines.len(), 1);
        assert_eq!(lines.total_items(), 5);
    }

    #[test]
    fn test_cart_document_defaults() {
        let cart: Cart = serde_json::from_value(serde_json::json!({"userId": "uid-1"})).unwrap();
        assert!(cart.items.is_empty());
        assert_eq!(cart.revision, 0);
        assert!(cart.updated_at.is_none());
    }
}
