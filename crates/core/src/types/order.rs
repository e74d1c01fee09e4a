//! Order records as stored in the `orders` collection.

use std::num::NonZeroU32;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::email::Email;
use super::id::{MenuItemId, OrderNumber, RecordId, UserId};
use super::identity::IdentityKeys;
use super::price::Price;
use super::status::{OrderStatus, PaymentStatus};

/// One ordered menu item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub menu_item_id: MenuItemId,
    pub name: String,
    pub quantity: NonZeroU32,
    /// Unit price, supplements included.
    pub price: Price,
}

impl OrderLine {
    /// Unit price multiplied by quantity.
    #[must_use]
    pub fn line_total(&self) -> Price {
        self.price * self.quantity.get()
    }
}

/// A customer order.
///
/// `user_id` and `user_email` are the owner keys; either may be absent on
/// historical records. An order is visible to every session whose identity
/// keys match one of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: RecordId,
    pub order_number: OrderNumber,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default, deserialize_with = "lenient_email")]
    pub user_email: Option<Email>,
    pub items: Vec<OrderLine>,
    #[serde(default)]
    pub status: OrderStatus,
    #[serde(default)]
    pub payment_status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Sum of all line totals.
    #[must_use]
    pub fn total(&self) -> Price {
        self.items.iter().map(OrderLine::line_total).sum()
    }

    /// Total number of units across all lines.
    #[must_use]
    pub fn item_count(&self) -> u32 {
        self.items.iter().map(|line| line.quantity.get()).sum()
    }

    /// Whether a session with `identity` may see this order.
    #[must_use]
    pub fn is_visible_to(&self, identity: &IdentityKeys) -> bool {
        identity.owns(self.user_id.as_ref(), self.user_email.as_ref())
    }
}

/// Legacy records sometimes carry an empty or malformed email. That must not
/// hide the order from its primary owner, so such values read as absent.
fn lenient_email<'de, D>(deserializer: D) -> Result<Option<Email>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|s| Email::parse(&s).ok()))
}
