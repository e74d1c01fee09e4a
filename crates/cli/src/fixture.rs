//! YAML fixtures describing a simulated customer session.
//!
//! A fixture seeds the in-memory store with existing orders and carts, names
//! the signed-in session, lists the menu, and scripts the cart actions to
//! replay. See `crates/cli/fixtures/demo.yaml`.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use comanda_core::{CartItem, MenuItemId, Price, RecordId, Supplement, SupplementId};
use comanda_sync::{AuthSession, Fields, MemoryStore, SyncConfig};

/// Errors loading or resolving a fixture.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("Failed to read fixture: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid fixture: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Unknown menu item: {0}")]
    UnknownMenuItem(MenuItemId),

    #[error("Menu item {item} has no supplement {supplement}")]
    UnknownSupplement {
        item: MenuItemId,
        supplement: SupplementId,
    },
}

/// A complete simulation fixture.
#[derive(Debug, Deserialize)]
pub struct Fixture {
    pub session: AuthSession,
    #[serde(default)]
    pub menu: Vec<MenuEntry>,
    #[serde(default)]
    pub orders: Vec<SeedRecord>,
    #[serde(default)]
    pub carts: Vec<SeedRecord>,
    #[serde(default)]
    pub script: Vec<CartStep>,
}

/// A dish that can be added to the cart.
#[derive(Debug, Deserialize)]
pub struct MenuEntry {
    pub id: MenuItemId,
    pub name: String,
    pub price: Price,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub supplements: Vec<Supplement>,
}

/// A raw document to place in the store before the session starts.
#[derive(Debug, Deserialize)]
pub struct SeedRecord {
    pub id: RecordId,
    pub fields: Fields,
}

/// One scripted cart action.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CartStep {
    Add {
        item: MenuItemId,
    },
    RemoveOne {
        item: MenuItemId,
    },
    SetQuantity {
        item: MenuItemId,
        quantity: i64,
    },
    SetSupplements {
        item: MenuItemId,
        #[serde(default)]
        supplements: Vec<SupplementId>,
    },
    Clear,
    Checkout,
}

impl Fixture {
    /// Load a fixture from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub async fn load(path: &Path) -> Result<Self, FixtureError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Parse a fixture from YAML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid fixture.
    pub fn parse(content: &str) -> Result<Self, FixtureError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Seed `store` with the fixture's orders and carts.
    pub fn seed(&self, store: &MemoryStore, config: &SyncConfig) {
        for record in &self.orders {
            store.seed(&config.orders_collection, record.id.clone(), record.fields.clone());
        }
        for record in &self.carts {
            store.seed(&config.carts_collection, record.id.clone(), record.fields.clone());
        }
    }

    fn menu_entry(&self, id: &MenuItemId) -> Result<&MenuEntry, FixtureError> {
        self.menu
            .iter()
            .find(|entry| &entry.id == id)
            .ok_or_else(|| FixtureError::UnknownMenuItem(id.clone()))
    }

    /// A fresh cart line for menu item `id`.
    ///
    /// # Errors
    ///
    /// Returns [`FixtureError::UnknownMenuItem`] if the menu has no such item.
    pub fn cart_item(&self, id: &MenuItemId) -> Result<CartItem, FixtureError> {
        let entry = self.menu_entry(id)?;
        let item = CartItem::new(entry.id.clone(), entry.name.clone(), entry.price);
        Ok(match &entry.image {
            Some(image) => item.with_image(image.clone()),
            None => item,
        })
    }

    /// Resolve supplement ids against the menu entry for `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the item or any supplement is not on the menu.
    pub fn supplements(
        &self,
        id: &MenuItemId,
        chosen: &[SupplementId],
    ) -> Result<Vec<Supplement>, FixtureError> {
        let entry = self.menu_entry(id)?;
        chosen
            .iter()
            .map(|supplement| {
                entry
                    .supplements
                    .iter()
                    .find(|s| &s.id == supplement)
                    .cloned()
                    .ok_or_else(|| FixtureError::UnknownSupplement {
                        item: id.clone(),
                        supplement: supplement.clone(),
                    })
            })
            .collect()
    }
}
