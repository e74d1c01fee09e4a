//! Replay a customer session against an in-memory store.
//!
//! # Usage
//!
//! ```bash
//! comanda simulate crates/cli/fixtures/demo.yaml
//! ```

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use comanda_core::{Order, RecordId};
use comanda_sync::{BackfillStatus, CartView, MemoryStore, SessionManager, SyncConfig};

use super::settle;
use crate::fixture::{CartStep, Fixture};

/// Run the simulation described by the fixture at `path`.
///
/// # Errors
///
/// Returns an error if the fixture is invalid, the session cannot start, a
/// scripted checkout fails, or a live view does not settle in time.
pub async fn run(path: &Path, config: &SyncConfig) -> Result<(), Box<dyn std::error::Error>> {
    let fixture = Fixture::load(path).await?;
    let store = Arc::new(MemoryStore::new());
    fixture.seed(&store, config);
    info!(
        path = %path.display(),
        orders = fixture.orders.len(),
        carts = fixture.carts.len(),
        "Seeded store from fixture"
    );

    let manager = SessionManager::new(store.clone(), config);
    let identity = manager.start(&fixture.session).await?;
    info!(
        user_id = %identity.primary,
        email = identity.secondary.as_ref().map_or("-", |e| e.as_str()),
        "Signed in"
    );

    match settle(manager.backfill_status(), BackfillStatus::is_settled).await? {
        BackfillStatus::Linked(patched) => info!(patched, "Linked guest orders to the account"),
        BackfillStatus::Failed(reason) => warn!(%reason, "Backfill failed"),
        status => info!(?status, "Backfill finished"),
    }
    settle(manager.cart().subscribe(), |view| view.loaded).await?;

    let history = settle(manager.orders(), Option::is_some).await?.unwrap_or_default();
    report_history("Order history at sign-in", &history);
    report_cart(&manager.cart().snapshot());

    let mut placed: Vec<RecordId> = Vec::new();
    for step in &fixture.script {
        if let Some(order) = apply(&manager, &fixture, step).await? {
            placed.push(order.id);
        }
    }
    report_cart(&manager.cart().snapshot());

    let history = settle(manager.orders(), |orders| {
        orders.as_ref().is_some_and(|orders| {
            placed
                .iter()
                .all(|id| orders.iter().any(|order| &order.id == id))
        })
    })
    .await?
    .unwrap_or_default();
    report_history("Order history after script", &history);

    manager.stop().await;
    info!(writes = store.write_count(), "Simulation complete");
    Ok(())
}

/// Apply one scripted step, returning the order if the step placed one.
async fn apply(
    manager: &SessionManager,
    fixture: &Fixture,
    step: &CartStep,
) -> Result<Option<Order>, Box<dyn std::error::Error>> {
    let cart = manager.cart();
    let changed = match step {
        CartStep::Add { item } => cart.add_item(fixture.cart_item(item)?),
        CartStep::RemoveOne { item } => cart.remove_one_unit(item),
        CartStep::SetQuantity { item, quantity } => cart.set_quantity(item, *quantity),
        CartStep::SetSupplements { item, supplements } => {
            cart.set_supplements(item, fixture.supplements(item, supplements)?)
        }
        CartStep::Clear => cart.clear(),
        CartStep::Checkout => {
            let order = manager.checkout().await?;
            info!(
                order_number = %order.order_number,
                total = %order.total().display(),
                "Checked out"
            );
            return Ok(Some(order));
        }
    };

    if changed {
        info!(?step, items = cart.total_items(), "Cart updated");
    } else {
        info!(?step, "Cart unchanged");
    }
    Ok(None)
}

// =============================================================================
// Helper Functions
// =============================================================================

fn report_history(title: &str, orders: &[Order]) {
    info!(count = orders.len(), "{title}");
    for order in orders {
        info!(
            order_number = %order.order_number,
            status = %order.status,
            payment = %order.payment_status,
            items = order.item_count(),
            total = %order.total().display(),
            created_at = %order.created_at,
            "  order"
        );
    }
}

fn report_cart(view: &CartView) {
    info!(
        lines = view.lines.len(),
        items = view.total_items(),
        total = %view.total_price().display(),
        revision = view.revision,
        "Cart"
    );
    for line in &view.lines {
        info!(
            item = %line.id,
            name = %line.name,
            quantity = line.quantity.get(),
            unit = %line.unit_total().display(),
            supplements = line.supplements.len(),
            "  line"
        );
    }
}
