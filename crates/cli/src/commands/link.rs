//! Run only the backfill for a fixture's session.
//!
//! # Usage
//!
//! ```bash
//! comanda link crates/cli/fixtures/demo.yaml
//! ```

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use comanda_sync::{BackfillLinker, MemoryStore, SessionMarkers, SyncConfig, identity};

use crate::fixture::Fixture;

/// Link the fixture's email-keyed orders to its account, twice.
///
/// The second run uses a fresh guard and must patch nothing, which shows the
/// backfill is idempotent on the data itself.
///
/// # Errors
///
/// Returns an error if the fixture is invalid, the session has no email, or
/// the backfill fails.
pub async fn run(path: &Path, config: &SyncConfig) -> Result<(), Box<dyn std::error::Error>> {
    let fixture = Fixture::load(path).await?;
    let store = Arc::new(MemoryStore::new());
    fixture.seed(&store, config);

    let keys = identity::resolve(&fixture.session)?;
    let email = keys
        .secondary
        .as_ref()
        .ok_or("Session has no email, nothing to link")?;

    let fresh_linker = || {
        BackfillLinker::new(
            store.clone(),
            Arc::new(SessionMarkers::new()),
            config.orders_collection.clone(),
        )
        .with_read_timeout(config.backfill_timeout)
    };

    let first = fresh_linker().link_once(&keys.primary, email).await?;
    info!(user_id = %keys.primary, patched = first, "Backfill run");

    let second = fresh_linker().link_once(&keys.primary, email).await?;
    info!(user_id = %keys.primary, patched = second, "Backfill re-run");

    Ok(())
}
