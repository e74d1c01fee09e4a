//! Subcommand implementations.

pub mod link;
pub mod simulate;

use std::time::Duration;

use tokio::sync::watch;

/// How long to wait for a live view to reach an expected state.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait until the watched value satisfies `ready` and return a copy of it.
///
/// # Errors
///
/// Returns an error if the value does not settle within [`SETTLE_TIMEOUT`]
/// or the sender is dropped.
pub async fn settle<T: Clone>(
    mut rx: watch::Receiver<T>,
    ready: impl FnMut(&T) -> bool,
) -> Result<T, Box<dyn std::error::Error>> {
    let value = tokio::time::timeout(SETTLE_TIMEOUT, rx.wait_for(ready))
        .await??
        .clone();
    Ok(value)
}
