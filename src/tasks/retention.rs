//! Retention task - prunes old processed-query marks

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info};

use crate::store::Store;

/// Background task that garbage-collects processed-query marks.
///
/// Correctness does not depend on it; it bounds growth of the dedup
/// partition. Runs every 6 hours and deletes marks older than the
/// configured retention.
pub async fn retention_task(
    store: Arc<Store>,
    retention: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // Wait 1 minute before starting to allow the system to stabilize
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(60)) => {}
        _ = shutdown_rx.wait_for(|stopped| *stopped) => return,
    }

    let mut interval = tokio::time::interval(Duration::from_secs(6 * 60 * 60));

    info!(
        retention_days = retention.as_secs() / 86_400,
        "Retention task started (6h interval)"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.wait_for(|stopped| *stopped) => return,
            _ = interval.tick() => {
                let cutoff = Utc::now()
                    - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::days(7));

                match store.clean_processed_before(cutoff) {
                    Ok(0) => info!("No old processed-query marks to prune"),
                    Ok(removed) => info!(removed, "Pruned old processed-query marks"),
                    Err(e) => error!(error = %e, "Failed to prune processed-query marks"),
                }
            }
        }
    }
}
