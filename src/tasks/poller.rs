//! Query log polling loop

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::detector::Detector;
use crate::upstream::Upstream;

/// Background task that polls the upstream query log and feeds records to
/// the detector.
///
/// Polls once immediately, then on every tick. Fetch or per-record errors
/// are logged and the next tick retries. On shutdown the in-flight page is
/// finished before returning.
pub async fn poller_task(
    upstream: Arc<dyn Upstream>,
    detector: Arc<Detector>,
    interval: Duration,
    page_size: usize,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);

    info!(interval_secs = interval.as_secs(), page_size, "Poller started");

    loop {
        tokio::select! {
            _ = async {
                loop {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            } => {
                info!("Poller stopped");
                return;
            }
            _ = ticker.tick() => {
                poll_once(upstream.as_ref(), &detector, page_size).await;
            }
        }
    }
}

/// Fetch one page and run every record through the detector.
pub async fn poll_once(upstream: &dyn Upstream, detector: &Detector, page_size: usize) {
    let records = match upstream.fetch_page(page_size).await {
        Ok(records) => records,
        Err(e) => {
            error!(error = %e, "Failed to fetch query log");
            return;
        }
    };

    debug!(count = records.len(), "Fetched queries from upstream");

    let mut flagged = 0usize;
    for record in &records {
        match detector.process(record) {
            Ok(true) => flagged += 1,
            Ok(false) => {}
            Err(e) => {
                error!(domain = %record.domain, error = %e, "Failed to process query");
            }
        }
    }

    if flagged > 0 {
        match detector.baseline_totals() {
            Ok((clients, domains)) => info!(
                flagged,
                total = records.len(),
                baseline_clients = clients,
                baseline_domains = domains,
                "Detected new first-seen domains"
            ),
            Err(_) => info!(flagged, total = records.len(), "Detected new first-seen domains"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, Result};
    use crate::models::QueryRecord;
    use crate::store::Store;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Upstream returning a scripted sequence of pages.
    struct ScriptedUpstream {
        pages: Mutex<Vec<Result<Vec<QueryRecord>>>>,
    }

    impl ScriptedUpstream {
        fn new(pages: Vec<Result<Vec<QueryRecord>>>) -> Self {
            Self {
                pages: Mutex::new(pages),
            }
        }
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn probe(&self) -> Result<()> {
            Ok(())
        }

        async fn fetch_page(&self, _limit: usize) -> Result<Vec<QueryRecord>> {
            let mut pages = self.pages.lock().unwrap();
            if pages.is_empty() {
                return Ok(Vec::new());
            }
            pages.remove(0)
        }

        async fn install_block_rule(&self, _domain: &str) -> Result<()> {
            Ok(())
        }
    }

    fn record(domain: &str) -> QueryRecord {
        QueryRecord {
            client_id: "iot-plug".into(),
            client_name: "IoT Plug".into(),
            domain: domain.into(),
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            query_type: "A".into(),
            answer: None,
            reason: None,
        }
    }

    fn open_store() -> (TempDir, Arc<Store>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(dir.path().join("db").to_str().unwrap()).unwrap());
        (dir, store)
    }

    #[tokio::test]
    async fn overlapping_pages_flag_once() {
        let (_dir, store) = open_store();
        let detector = Detector::new(Arc::clone(&store), None);
        let upstream = ScriptedUpstream::new(vec![
            Ok(vec![record("telemetry.example.org")]),
            // The next page returns the same snapshot again
            Ok(vec![record("telemetry.example.org")]),
        ]);

        poll_once(&upstream, &detector, 100).await;
        poll_once(&upstream, &detector, 100).await;

        assert_eq!(store.stats().unwrap().total_queries, 1);
        assert!(store
            .baseline_contains("iot-plug", "telemetry.example.org")
            .unwrap());
    }

    #[tokio::test]
    async fn fetch_error_leaves_state_untouched() {
        let (_dir, store) = open_store();
        let detector = Detector::new(Arc::clone(&store), None);
        let upstream = ScriptedUpstream::new(vec![
            Err(AppError::UpstreamFailure("boom".into())),
            Ok(vec![record("a.example")]),
        ]);

        poll_once(&upstream, &detector, 100).await;
        assert_eq!(store.stats().unwrap().total_queries, 0);

        // The next poll succeeds normally
        poll_once(&upstream, &detector, 100).await;
        assert_eq!(store.stats().unwrap().total_queries, 1);
    }

    #[tokio::test]
    async fn malformed_records_are_skipped() {
        let (_dir, store) = open_store();
        let detector = Detector::new(Arc::clone(&store), None);
        let upstream = ScriptedUpstream::new(vec![Ok(vec![record(""), record("a.example")])]);

        poll_once(&upstream, &detector, 100).await;
        assert_eq!(store.stats().unwrap().total_queries, 1);
    }
}
