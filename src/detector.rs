//! First-seen detection against per-client baselines

use std::sync::Arc;

use tracing::{info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::models::QueryRecord;
use crate::store::Store;

/// Decides whether a query record is a first-seen (client, domain) pair.
///
/// First-seen records are submitted for classification and the baseline is
/// extended immediately afterwards, so the same pair is submitted at most
/// once per process lifetime in the steady state.
pub struct Detector {
    store: Arc<Store>,
    dispatcher: Option<Arc<Dispatcher>>,
}

impl Detector {
    pub fn new(store: Arc<Store>, dispatcher: Option<Arc<Dispatcher>>) -> Self {
        Self { store, dispatcher }
    }

    /// Process one record. Returns whether it was flagged first-seen.
    pub fn process(&self, record: &QueryRecord) -> Result<bool> {
        if record.domain.is_empty() {
            return Ok(false);
        }

        let fingerprint = record.fingerprint();
        if self.store.query_seen(&fingerprint)? {
            return Ok(false);
        }
        self.store.query_mark(&fingerprint)?;

        if self.store.baseline_contains(&record.client_id, &record.domain)? {
            return Ok(false);
        }

        info!(
            client = %record.client_name,
            client_id = %record.client_id,
            domain = %record.domain,
            query_type = %record.query_type,
            "First-seen domain"
        );

        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.submit(record.clone());
        } else {
            warn!(domain = %record.domain, "Classification disabled, skipping analysis");
        }

        // Extend the baseline after submission so the pair is not flagged
        // again by later polls; a crash in between re-submits once, which
        // the anomaly upsert absorbs.
        self.store
            .baseline_add(&record.client_id, &record.client_name, &record.domain)?;

        Ok(true)
    }

    /// (clients, total domains) across all baselines, for poll summaries.
    pub fn baseline_totals(&self) -> Result<(usize, usize)> {
        let baselines = self.store.baselines_all()?;
        let domains = baselines.iter().map(|b| b.domains.len()).sum();
        Ok((baselines.len(), domains))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn open_store() -> (TempDir, Arc<Store>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(dir.path().join("db").to_str().unwrap()).unwrap());
        (dir, store)
    }

    fn record(domain: &str, second: u32) -> QueryRecord {
        QueryRecord {
            client_id: "iot-plug".into(),
            client_name: "IoT Plug".into(),
            domain: domain.into(),
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, second).unwrap(),
            query_type: "A".into(),
            answer: None,
            reason: None,
        }
    }

    #[test]
    fn empty_domain_is_dropped() {
        let (_dir, store) = open_store();
        let detector = Detector::new(Arc::clone(&store), None);

        assert!(!detector.process(&record("", 0)).unwrap());
        assert_eq!(store.stats().unwrap().total_queries, 0);
    }

    #[test]
    fn first_seen_extends_baseline() {
        let (_dir, store) = open_store();
        let detector = Detector::new(Arc::clone(&store), None);

        assert!(detector.process(&record("telemetry.example.org", 0)).unwrap());
        assert!(store
            .baseline_contains("iot-plug", "telemetry.example.org")
            .unwrap());
    }

    #[test]
    fn identical_record_across_polls_flags_once() {
        let (_dir, store) = open_store();
        let detector = Detector::new(Arc::clone(&store), None);

        let rec = record("telemetry.example.org", 0);
        assert!(detector.process(&rec).unwrap());
        // Same record in the next page: fingerprint dedup drops it
        assert!(!detector.process(&rec).unwrap());
        assert_eq!(store.stats().unwrap().total_queries, 1);
    }

    #[test]
    fn baselined_domain_is_not_reflagged() {
        let (_dir, store) = open_store();
        let detector = Detector::new(Arc::clone(&store), None);

        assert!(detector.process(&record("telemetry.example.org", 0)).unwrap());
        // New fingerprint (later timestamp), same pair: baseline wins
        assert!(!detector.process(&record("telemetry.example.org", 5)).unwrap());
        // But the new fingerprint is still marked processed
        assert_eq!(store.stats().unwrap().total_queries, 2);
    }

    #[test]
    fn persisted_baseline_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        let path = path.to_str().unwrap();

        {
            let store = Arc::new(Store::open(path).unwrap());
            let detector = Detector::new(Arc::clone(&store), None);
            assert!(detector.process(&record("telemetry.example.org", 0)).unwrap());
        }

        // Restarted process: the pair is known even with a fresh fingerprint
        let store = Arc::new(Store::open(path).unwrap());
        let detector = Detector::new(Arc::clone(&store), None);
        assert!(!detector.process(&record("telemetry.example.org", 9)).unwrap());
    }

    #[test]
    fn distinct_clients_have_independent_baselines() {
        let (_dir, store) = open_store();
        let detector = Detector::new(Arc::clone(&store), None);

        assert!(detector.process(&record("a.example", 0)).unwrap());

        let mut other = record("a.example", 0);
        other.client_id = "laptop".into();
        other.client_name = "Laptop".into();
        assert!(detector.process(&other).unwrap());
    }
}
