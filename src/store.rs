//! Persistent storage layer backed by an embedded sled database
//!
//! One tree per partition: baselines, processed queries, WHOIS cache,
//! anomalies, analyses. Values are JSON. The database directory is locked
//! exclusively, so a second concurrent open fails.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sled::transaction::ConflictableTransactionError;
use tracing::info;

use crate::error::{AppError, Result};
use crate::models::{Analysis, Anomaly, AnomalyStatus, Baseline, Classification, WhoisRecord};

const BASELINES: &str = "baselines";
const PROCESSED_QUERIES: &str = "processed_queries";
const WHOIS_CACHE: &str = "whois_cache";
const ANOMALIES: &str = "anomalies";
const ANALYSES: &str = "analyses";

/// Counts of stored entities, assembled for the stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub unique_clients: usize,
    pub total_queries: usize,
    pub total_anomalies: usize,
    pub pending_anomalies: usize,
    pub approved_anomalies: usize,
    pub blocked_anomalies: usize,
    pub malicious_count: usize,
    pub suspicious_count: usize,
    pub total_analyses: usize,
}

/// Handle to the on-disk state. All mutations go through these operations;
/// each is individually atomic.
pub struct Store {
    db: sled::Db,
    baselines: sled::Tree,
    processed: sled::Tree,
    whois: sled::Tree,
    anomalies: sled::Tree,
    analyses: sled::Tree,
    analysis_seq: AtomicU64,
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: &str) -> Result<Self> {
        let db = sled::open(path)?;

        let store = Self {
            baselines: db.open_tree(BASELINES)?,
            processed: db.open_tree(PROCESSED_QUERIES)?,
            whois: db.open_tree(WHOIS_CACHE)?,
            anomalies: db.open_tree(ANOMALIES)?,
            analyses: db.open_tree(ANALYSES)?,
            analysis_seq: AtomicU64::new(0),
            db,
        };

        info!(path = %path, "Storage opened");
        Ok(store)
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    // =========================================================================
    // BASELINES
    // =========================================================================

    /// Whether `domain` is already part of the client's baseline.
    pub fn baseline_contains(&self, client_id: &str, domain: &str) -> Result<bool> {
        match self.baselines.get(client_id.as_bytes())? {
            Some(raw) => {
                let baseline: Baseline = serde_json::from_slice(&raw)?;
                Ok(baseline.domains.iter().any(|d| d == domain))
            }
            None => Ok(false),
        }
    }

    /// Add a domain to a client's baseline, creating the baseline if absent.
    /// Adding a domain that is already present is a no-op.
    pub fn baseline_add(&self, client_id: &str, client_name: &str, domain: &str) -> Result<()> {
        self.baselines
            .transaction(|tx| {
                let mut baseline = match tx.get(client_id.as_bytes())? {
                    Some(raw) => serde_json::from_slice::<Baseline>(&raw)
                        .map_err(|e| ConflictableTransactionError::Abort(AppError::from(e)))?,
                    None => Baseline {
                        client_id: client_id.to_string(),
                        client_name: client_name.to_string(),
                        domains: Vec::new(),
                        last_updated: Utc::now(),
                    },
                };

                if baseline.domains.iter().any(|d| d == domain) {
                    return Ok(());
                }

                baseline.domains.push(domain.to_string());
                baseline.client_name = client_name.to_string();
                baseline.last_updated = Utc::now();

                let encoded = serde_json::to_vec(&baseline)
                    .map_err(|e| ConflictableTransactionError::Abort(AppError::from(e)))?;
                tx.insert(client_id.as_bytes(), encoded)?;
                Ok(())
            })
            .map_err(tx_error)
    }

    /// All client baselines.
    pub fn baselines_all(&self) -> Result<Vec<Baseline>> {
        let mut out = Vec::new();
        for entry in self.baselines.iter() {
            let (_, raw) = entry?;
            out.push(serde_json::from_slice(&raw)?);
        }
        Ok(out)
    }

    // =========================================================================
    // PROCESSED QUERIES
    // =========================================================================

    /// Whether a query fingerprint has been processed before.
    pub fn query_seen(&self, fingerprint: &str) -> Result<bool> {
        Ok(self.processed.contains_key(fingerprint.as_bytes())?)
    }

    /// Mark a query fingerprint as processed. Idempotent; the stored value
    /// is the timestamp of first processing.
    pub fn query_mark(&self, fingerprint: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        // Insert-if-absent keeps the first-processing timestamp on re-mark
        let _ = self.processed.compare_and_swap(
            fingerprint.as_bytes(),
            None as Option<&[u8]>,
            Some(now.as_bytes()),
        )?;
        Ok(())
    }

    /// Delete processed-query marks recorded before `cutoff`. Marks with
    /// unparseable timestamps are deleted too. Returns how many were removed.
    pub fn clean_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut stale = Vec::new();
        for entry in self.processed.iter() {
            let (key, value) = entry?;
            let keep = std::str::from_utf8(&value)
                .ok()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|ts| ts.with_timezone(&Utc) >= cutoff)
                .unwrap_or(false);
            if !keep {
                stale.push(key);
            }
        }

        let removed = stale.len() as u64;
        for key in stale {
            self.processed.remove(key)?;
        }
        Ok(removed)
    }

    // =========================================================================
    // WHOIS CACHE
    // =========================================================================

    /// Cached WHOIS record for a normalized domain, if any.
    pub fn whois_get(&self, domain: &str) -> Result<Option<WhoisRecord>> {
        match self.whois.get(domain.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Store or refresh a WHOIS record, keyed by its domain.
    pub fn whois_put(&self, record: &WhoisRecord) -> Result<()> {
        let encoded = serde_json::to_vec(record)?;
        self.whois.insert(record.domain.as_bytes(), encoded)?;
        Ok(())
    }

    // =========================================================================
    // ANALYSES
    // =========================================================================

    /// Append an analysis under a monotonically non-decreasing key.
    pub fn analysis_append(&self, analysis: &Analysis) -> Result<()> {
        let seq = self.analysis_seq.fetch_add(1, Ordering::Relaxed);
        let key = format!(
            "{}|{:08}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            seq
        );
        let encoded = serde_json::to_vec(analysis)?;
        self.analyses.insert(key.as_bytes(), encoded)?;
        Ok(())
    }

    // =========================================================================
    // ANOMALIES
    // =========================================================================

    /// Upsert an anomaly by its composite id. A record that already exists
    /// keeps its review status; everything else is overwritten.
    pub fn anomaly_put(&self, anomaly: &Anomaly) -> Result<()> {
        self.anomalies
            .transaction(|tx| {
                let mut incoming = anomaly.clone();
                if let Some(raw) = tx.get(anomaly.id.as_bytes())? {
                    let existing: Anomaly = serde_json::from_slice(&raw)
                        .map_err(|e| ConflictableTransactionError::Abort(AppError::from(e)))?;
                    incoming.status = existing.status;
                }
                let encoded = serde_json::to_vec(&incoming)
                    .map_err(|e| ConflictableTransactionError::Abort(AppError::from(e)))?;
                tx.insert(anomaly.id.as_bytes(), encoded)?;
                Ok(())
            })
            .map_err(tx_error)
    }

    /// Anomaly by id, or `None`.
    pub fn anomaly_get(&self, id: &str) -> Result<Option<Anomaly>> {
        match self.anomalies.get(id.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// All anomalies, optionally filtered by status.
    pub fn anomalies_list(&self, status: Option<AnomalyStatus>) -> Result<Vec<Anomaly>> {
        let mut out = Vec::new();
        for entry in self.anomalies.iter() {
            let (_, raw) = entry?;
            let anomaly: Anomaly = serde_json::from_slice(&raw)?;
            if status.is_none() || status == Some(anomaly.status) {
                out.push(anomaly);
            }
        }
        Ok(out)
    }

    /// Update an anomaly's review status. Fails with `NotFound` if the id
    /// does not exist.
    pub fn anomaly_set_status(&self, id: &str, status: AnomalyStatus) -> Result<()> {
        self.anomalies
            .transaction(|tx| {
                let raw = tx.get(id.as_bytes())?.ok_or_else(|| {
                    ConflictableTransactionError::Abort(AppError::NotFound(format!(
                        "anomaly not found: {id}"
                    )))
                })?;
                let mut anomaly: Anomaly = serde_json::from_slice(&raw)
                    .map_err(|e| ConflictableTransactionError::Abort(AppError::from(e)))?;
                anomaly.status = status;
                let encoded = serde_json::to_vec(&anomaly)
                    .map_err(|e| ConflictableTransactionError::Abort(AppError::from(e)))?;
                tx.insert(id.as_bytes(), encoded)?;
                Ok(())
            })
            .map_err(tx_error)
    }

    // =========================================================================
    // STATS
    // =========================================================================

    /// Counts across all partitions.
    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats {
            unique_clients: self.baselines.len(),
            total_queries: self.processed.len(),
            total_analyses: self.analyses.len(),
            ..Default::default()
        };

        for entry in self.anomalies.iter() {
            let (_, raw) = entry?;
            // Skip malformed entries rather than failing the whole report
            let Ok(anomaly) = serde_json::from_slice::<Anomaly>(&raw) else {
                continue;
            };
            stats.total_anomalies += 1;
            match anomaly.status {
                AnomalyStatus::Pending => stats.pending_anomalies += 1,
                AnomalyStatus::Approved => stats.approved_anomalies += 1,
                AnomalyStatus::Blocked => stats.blocked_anomalies += 1,
            }
            match anomaly.classification {
                Classification::Malicious => stats.malicious_count += 1,
                Classification::Suspicious => stats.suspicious_count += 1,
                Classification::Safe => {}
            }
        }

        Ok(stats)
    }
}

fn tx_error(err: sled::transaction::TransactionError<AppError>) -> AppError {
    match err {
        sled::transaction::TransactionError::Abort(app) => app,
        sled::transaction::TransactionError::Storage(e) => AppError::from(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SuggestedAction;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("db").to_str().unwrap()).unwrap();
        (dir, store)
    }

    fn sample_anomaly(status: AnomalyStatus) -> Anomaly {
        let detected_at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        Anomaly {
            id: Anomaly::make_id("iot-plug", "telemetry.example.org", detected_at),
            domain: "telemetry.example.org".into(),
            client_id: "iot-plug".into(),
            client_name: "IoT Plug".into(),
            query_type: "A".into(),
            classification: Classification::Malicious,
            risk_score: 9,
            explanation: "C2 beaconing pattern".into(),
            suggested_action: SuggestedAction::Block,
            detected_at,
            status,
        }
    }

    #[test]
    fn baseline_add_is_idempotent_and_monotonic() {
        let (_dir, store) = open_store();

        assert!(!store.baseline_contains("iot-plug", "a.example").unwrap());

        store.baseline_add("iot-plug", "IoT Plug", "a.example").unwrap();
        store.baseline_add("iot-plug", "IoT Plug", "a.example").unwrap();
        store.baseline_add("iot-plug", "IoT Plug", "b.example").unwrap();

        assert!(store.baseline_contains("iot-plug", "a.example").unwrap());
        assert!(store.baseline_contains("iot-plug", "b.example").unwrap());

        let baselines = store.baselines_all().unwrap();
        assert_eq!(baselines.len(), 1);
        assert_eq!(baselines[0].domains, vec!["a.example", "b.example"]);
    }

    #[test]
    fn baseline_updates_display_name() {
        let (_dir, store) = open_store();
        store.baseline_add("c1", "old-name", "a.example").unwrap();
        store.baseline_add("c1", "new-name", "b.example").unwrap();
        let baselines = store.baselines_all().unwrap();
        assert_eq!(baselines[0].client_name, "new-name");
    }

    #[test]
    fn query_mark_deduplicates() {
        let (_dir, store) = open_store();
        let fp = "iot-plug|telemetry.example.org|2025-01-01T00:00:00Z";

        assert!(!store.query_seen(fp).unwrap());
        store.query_mark(fp).unwrap();
        assert!(store.query_seen(fp).unwrap());
        // Re-marking keeps the original timestamp and stays a single entry
        store.query_mark(fp).unwrap();
        assert_eq!(store.stats().unwrap().total_queries, 1);
    }

    #[test]
    fn clean_processed_removes_only_stale_marks() {
        let (_dir, store) = open_store();
        store.query_mark("fresh").unwrap();
        // Insert an old mark directly
        store
            .processed
            .insert("stale", "2020-01-01T00:00:00Z".as_bytes())
            .unwrap();
        store.processed.insert("garbage", "not-a-date".as_bytes()).unwrap();

        let removed = store
            .clean_processed_before(Utc::now() - chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(removed, 2);
        assert!(store.query_seen("fresh").unwrap());
        assert!(!store.query_seen("stale").unwrap());
    }

    #[test]
    fn whois_round_trip() {
        let (_dir, store) = open_store();
        assert!(store.whois_get("example.org").unwrap().is_none());

        let mut record = WhoisRecord::minimal("example.org");
        record.registrar = "X".into();
        record.country = "US".into();
        store.whois_put(&record).unwrap();

        let cached = store.whois_get("example.org").unwrap().unwrap();
        assert_eq!(cached.registrar, "X");
        assert_eq!(cached.country, "US");
    }

    #[test]
    fn anomaly_lifecycle() {
        let (_dir, store) = open_store();
        let anomaly = sample_anomaly(AnomalyStatus::Pending);

        store.anomaly_put(&anomaly).unwrap();
        let loaded = store.anomaly_get(&anomaly.id).unwrap().unwrap();
        assert_eq!(loaded.status, AnomalyStatus::Pending);
        assert_eq!(loaded.risk_score, 9);

        store.anomaly_set_status(&anomaly.id, AnomalyStatus::Approved).unwrap();
        let loaded = store.anomaly_get(&anomaly.id).unwrap().unwrap();
        assert_eq!(loaded.status, AnomalyStatus::Approved);

        // Upsert by the same id does not create a second entry, and the
        // review status survives the overwrite
        store.anomaly_put(&anomaly).unwrap();
        assert_eq!(store.anomalies_list(None).unwrap().len(), 1);
        let loaded = store.anomaly_get(&anomaly.id).unwrap().unwrap();
        assert_eq!(loaded.status, AnomalyStatus::Approved);
    }

    #[test]
    fn anomaly_set_status_missing_id_is_not_found() {
        let (_dir, store) = open_store();
        let err = store
            .anomaly_set_status("nope", AnomalyStatus::Blocked)
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn anomalies_list_filters_by_status() {
        let (_dir, store) = open_store();
        let mut pending = sample_anomaly(AnomalyStatus::Pending);
        pending.id = "p".into();
        let mut blocked = sample_anomaly(AnomalyStatus::Blocked);
        blocked.id = "b".into();
        store.anomaly_put(&pending).unwrap();
        store.anomaly_put(&blocked).unwrap();

        let all = store.anomalies_list(None).unwrap();
        assert_eq!(all.len(), 2);
        let only_blocked = store.anomalies_list(Some(AnomalyStatus::Blocked)).unwrap();
        assert_eq!(only_blocked.len(), 1);
        assert_eq!(only_blocked[0].id, "b");
    }

    #[test]
    fn analyses_are_append_only() {
        let (_dir, store) = open_store();
        let analysis = Analysis {
            domain: "telemetry.example.org".into(),
            client_id: "iot-plug".into(),
            client_name: "IoT Plug".into(),
            classification: Classification::Safe,
            explanation: "Reputable provider".into(),
            risk_score: 2,
            suggested_action: SuggestedAction::Allow,
            analyzed_at: Utc::now(),
            provider: "gemini".into(),
            query_type: "A".into(),
        };
        store.analysis_append(&analysis).unwrap();
        store.analysis_append(&analysis).unwrap();
        assert_eq!(store.stats().unwrap().total_analyses, 2);
    }

    #[test]
    fn stats_counts_by_status_and_classification() {
        let (_dir, store) = open_store();
        let mut a = sample_anomaly(AnomalyStatus::Pending);
        a.id = "a".into();
        let mut b = sample_anomaly(AnomalyStatus::Blocked);
        b.id = "b".into();
        b.classification = Classification::Suspicious;
        store.anomaly_put(&a).unwrap();
        store.anomaly_put(&b).unwrap();
        store.baseline_add("c1", "c1", "x.example").unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.unique_clients, 1);
        assert_eq!(stats.total_anomalies, 2);
        assert_eq!(stats.pending_anomalies, 1);
        assert_eq!(stats.blocked_anomalies, 1);
        assert_eq!(stats.malicious_count, 1);
        assert_eq!(stats.suspicious_count, 1);
    }

    #[test]
    fn open_twice_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        let path = path.to_str().unwrap();
        let _store = Store::open(path).unwrap();
        assert!(Store::open(path).is_err());
    }
}
