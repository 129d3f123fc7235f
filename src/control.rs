//! Review operations the HTTP layer wraps: list, stats, approve, block

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::dispatcher::{Dispatcher, DispatcherStats};
use crate::enrichment::{WhoisService, WhoisStats};
use crate::error::{AppError, Result};
use crate::models::{Anomaly, AnomalyStatus};
use crate::store::{Store, StoreStats};
use crate::upstream::Upstream;

/// Store counts combined with pipeline counters.
#[derive(Debug, Serialize)]
pub struct StatsReport {
    #[serde(flatten)]
    pub store: StoreStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classifier: Option<DispatcherStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whois: Option<WhoisStats>,
}

/// Read/act surface used by the dashboard.
pub struct ControlSurface {
    store: Arc<Store>,
    upstream: Arc<dyn Upstream>,
    dispatcher: Option<Arc<Dispatcher>>,
    whois: Option<Arc<WhoisService>>,
    /// Serializes block-rule writes to the upstream
    block_lock: tokio::sync::Mutex<()>,
}

impl ControlSurface {
    pub fn new(
        store: Arc<Store>,
        upstream: Arc<dyn Upstream>,
        dispatcher: Option<Arc<Dispatcher>>,
        whois: Option<Arc<WhoisService>>,
    ) -> Self {
        Self {
            store,
            upstream,
            dispatcher,
            whois,
            block_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Anomalies, optionally filtered by review status.
    pub fn list_anomalies(&self, status: Option<AnomalyStatus>) -> Result<Vec<Anomaly>> {
        self.store.anomalies_list(status)
    }

    /// Combined store and pipeline statistics.
    pub fn stats(&self) -> Result<StatsReport> {
        Ok(StatsReport {
            store: self.store.stats()?,
            classifier: self.dispatcher.as_ref().map(|d| d.stats()),
            whois: self.whois.as_ref().map(|w| w.stats()),
        })
    }

    /// Approve an anomaly: the domain joins the client's baseline, then the
    /// status flips. Both steps are idempotent, so a retry after partial
    /// failure converges.
    pub fn approve(&self, id: &str) -> Result<()> {
        let anomaly = self
            .store
            .anomaly_get(id)?
            .ok_or_else(|| AppError::NotFound(format!("anomaly not found: {id}")))?;

        self.store
            .baseline_add(&anomaly.client_id, &anomaly.client_name, &anomaly.domain)?;
        self.store.anomaly_set_status(id, AnomalyStatus::Approved)?;

        info!(id = %id, domain = %anomaly.domain, client_id = %anomaly.client_id, "Anomaly approved");
        Ok(())
    }

    /// Block an anomaly: install the upstream rule first, then flip the
    /// status. A failed installation leaves the anomaly pending so the
    /// analyst can retry.
    pub async fn block(&self, id: &str) -> Result<()> {
        let anomaly = self
            .store
            .anomaly_get(id)?
            .ok_or_else(|| AppError::NotFound(format!("anomaly not found: {id}")))?;

        let _guard = self.block_lock.lock().await;
        self.upstream
            .install_block_rule(&anomaly.domain)
            .await
            .map_err(|e| match e {
                AppError::UpstreamFailure(_) => e,
                other => AppError::UpstreamFailure(other.to_string()),
            })?;

        self.store.anomaly_set_status(id, AnomalyStatus::Blocked)?;

        info!(id = %id, domain = %anomaly.domain, client_id = %anomaly.client_id, "Anomaly blocked");
        Ok(())
    }
}
