//! AdGuard Home upstream client: query log reads and block rule writes

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::models::QueryRecord;

/// Capability surface of the upstream DNS filtering proxy.
///
/// Reads may run concurrently; callers serialize writes.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Verify connectivity and credentials.
    async fn probe(&self) -> Result<()>;

    /// Most recent `limit` query log records, newest first. Consecutive
    /// calls overlap; deduplication is the caller's concern.
    async fn fetch_page(&self, limit: usize) -> Result<Vec<QueryRecord>>;

    /// Install a rule blocking `domain` and its subdomains. Installing a
    /// rule that already exists reports success.
    async fn install_block_rule(&self, domain: &str) -> Result<()>;
}

/// One entry of the upstream query log response.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryLogEntry {
    #[serde(default)]
    pub client: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub question: Question,
    #[serde(default)]
    pub original_question: Question,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub answer: Vec<Answer>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub upstream: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Question {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub unicode_name: String,
    #[serde(default, rename = "type")]
    pub query_type: String,
    #[serde(default)]
    pub class: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Answer {
    #[serde(default)]
    pub value: String,
    #[serde(default, rename = "type")]
    pub answer_type: String,
    #[serde(default)]
    pub ttl: u32,
}

#[derive(Debug, Deserialize)]
struct QueryLogResponse {
    #[serde(default)]
    data: Vec<QueryLogEntry>,
}

#[derive(Debug, Serialize)]
struct AddFilterRequest {
    name: String,
    url: String,
    enabled: bool,
}

/// HTTP client for the AdGuard Home control API.
pub struct AdGuardClient {
    base_url: String,
    username: String,
    password: String,
    client: reqwest::Client,
}

impl AdGuardClient {
    pub fn new(base_url: &str, username: &str, password: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            client,
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .basic_auth(&self.username, Some(&self.password))
    }
}

/// Convert an upstream log entry into a normalized query record.
///
/// `client_id` falls back to the client address; the display name falls
/// back the other way. The domain prefers `question.name`, then the
/// original question, then the unicode form.
pub fn convert_entry(entry: &QueryLogEntry) -> Option<QueryRecord> {
    let timestamp = DateTime::parse_from_rfc3339(&entry.time)
        .ok()?
        .with_timezone(&Utc);

    let client_id = if entry.client_id.is_empty() {
        entry.client.clone()
    } else {
        entry.client_id.clone()
    };
    let client_name = if entry.client.is_empty() {
        entry.client_id.clone()
    } else {
        entry.client.clone()
    };

    let mut domain = if !entry.question.name.is_empty() {
        entry.question.name.clone()
    } else if !entry.original_question.name.is_empty() {
        entry.original_question.name.clone()
    } else {
        entry.question.unicode_name.clone()
    };
    domain = normalize_domain(&domain);

    Some(QueryRecord {
        client_id,
        client_name,
        domain,
        timestamp,
        query_type: entry.question.query_type.clone(),
        answer: entry.answer.first().map(|a| a.value.clone()),
        reason: if entry.reason.is_empty() {
            None
        } else {
            Some(entry.reason.clone())
        },
    })
}

/// Lower-case a domain and strip its trailing dot.
pub fn normalize_domain(domain: &str) -> String {
    domain.trim_end_matches('.').to_lowercase()
}

#[async_trait]
impl Upstream for AdGuardClient {
    async fn probe(&self) -> Result<()> {
        let response = self
            .get("/control/status")
            .send()
            .await
            .map_err(|e| AppError::Unreachable(format!("cannot reach upstream: {e}")))?;

        match response.status() {
            s if s.is_success() => Ok(()),
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => Err(
                AppError::Unauthorized("upstream rejected credentials".into()),
            ),
            s => Err(AppError::Unreachable(format!(
                "upstream status probe returned {s}"
            ))),
        }
    }

    async fn fetch_page(&self, limit: usize) -> Result<Vec<QueryRecord>> {
        let response = self
            .get("/control/querylog")
            .query(&[("limit", limit.to_string())])
            .send()
            .await
            .map_err(|e| AppError::UpstreamFailure(format!("query log fetch failed: {e}")))?;

        if !response.status().is_success() {
            return Err(AppError::UpstreamFailure(format!(
                "query log fetch returned {}",
                response.status()
            )));
        }

        let body: QueryLogResponse = response
            .json()
            .await
            .map_err(|e| AppError::UpstreamFailure(format!("query log decode failed: {e}")))?;

        // Entries that fail to convert (no parseable timestamp) are skipped
        let records: Vec<QueryRecord> = body.data.iter().filter_map(convert_entry).collect();
        debug!(count = records.len(), "Fetched query log page");
        Ok(records)
    }

    async fn install_block_rule(&self, domain: &str) -> Result<()> {
        let payload = AddFilterRequest {
            name: format!("Guardian-Log Block: {domain}"),
            url: format!("data:text/plain,||{domain}^"),
            enabled: true,
        };

        let response = self
            .client
            .post(format!("{}/control/filtering/add_url", self.base_url))
            .basic_auth(&self.username, Some(&self.password))
            .json(&payload)
            .send()
            .await
            .map_err(|e| AppError::UpstreamFailure(format!("block rule request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            info!(domain = %domain, "Block rule installed");
            return Ok(());
        }

        // The upstream rejects a duplicate filter URL; treat that as success
        // so re-blocking converges.
        let body = response.text().await.unwrap_or_default();
        if body.contains("already exists") {
            info!(domain = %domain, "Block rule already present");
            return Ok(());
        }

        Err(AppError::UpstreamFailure(format!(
            "block rule rejected with {status}: {body}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_json(json: &str) -> QueryLogEntry {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn convert_maps_client_fields() {
        let entry = entry_json(
            r#"{
                "client": "192.168.1.50",
                "client_id": "iot-plug",
                "question": {"name": "Telemetry.Example.ORG.", "type": "A", "class": "IN"},
                "time": "2025-01-01T00:00:00Z",
                "answer": [{"value": "203.0.113.9", "type": "A", "ttl": 60}],
                "reason": "NotFilteredNotFound"
            }"#,
        );

        let record = convert_entry(&entry).unwrap();
        assert_eq!(record.client_id, "iot-plug");
        assert_eq!(record.client_name, "192.168.1.50");
        assert_eq!(record.domain, "telemetry.example.org");
        assert_eq!(record.query_type, "A");
        assert_eq!(record.answer.as_deref(), Some("203.0.113.9"));
        assert_eq!(record.reason.as_deref(), Some("NotFilteredNotFound"));
    }

    #[test]
    fn convert_falls_back_to_client_address_as_id() {
        let entry = entry_json(
            r#"{
                "client": "192.168.1.50",
                "question": {"name": "a.example", "type": "A"},
                "time": "2025-01-01T00:00:00Z"
            }"#,
        );
        let record = convert_entry(&entry).unwrap();
        assert_eq!(record.client_id, "192.168.1.50");
        assert_eq!(record.client_name, "192.168.1.50");
    }

    #[test]
    fn convert_falls_back_to_original_and_unicode_names() {
        let entry = entry_json(
            r#"{
                "client": "c",
                "question": {"name": "", "unicode_name": "bücher.example"},
                "original_question": {"name": ""},
                "time": "2025-01-01T00:00:00Z"
            }"#,
        );
        let record = convert_entry(&entry).unwrap();
        assert_eq!(record.domain, "bücher.example");

        let entry = entry_json(
            r#"{
                "client": "c",
                "question": {"name": ""},
                "original_question": {"name": "orig.example"},
                "time": "2025-01-01T00:00:00Z"
            }"#,
        );
        let record = convert_entry(&entry).unwrap();
        assert_eq!(record.domain, "orig.example");
    }

    #[test]
    fn convert_rejects_unparseable_time() {
        let entry = entry_json(
            r#"{"client": "c", "question": {"name": "a.example"}, "time": "yesterday"}"#,
        );
        assert!(convert_entry(&entry).is_none());
    }

    #[test]
    fn normalize_strips_dot_and_lowercases() {
        assert_eq!(normalize_domain("Example.COM."), "example.com");
        assert_eq!(normalize_domain(""), "");
    }
}
