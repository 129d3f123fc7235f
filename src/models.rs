//! Core domain models for Guardian-Log

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A single DNS query observed in the upstream query log.
///
/// Records are ephemeral: they exist between a poll and the decision the
/// Detector makes about them. The `domain` field is normalized (lower-cased,
/// trailing dot stripped) at ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRecord {
    /// Stable identifier for the client (falls back to its address)
    pub client_id: String,
    /// Display name for the client (last observed)
    pub client_name: String,
    /// Queried domain, normalized; empty for malformed entries
    pub domain: String,
    /// When the upstream logged the query
    pub timestamp: DateTime<Utc>,
    /// DNS query type (A, AAAA, TXT, ...)
    pub query_type: String,
    /// First answer value, if the upstream recorded one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    /// The upstream's filtering reason for this query
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl QueryRecord {
    /// Deterministic identifier for deduplication.
    ///
    /// Two polls that return the same log entry produce the same
    /// fingerprint. Distinct records colliding costs a missed anomaly,
    /// never a duplicate alert.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}",
            self.client_id,
            self.domain,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

/// The set of domains considered normal for one client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    pub client_id: String,
    pub client_name: String,
    pub domains: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

/// Review state of a persisted anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyStatus {
    Pending,
    Approved,
    Blocked,
}

impl AnomalyStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }
}

/// Classifier verdict category.
///
/// `Safe` results are recorded as analyses only; anomalies are created for
/// the other two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    Safe,
    Suspicious,
    Malicious,
}

/// What the classifier recommends the analyst do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuggestedAction {
    Allow,
    Investigate,
    Block,
}

/// A first-seen domain the classifier judged non-Safe, awaiting review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: String,
    pub domain: String,
    pub client_id: String,
    pub client_name: String,
    pub query_type: String,
    pub classification: Classification,
    pub risk_score: u8,
    pub explanation: String,
    pub suggested_action: SuggestedAction,
    pub detected_at: DateTime<Utc>,
    pub status: AnomalyStatus,
}

impl Anomaly {
    /// Composite id: `client_id|domain|detected_at` at second precision.
    pub fn make_id(client_id: &str, domain: &str, detected_at: DateTime<Utc>) -> String {
        format!(
            "{}|{}|{}",
            client_id,
            domain,
            detected_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

/// Full classifier verdict for one query, Safe included. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub domain: String,
    pub client_id: String,
    pub client_name: String,
    pub classification: Classification,
    pub explanation: String,
    pub risk_score: u8,
    pub suggested_action: SuggestedAction,
    pub analyzed_at: DateTime<Utc>,
    /// Which provider produced the verdict
    pub provider: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub query_type: String,
}

/// Registration metadata for a domain, cached for 24 hours.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhoisRecord {
    pub domain: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub registrar: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub country: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_date: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub updated_date: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub expiry_date: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub name_servers: Vec<String>,
    pub looked_up_at: DateTime<Utc>,
}

impl WhoisRecord {
    /// A record with only the domain filled in, used when a lookup fails.
    pub fn minimal(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            registrar: String::new(),
            country: String::new(),
            created_date: String::new(),
            updated_date: String::new(),
            expiry_date: String::new(),
            name_servers: Vec::new(),
            looked_up_at: Utc::now(),
        }
    }
}

/// Validated classifier output for one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub classification: Classification,
    pub explanation: String,
    pub risk_score: u8,
    pub suggested_action: SuggestedAction,
}
