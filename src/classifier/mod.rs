//! Classifier capability: LLM providers that judge first-seen domains
//!
//! Providers return strict JSON which is validated here before anything is
//! persisted. Batch responses must come back in input order with a matching
//! domain per position; any mismatch rejects the whole batch.

pub mod gemini;
pub mod prompt;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::models::{Classification, QueryRecord, SuggestedAction, Verdict, WhoisRecord};

/// Classifier transport and validation errors. The Dispatcher branches on
/// these: `Throttled` requeues, everything else counts as failed.
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("provider rate limit exceeded")]
    Throttled,

    #[error("provider request timed out")]
    Timeout,

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("provider error: {0}")]
    Provider(String),
}

/// An external text-generation provider that can classify DNS queries.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Provider name, e.g. `gemini`.
    fn name(&self) -> &str;

    /// Whether `classify_many` issues a single provider call.
    fn supports_batch(&self) -> bool;

    /// Classify one query with optional WHOIS context.
    async fn classify_one(
        &self,
        query: &QueryRecord,
        whois: Option<&WhoisRecord>,
    ) -> Result<Verdict, ClassifierError>;

    /// Classify a batch in one call. The result has exactly one verdict per
    /// query, in input order.
    async fn classify_many(
        &self,
        queries: &[QueryRecord],
        whois: &HashMap<String, WhoisRecord>,
    ) -> Result<Vec<Verdict>, ClassifierError>;
}

/// Raw single-query response shape expected from a provider.
#[derive(Debug, Deserialize)]
pub struct VerdictPayload {
    #[serde(default)]
    pub classification: String,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub risk_score: i64,
    #[serde(default)]
    pub suggested_action: String,
}

impl VerdictPayload {
    /// Check the response invariants and convert to a typed verdict.
    pub fn validate(&self) -> Result<Verdict, ClassifierError> {
        let classification = match self.classification.as_str() {
            "Safe" => Classification::Safe,
            "Suspicious" => Classification::Suspicious,
            "Malicious" => Classification::Malicious,
            other => {
                return Err(ClassifierError::InvalidResponse(format!(
                    "classification must be Safe, Suspicious, or Malicious, got {other:?}"
                )))
            }
        };

        if self.explanation.is_empty() {
            return Err(ClassifierError::InvalidResponse(
                "missing explanation".into(),
            ));
        }

        if !(1..=10).contains(&self.risk_score) {
            return Err(ClassifierError::InvalidResponse(format!(
                "risk score must be between 1 and 10, got {}",
                self.risk_score
            )));
        }

        let suggested_action = match self.suggested_action.as_str() {
            "Allow" => SuggestedAction::Allow,
            "Investigate" => SuggestedAction::Investigate,
            "Block" => SuggestedAction::Block,
            other => {
                return Err(ClassifierError::InvalidResponse(format!(
                    "suggested action must be Allow, Investigate, or Block, got {other:?}"
                )))
            }
        };

        Ok(Verdict {
            classification,
            explanation: self.explanation.clone(),
            risk_score: self.risk_score as u8,
            suggested_action,
        })
    }
}

/// Raw per-item batch response: a verdict plus the domain it belongs to,
/// used to detect misaligned batches.
#[derive(Debug, Deserialize)]
pub struct BatchVerdictPayload {
    #[serde(default)]
    pub domain: String,
    #[serde(flatten)]
    pub verdict: VerdictPayload,
}

/// Validate a whole batch response against the queries that produced it.
/// Size mismatch, position mismatch, or an invalid item rejects everything.
pub fn validate_batch(
    queries: &[QueryRecord],
    payloads: &[BatchVerdictPayload],
) -> Result<Vec<Verdict>, ClassifierError> {
    if payloads.len() != queries.len() {
        return Err(ClassifierError::InvalidResponse(format!(
            "batch response count mismatch: expected {}, got {}",
            queries.len(),
            payloads.len()
        )));
    }

    let mut verdicts = Vec::with_capacity(payloads.len());
    for (i, payload) in payloads.iter().enumerate() {
        if payload.domain != queries[i].domain {
            return Err(ClassifierError::InvalidResponse(format!(
                "domain mismatch at index {i}: expected {}, got {}",
                queries[i].domain, payload.domain
            )));
        }
        let verdict = payload.verdict.validate().map_err(|e| {
            ClassifierError::InvalidResponse(format!("batch item {i}: {e}"))
        })?;
        verdicts.push(verdict);
    }
    Ok(verdicts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn query(domain: &str) -> QueryRecord {
        QueryRecord {
            client_id: "c1".into(),
            client_name: "c1".into(),
            domain: domain.into(),
            timestamp: Utc::now(),
            query_type: "A".into(),
            answer: None,
            reason: None,
        }
    }

    fn payload(domain: &str, classification: &str) -> BatchVerdictPayload {
        BatchVerdictPayload {
            domain: domain.into(),
            verdict: VerdictPayload {
                classification: classification.into(),
                explanation: "because".into(),
                risk_score: 5,
                suggested_action: "Investigate".into(),
            },
        }
    }

    #[test]
    fn validate_accepts_well_formed_response() {
        let verdict = VerdictPayload {
            classification: "Malicious".into(),
            explanation: "C2 beaconing pattern".into(),
            risk_score: 9,
            suggested_action: "Block".into(),
        }
        .validate()
        .unwrap();
        assert_eq!(verdict.classification, Classification::Malicious);
        assert_eq!(verdict.risk_score, 9);
        assert_eq!(verdict.suggested_action, SuggestedAction::Block);
    }

    #[test]
    fn validate_rejects_out_of_range_and_missing_fields() {
        let bad_class = VerdictPayload {
            classification: "Shady".into(),
            explanation: "x".into(),
            risk_score: 5,
            suggested_action: "Allow".into(),
        };
        assert!(bad_class.validate().is_err());

        let empty_explanation = VerdictPayload {
            classification: "Safe".into(),
            explanation: String::new(),
            risk_score: 2,
            suggested_action: "Allow".into(),
        };
        assert!(empty_explanation.validate().is_err());

        for score in [0, 11, -3] {
            let bad_score = VerdictPayload {
                classification: "Safe".into(),
                explanation: "x".into(),
                risk_score: score,
                suggested_action: "Allow".into(),
            };
            assert!(bad_score.validate().is_err());
        }

        let bad_action = VerdictPayload {
            classification: "Safe".into(),
            explanation: "x".into(),
            risk_score: 2,
            suggested_action: "Quarantine".into(),
        };
        assert!(bad_action.validate().is_err());
    }

    #[test]
    fn batch_requires_matching_size() {
        let queries = vec![query("a.example"), query("b.example")];
        let payloads = vec![payload("a.example", "Safe")];
        assert!(validate_batch(&queries, &payloads).is_err());
    }

    #[test]
    fn batch_requires_positional_domain_match() {
        let queries = vec![query("a.example"), query("b.example")];
        let payloads = vec![payload("b.example", "Safe"), payload("a.example", "Safe")];
        assert!(validate_batch(&queries, &payloads).is_err());
    }

    #[test]
    fn batch_rejects_whole_response_on_one_bad_item() {
        let queries = vec![query("a.example"), query("b.example")];
        let mut payloads = vec![payload("a.example", "Safe"), payload("b.example", "Safe")];
        payloads[1].verdict.risk_score = 0;
        assert!(validate_batch(&queries, &payloads).is_err());
    }

    #[test]
    fn batch_accepts_aligned_response() {
        let queries = vec![query("a.example"), query("b.example")];
        let payloads = vec![
            payload("a.example", "Safe"),
            payload("b.example", "Malicious"),
        ];
        let verdicts = validate_batch(&queries, &payloads).unwrap();
        assert_eq!(verdicts.len(), 2);
        assert_eq!(verdicts[1].classification, Classification::Malicious);
    }

    #[test]
    fn batch_payload_deserializes_flattened() {
        let json = r#"{"domain":"a.example","classification":"Safe","explanation":"ok","risk_score":2,"suggested_action":"Allow"}"#;
        let payload: BatchVerdictPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.domain, "a.example");
        assert_eq!(payload.verdict.classification, "Safe");
    }
}
