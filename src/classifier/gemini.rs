//! Google Gemini provider adaptor
//!
//! Talks to the generateContent REST endpoint with JSON-only output and
//! temperature 0 for deterministic verdicts. Throttling responses are
//! retried with exponential backoff before surfacing `Throttled`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::classifier::prompt::{build_batch_prompt, build_single_prompt};
use crate::classifier::{
    validate_batch, BatchVerdictPayload, Classifier, ClassifierError, VerdictPayload,
};
use crate::error::AppError;
use crate::models::{QueryRecord, Verdict, WhoisRecord};

const BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Maximum retry attempts after a throttling response
const MAX_RETRIES: u32 = 3;

/// First backoff delay; doubles per retry up to `MAX_BACKOFF`
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "responseMimeType")]
    response_mime_type: &'static str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

/// Gemini-backed classifier.
pub struct GeminiClassifier {
    api_key: String,
    model: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl GeminiClassifier {
    pub fn new(api_key: &str, model: &str, timeout: Duration) -> Result<Self, AppError> {
        if api_key.is_empty() {
            return Err(AppError::Config("Gemini API key is required".into()));
        }
        let model = if model.is_empty() {
            "gemini-1.5-flash"
        } else {
            model
        };
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout,
            client,
        })
    }

    /// One generateContent exchange with throttle retries. Returns the
    /// response text of the first candidate.
    async fn generate(&self, prompt: &str, timeout: Duration) -> Result<String, ClassifierError> {
        let url = format!("{BASE_URL}/v1beta/models/{}:generateContent", self.model);
        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.0,
                response_mime_type: "application/json",
            },
        };

        let mut backoff = INITIAL_BACKOFF;
        for attempt in 0..=MAX_RETRIES {
            let result = self
                .client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .timeout(timeout)
                .json(&request)
                .send()
                .await;

            let response = match result {
                Ok(response) => response,
                Err(e) if e.is_timeout() => return Err(ClassifierError::Timeout),
                Err(e) => return Err(ClassifierError::Provider(e.to_string())),
            };

            let status = response.status();
            if status.is_success() {
                let body: GenerateResponse = response
                    .json()
                    .await
                    .map_err(|e| ClassifierError::Provider(format!("response decode: {e}")))?;
                return extract_text(body);
            }

            let body = response.text().await.unwrap_or_default();
            if is_throttle(status.as_u16(), &body) {
                if attempt == MAX_RETRIES {
                    warn!(retries = MAX_RETRIES, "Rate limit exceeded, giving up");
                    return Err(ClassifierError::Throttled);
                }
                let delay = backoff.min(MAX_BACKOFF);
                warn!(
                    attempt = attempt + 1,
                    max = MAX_RETRIES,
                    delay_secs = delay.as_secs(),
                    "Rate limited, backing off"
                );
                tokio::time::sleep(delay).await;
                backoff *= 2;
                continue;
            }

            return Err(ClassifierError::Provider(format!("{status}: {body}")));
        }

        Err(ClassifierError::Throttled)
    }
}

/// Whether a provider response indicates throttling.
fn is_throttle(status: u16, body: &str) -> bool {
    if status == 429 {
        return true;
    }
    let lower = body.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("quota exceeded")
        || lower.contains("resource_exhausted")
}

fn extract_text(response: GenerateResponse) -> Result<String, ClassifierError> {
    response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content.parts.into_iter().next())
        .map(|p| p.text)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ClassifierError::Provider("empty response".into()))
}

#[async_trait]
impl Classifier for GeminiClassifier {
    fn name(&self) -> &str {
        "gemini"
    }

    fn supports_batch(&self) -> bool {
        true
    }

    async fn classify_one(
        &self,
        query: &QueryRecord,
        whois: Option<&WhoisRecord>,
    ) -> Result<Verdict, ClassifierError> {
        let prompt = build_single_prompt(query, whois);
        debug!(domain = %query.domain, "Classifying domain");

        let text = self.generate(&prompt, self.timeout).await?;
        let payload: VerdictPayload = serde_json::from_str(&text)
            .map_err(|e| ClassifierError::InvalidResponse(format!("not valid JSON: {e}")))?;
        payload.validate()
    }

    async fn classify_many(
        &self,
        queries: &[QueryRecord],
        whois: &HashMap<String, WhoisRecord>,
    ) -> Result<Vec<Verdict>, ClassifierError> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }
        let prompt = build_batch_prompt(queries, whois);
        debug!(count = queries.len(), "Classifying batch");

        // Batches get double the single-call deadline
        let text = self.generate(&prompt, self.timeout * 2).await?;
        let payloads: Vec<BatchVerdictPayload> = serde_json::from_str(&text)
            .map_err(|e| ClassifierError::InvalidResponse(format!("not a JSON array: {e}")))?;
        validate_batch(queries, &payloads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_api_key() {
        assert!(GeminiClassifier::new("", "m", Duration::from_secs(30)).is_err());
        assert!(GeminiClassifier::new("k", "", Duration::from_secs(30)).is_ok());
    }

    #[test]
    fn throttle_detection_covers_status_and_message() {
        assert!(is_throttle(429, ""));
        assert!(is_throttle(400, "Rate Limit reached for requests"));
        assert!(is_throttle(500, "quota exceeded for project"));
        assert!(is_throttle(503, "RESOURCE_EXHAUSTED"));
        assert!(!is_throttle(500, "internal error"));
        assert!(!is_throttle(400, "bad request"));
    }

    #[test]
    fn extract_text_takes_first_candidate_part() {
        let response: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"{\"classification\":\"Safe\"}"}]}}]}"#,
        )
        .unwrap();
        assert_eq!(
            extract_text(response).unwrap(),
            "{\"classification\":\"Safe\"}"
        );
    }

    #[test]
    fn extract_text_rejects_empty_response() {
        let response: GenerateResponse = serde_json::from_str(r#"{"candidates":[]}"#).unwrap();
        assert!(extract_text(response).is_err());
    }
}
