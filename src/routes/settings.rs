//! Settings endpoint (secrets redacted)

use axum::{extract::State, Json};
use serde::Serialize;

use crate::config::Config;
use crate::state::AppState;

/// Current configuration with secrets reduced to presence booleans.
#[derive(Debug, Clone, Serialize)]
pub struct SettingsSnapshot {
    pub upstream_url: String,
    pub poll_interval_secs: u64,
    pub llm_enabled: bool,
    pub llm_provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gemini_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_gemini_api_key: Option<bool>,
}

impl SettingsSnapshot {
    pub fn from_config(cfg: &Config) -> Self {
        let gemini = cfg.llm_provider == "gemini";
        Self {
            upstream_url: cfg.upstream_url.clone(),
            poll_interval_secs: cfg.poll_interval.as_secs(),
            llm_enabled: cfg.llm_enabled,
            llm_provider: cfg.llm_provider.clone(),
            gemini_model: gemini.then(|| cfg.gemini_model.clone()),
            has_gemini_api_key: gemini.then(|| !cfg.gemini_api_key.is_empty()),
        }
    }
}

/// GET /api/settings
pub async fn settings(State(state): State<AppState>) -> Json<SettingsSnapshot> {
    Json(state.settings.as_ref().clone())
}
