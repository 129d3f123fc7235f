//! Anomaly review endpoints

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::{Anomaly, AnomalyStatus};
use crate::state::AppState;

/// Query parameters for the anomaly listing
#[derive(Debug, Deserialize)]
pub struct AnomaliesQuery {
    /// Optional status filter: "pending", "approved", or "blocked"
    pub status: Option<String>,
}

/// Response for approve/block actions
#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub success: bool,
}

/// GET /api/anomalies
pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<AnomaliesQuery>,
) -> Result<Json<Vec<Anomaly>>> {
    let status = match params.status.as_deref() {
        Some(raw) => Some(AnomalyStatus::parse(raw).ok_or_else(|| {
            AppError::InvalidRequest(format!(
                "invalid status '{raw}'. Valid options: pending, approved, blocked"
            ))
        })?),
        None => None,
    };

    Ok(Json(state.control.list_anomalies(status)?))
}

/// POST /api/anomalies/{id}/approve
///
/// Adds the domain to the client's baseline and marks the anomaly approved.
pub async fn approve(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>> {
    state.control.approve(&id)?;
    Ok(Json(ActionResponse { success: true }))
}

/// POST /api/anomalies/{id}/block
///
/// Installs an upstream block rule and marks the anomaly blocked. A failed
/// installation leaves the anomaly pending for retry.
pub async fn block(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>> {
    state.control.block(&id).await?;
    Ok(Json(ActionResponse { success: true }))
}
