//! Statistics endpoint

use axum::{extract::State, Json};

use crate::control::StatsReport;
use crate::error::Result;
use crate::state::AppState;

/// GET /api/stats
///
/// Store counts plus classifier and WHOIS counters when the pipeline is
/// enabled.
pub async fn stats(State(state): State<AppState>) -> Result<Json<StatsReport>> {
    Ok(Json(state.control.stats()?))
}
