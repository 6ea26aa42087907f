pub mod sic;
pub mod stats;

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Router,
};
use log::error;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::shared::{ApiError, ApiResponse, ApiResult, AppState};
use crate::core::tenant::TeamContext;

pub use stats::StatusCounts;

#[derive(Debug, Serialize)]
pub struct SectorSummary {
    pub id: &'static str,
    pub name: &'static str,
    pub sic_codes: usize,
    pub records: u64,
}

#[derive(Debug, Serialize)]
pub struct SectorStatsResponse {
    pub sector: String,
    #[serde(flatten)]
    pub counts: StatusCounts,
}

#[derive(Debug, Deserialize)]
pub struct SicSearchQuery {
    pub q: Option<String>,
    pub sector: Option<String>,
    pub high_volume: Option<bool>,
}

pub async fn list_sectors() -> ApiResponse<Vec<SectorSummary>> {
    let sectors = sic::SECTORS
        .iter()
        .map(|s| SectorSummary {
            id: s.id,
            name: s.name,
            sic_codes: sic::codes_for_sector(s.id).len(),
            records: sic::sector_count(s.id),
        })
        .collect();
    ApiResponse::ok(sectors)
}

pub async fn get_sector_stats(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(sector): Path<String>,
) -> ApiResponse<SectorStatsResponse> {
    let pool = state.conn.clone();
    let team_id = ctx.team_id;
    let name = sector.clone();
    let counts = tokio::task::spawn_blocking(move || stats::sector_stats(&pool, team_id, &name))
        .await
        .unwrap_or_else(|e| {
            error!("Sector stats task for {sector} failed: {e}");
            StatusCounts::default()
        });
    ApiResponse::ok(SectorStatsResponse { sector, counts })
}

pub async fn lookup_sic(Path(code): Path<String>) -> ApiResult<sic::SicMatch> {
    sic::lookup(&code)
        .map(ApiResponse::ok)
        .ok_or_else(|| ApiError::NotFound(format!("no sector for SIC {code}")))
}

pub async fn search_sic(Query(query): Query<SicSearchQuery>) -> ApiResult<Vec<&'static sic::SicCode>> {
    let codes = match (&query.q, &query.sector, query.high_volume) {
        (Some(q), _, _) => sic::search(q),
        (None, Some(sector), _) => sic::codes_for_sector(sector),
        (None, None, Some(true)) => sic::high_volume(),
        _ => return Err(ApiError::bad_request("one of q, sector or high_volume is required")),
    };
    Ok(ApiResponse::ok(codes))
}

pub fn configure_sector_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/sectors", get(list_sectors))
        .route("/api/sectors/sic", get(search_sic))
        .route("/api/sectors/sic/:code", get(lookup_sic))
        .route("/api/sectors/:sector/stats", get(get_sector_stats))
}
