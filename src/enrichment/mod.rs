//! Contact and property enrichment through Apollo and RealEstateAPI.

pub mod apollo;
pub mod realestate;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use diesel::prelude::*;
use log::{info, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::core::shared::schema::leads;
use crate::core::shared::{normalize_phone, ApiError, ApiResponse, ApiResult, AppState};
use crate::core::tenant::TeamContext;
use crate::leads::{find_lead, Lead, LeadInput};
use crate::sdr::record_event;
use apollo::{ApolloClient, OrganizationResponse, PersonMatch, PersonMatchResponse};
use realestate::{
    BulkSkipTraceJob, PropertySearchResult, RealEstateClient, SavedSearch, SavedSearchInput,
    SkipTraceInput, SkipTraceResult, BULK_SKIP_TRACE_LIMIT,
};

#[derive(Debug, thiserror::Error)]
pub enum EnrichmentError {
    #[error("network error: {0}")]
    Network(String),
    #[error("{provider} error {status}: {message}")]
    Api {
        provider: &'static str,
        status: u16,
        message: String,
    },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("{0}")]
    Invalid(String),
    #[error("{given} inputs exceed the limit of {limit}")]
    TooMany { given: usize, limit: usize },
}

impl From<EnrichmentError> for ApiError {
    fn from(err: EnrichmentError) -> Self {
        match err {
            EnrichmentError::Invalid(_) | EnrichmentError::TooMany { .. } => {
                Self::BadRequest(err.to_string())
            }
            other => Self::Upstream(other.to_string()),
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(alias = "error")]
    message: Option<String>,
}

pub(crate) async fn read_json<T: DeserializeOwned>(
    provider: &'static str,
    response: reqwest::Response,
) -> Result<T, EnrichmentError> {
    let status = response.status();
    if !status.is_success() {
        let message = response
            .json::<ErrorBody>()
            .await
            .ok()
            .and_then(|b| b.message)
            .unwrap_or_else(|| status.to_string());
        return Err(EnrichmentError::Api {
            provider,
            status: status.as_u16(),
            message,
        });
    }
    response
        .json()
        .await
        .map_err(|e| EnrichmentError::Parse(e.to_string()))
}

/// Contact fields a trace can fill in. Existing values are kept unless
/// `overwrite` is set.
pub fn traced_contact(lead: &Lead, result: &SkipTraceResult, overwrite: bool) -> Option<LeadInput> {
    let phone = result
        .best_phone()
        .map(normalize_phone)
        .filter(|p| !p.is_empty())
        .filter(|p| overwrite || lead.phone.is_none())
        .filter(|p| lead.phone.as_deref() != Some(p.as_str()));
    let email = result
        .best_email()
        .map(|e| e.trim().to_lowercase())
        .filter(|_| overwrite || lead.email.is_none())
        .filter(|e| lead.email.as_deref() != Some(e.as_str()));

    if phone.is_none() && email.is_none() {
        return None;
    }
    Some(LeadInput {
        phone,
        email,
        ..Default::default()
    })
}

fn apollo_client(state: &AppState) -> Result<&ApolloClient, ApiError> {
    state.apollo.as_deref().ok_or(ApiError::NotConfigured("Apollo"))
}

fn realestate_client(state: &AppState) -> Result<&RealEstateClient, ApiError> {
    state
        .realestate
        .as_deref()
        .ok_or(ApiError::NotConfigured("RealEstateAPI"))
}

pub async fn match_person(
    State(state): State<Arc<AppState>>,
    _ctx: TeamContext,
    Json(req): Json<PersonMatch>,
) -> ApiResult<PersonMatchResponse> {
    let client = apollo_client(&state)?;
    Ok(ApiResponse::ok(client.match_person(&req).await?))
}

#[derive(Debug, Deserialize)]
pub struct OrganizationRequest {
    pub domain: String,
}

pub async fn enrich_organization(
    State(state): State<Arc<AppState>>,
    _ctx: TeamContext,
    Json(req): Json<OrganizationRequest>,
) -> ApiResult<OrganizationResponse> {
    let client = apollo_client(&state)?;
    Ok(ApiResponse::ok(client.enrich_organization(&req.domain).await?))
}

#[derive(Debug, Deserialize)]
pub struct SkipTraceRequest {
    pub lead_id: Option<Uuid>,
    #[serde(flatten)]
    pub input: SkipTraceInput,
    /// Write the traced phone/email back to the lead.
    #[serde(default)]
    pub apply: bool,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Serialize)]
pub struct SkipTraceResponse {
    pub result: SkipTraceResult,
    pub lead: Option<Lead>,
    pub updated: bool,
}

pub async fn skip_trace(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Json(req): Json<SkipTraceRequest>,
) -> ApiResult<SkipTraceResponse> {
    let client = realestate_client(&state)?;

    let lead = match req.lead_id {
        Some(id) => {
            let mut conn = state.conn.get()?;
            Some(find_lead(&mut conn, ctx.team_id, id)?)
        }
        None => None,
    };
    let input = match &lead {
        Some(lead) if req.input == SkipTraceInput::default() => SkipTraceInput::from_lead(lead),
        _ => req.input,
    };

    let result = client.skip_trace(&input).await?;
    let (lead, updated) = match lead {
        Some(lead) if req.apply => match traced_contact(&lead, &result, req.overwrite) {
            Some(changes) => {
                let mut conn = state.conn.get()?;
                let saved: Lead = diesel::update(leads::table.filter(leads::id.eq(lead.id)))
                    .set((&changes, leads::updated_at.eq(Utc::now())))
                    .returning(Lead::as_returning())
                    .get_result(&mut conn)?;
                record_event(
                    &mut conn,
                    ctx.team_id,
                    Some(saved.id),
                    "lead.skip_traced",
                    &format!("Skip trace updated {}", saved.full_name()),
                    serde_json::json!({ "phone": changes.phone, "email": changes.email }),
                )?;
                (Some(saved), true)
            }
            None => (Some(lead), false),
        },
        other => (other, false),
    };

    Ok(ApiResponse::ok(SkipTraceResponse {
        result,
        lead,
        updated,
    }))
}

#[derive(Debug, Deserialize)]
pub struct BulkSkipTraceRequest {
    #[serde(default)]
    pub lead_ids: Vec<Uuid>,
    #[serde(default)]
    pub inputs: Vec<SkipTraceInput>,
    pub webhook_url: Option<String>,
}

pub async fn bulk_skip_trace(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Json(req): Json<BulkSkipTraceRequest>,
) -> ApiResult<BulkSkipTraceJob> {
    let client = realestate_client(&state)?;
    if req.lead_ids.len() + req.inputs.len() > BULK_SKIP_TRACE_LIMIT {
        return Err(EnrichmentError::TooMany {
            given: req.lead_ids.len() + req.inputs.len(),
            limit: BULK_SKIP_TRACE_LIMIT,
        }
        .into());
    }

    let mut inputs = req.inputs;
    if !req.lead_ids.is_empty() {
        let mut conn = state.conn.get()?;
        let rows: Vec<Lead> = leads::table
            .filter(leads::team_id.eq(ctx.team_id))
            .filter(leads::id.eq_any(req.lead_ids.clone()))
            .select(Lead::as_select())
            .load(&mut conn)?;
        if rows.len() < req.lead_ids.len() {
            warn!(
                "Bulk skip trace for team {}: {} of {} leads not found",
                ctx.team_id,
                req.lead_ids.len() - rows.len(),
                req.lead_ids.len()
            );
        }
        inputs.extend(rows.iter().map(SkipTraceInput::from_lead));
    }
    inputs.retain(SkipTraceInput::is_traceable);

    let job = client
        .bulk_skip_trace(&inputs, req.webhook_url.as_deref())
        .await?;
    info!("Team {} started bulk skip trace {}", ctx.team_id, job.job_id);
    Ok(ApiResponse::created(job))
}

pub async fn bulk_skip_trace_status(
    State(state): State<Arc<AppState>>,
    _ctx: TeamContext,
    Path(job_id): Path<String>,
) -> ApiResult<BulkSkipTraceJob> {
    let client = realestate_client(&state)?;
    Ok(ApiResponse::ok(client.bulk_skip_trace_status(&job_id).await?))
}

fn require_object(body: &Value) -> Result<(), ApiError> {
    match body {
        Value::Object(map) if !map.is_empty() => Ok(()),
        _ => Err(ApiError::bad_request("expected a non-empty JSON object")),
    }
}

pub async fn search_properties(
    State(state): State<Arc<AppState>>,
    _ctx: TeamContext,
    Json(filters): Json<Value>,
) -> ApiResult<PropertySearchResult> {
    let client = realestate_client(&state)?;
    require_object(&filters)?;
    Ok(ApiResponse::ok(client.search_properties(&filters).await?))
}

pub async fn property_detail(
    State(state): State<Arc<AppState>>,
    _ctx: TeamContext,
    Json(query): Json<Value>,
) -> ApiResult<Value> {
    let client = realestate_client(&state)?;
    require_object(&query)?;
    Ok(ApiResponse::ok(client.property_detail(&query).await?))
}

pub async fn property_comps(
    State(state): State<Arc<AppState>>,
    _ctx: TeamContext,
    Json(query): Json<Value>,
) -> ApiResult<Value> {
    let client = realestate_client(&state)?;
    require_object(&query)?;
    Ok(ApiResponse::ok(client.property_comps(&query).await?))
}

pub async fn create_saved_search(
    State(state): State<Arc<AppState>>,
    _ctx: TeamContext,
    Json(req): Json<SavedSearchInput>,
) -> ApiResult<SavedSearch> {
    let client = realestate_client(&state)?;
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("name is required"));
    }
    require_object(&req.filters)?;
    Ok(ApiResponse::created(client.create_saved_search(&req).await?))
}

pub async fn list_saved_searches(
    State(state): State<Arc<AppState>>,
    _ctx: TeamContext,
) -> ApiResult<Vec<SavedSearch>> {
    let client = realestate_client(&state)?;
    Ok(ApiResponse::ok(client.list_saved_searches().await?))
}

pub fn configure_enrichment_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/enrichment/person", post(match_person))
        .route("/api/enrichment/organization", post(enrich_organization))
        .route("/api/enrichment/skip-trace", post(skip_trace))
        .route("/api/enrichment/skip-trace/bulk", post(bulk_skip_trace))
        .route("/api/enrichment/skip-trace/bulk/:job_id", get(bulk_skip_trace_status))
        .route("/api/property/search", post(search_properties))
        .route("/api/property/detail", post(property_detail))
        .route("/api/property/comps", post(property_comps))
        .route(
            "/api/property/saved-searches",
            get(list_saved_searches).post(create_saved_search),
        )
}

#[cfg(test)]
mod tests {
    use super::realestate::{SkipTraceOutput, TracedEmail, TracedPhone};
    use super::*;
    use crate::leads::testing::sample_lead;

    fn traced(phone: &str, email: &str) -> SkipTraceResult {
        SkipTraceResult {
            success: true,
            output: Some(SkipTraceOutput {
                phones: vec![TracedPhone {
                    phone_number: phone.to_string(),
                    phone_type: None,
                    is_connected: Some(true),
                    is_primary: Some(true),
                    score: None,
                }],
                emails: vec![TracedEmail {
                    email_address: email.to_string(),
                    is_valid: Some(true),
                    is_primary: Some(true),
                }],
                identity: None,
            }),
            match_score: Some(0.93),
        }
    }

    #[test]
    fn fills_only_missing_contact_fields() {
        let lead = sample_lead(Uuid::new_v4(), "Maria", "Ruiz", "5125550100");
        let changes = traced_contact(&lead, &traced("(512) 555-0199", "Maria@Ruiz.com"), false).unwrap();
        assert_eq!(changes.phone, None);
        assert_eq!(changes.email.as_deref(), Some("maria@ruiz.com"));
    }

    #[test]
    fn overwrite_replaces_a_different_phone() {
        let lead = sample_lead(Uuid::new_v4(), "Maria", "Ruiz", "5125550100");
        let changes = traced_contact(&lead, &traced("(512) 555-0199", "m@ruiz.com"), true).unwrap();
        assert_eq!(changes.phone.as_deref(), Some("5125550199"));
    }

    #[test]
    fn nothing_new_means_no_update() {
        let mut lead = sample_lead(Uuid::new_v4(), "Maria", "Ruiz", "5125550100");
        lead.email = Some("m@ruiz.com".into());
        assert!(traced_contact(&lead, &traced("5125550100", "m@ruiz.com"), true).is_none());
        assert!(traced_contact(&lead, &SkipTraceResult::default(), true).is_none());
    }

    #[test]
    fn bad_input_maps_to_400_and_upstream_to_500() {
        use axum::http::StatusCode;
        let too_many: ApiError = EnrichmentError::TooMany { given: 300, limit: 250 }.into();
        assert_eq!(too_many.status(), StatusCode::BAD_REQUEST);
        let upstream: ApiError = EnrichmentError::Network("reset".into()).into();
        assert_eq!(upstream.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
