//! Team scoping. Every tenant-owned route takes a [`TeamContext`], which
//! resolves the team from `x-team-id` and, when an API token is configured,
//! checks the bearer credential.

use axum::{
    async_trait,
    extract::{FromRequestParts, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::core::shared::schema::teams;
use crate::core::shared::utils::slugify;
use crate::core::shared::{ApiError, ApiResponse, ApiResult, AppState};

pub const TEAM_HEADER: &str = "x-team-id";

#[derive(Debug, Clone, Copy)]
pub struct TeamContext {
    pub team_id: Uuid,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for TeamContext {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        check_bearer(&parts.headers, state.config.auth.api_token.as_deref())?;

        let raw = parts
            .headers
            .get(TEAM_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::Unauthorized(format!("missing {TEAM_HEADER} header")))?;

        let team_id = Uuid::parse_str(raw)
            .map_err(|_| ApiError::bad_request(format!("invalid {TEAM_HEADER}: {raw}")))?;

        Ok(Self { team_id })
    }
}

/// Missing credential is 401, a wrong one is 403. No token configured
/// means the check is off.
pub fn check_bearer(headers: &HeaderMap, expected: Option<&str>) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        return Ok(());
    };

    let provided = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?;

    if provided != expected {
        return Err(ApiError::Forbidden("invalid bearer token".to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = teams)]
pub struct Team {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub owner_email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTeamRequest {
    pub name: String,
    pub slug: Option<String>,
    pub owner_email: Option<String>,
}

pub async fn create_team(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateTeamRequest>,
) -> ApiResult<Team> {
    check_bearer(&headers, state.config.auth.api_token.as_deref())?;

    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("name is required"));
    }
    let slug = slugify(req.slug.as_deref().unwrap_or(name));
    if slug.is_empty() {
        return Err(ApiError::bad_request("name must contain letters or digits"));
    }

    let now = Utc::now();
    let team = Team {
        id: Uuid::new_v4(),
        name: name.to_string(),
        slug,
        owner_email: req.owner_email.filter(|e| e.contains('@')),
        created_at: now,
        updated_at: now,
    };

    let mut conn = state.conn.get()?;
    diesel::insert_into(teams::table)
        .values(&team)
        .execute(&mut conn)?;

    info!("Created team {} ({})", team.slug, team.id);
    Ok(ApiResponse::created(team))
}

pub async fn current_team(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
) -> ApiResult<Team> {
    let mut conn = state.conn.get()?;
    let team = teams::table
        .find(ctx.team_id)
        .select(Team::as_select())
        .first(&mut conn)
        .optional()?
        .ok_or_else(|| ApiError::not_found("team"))?;
    Ok(ApiResponse::ok(team))
}

pub fn configure_team_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/teams", post(create_team))
        .route("/api/teams/me", get(current_team))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(auth: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = auth {
            headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    #[test]
    fn bearer_check_is_off_without_token() {
        assert!(check_bearer(&headers_with(None), None).is_ok());
    }

    #[test]
    fn bearer_check_distinguishes_missing_and_wrong() {
        let missing = check_bearer(&headers_with(None), Some("s3cret")).unwrap_err();
        assert!(matches!(missing, ApiError::Unauthorized(_)));

        let wrong = check_bearer(&headers_with(Some("Bearer nope")), Some("s3cret")).unwrap_err();
        assert!(matches!(wrong, ApiError::Forbidden(_)));

        assert!(check_bearer(&headers_with(Some("Bearer s3cret")), Some("s3cret")).is_ok());
    }
}
