pub mod classification;
pub mod labels;

use axum::{
    extract::{Path, Query, State},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::core::shared::schema::leads;
use crate::core::shared::{normalize_phone, ApiError, ApiResponse, ApiResult, AppState};
use crate::core::tenant::TeamContext;
use crate::sectors::sic;
use crate::sms::queue::OptOutOrigin;

use classification::{classify, ResponseKind};
use labels::{apply_labels, LabelingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    New,
    Contacted,
    Responded,
    Qualified,
    Nurture,
    Closed,
    OptedOut,
    Invalid,
}

impl LeadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Contacted => "contacted",
            Self::Responded => "responded",
            Self::Qualified => "qualified",
            Self::Nurture => "nurture",
            Self::Closed => "closed",
            Self::OptedOut => "opted_out",
            Self::Invalid => "invalid",
        }
    }
}

impl FromStr for LeadStatus {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "new" => Self::New,
            "contacted" => Self::Contacted,
            "responded" => Self::Responded,
            "qualified" => Self::Qualified,
            "nurture" => Self::Nurture,
            "closed" => Self::Closed,
            "opted_out" => Self::OptedOut,
            "invalid" => Self::Invalid,
            other => return Err(ApiError::bad_request(format!("unknown lead status: {other}"))),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = leads)]
pub struct Lead {
    pub id: Uuid,
    pub team_id: Uuid,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub sic_code: Option<String>,
    pub sector: Option<String>,
    pub status: String,
    pub tags: Vec<String>,
    pub priority_score: i32,
    pub source: Option<String>,
    pub bucket_id: Option<Uuid>,
    pub notes: Option<String>,
    pub last_contacted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    pub fn full_name(&self) -> String {
        [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn is_opted_out(&self) -> bool {
        self.status == LeadStatus::OptedOut.as_str()
            || self.tags.iter().any(|t| t == labels::OPTED_OUT)
    }
}

/// Writable lead fields. Used for create, partial update and import rows.
#[derive(Debug, Clone, Default, Deserialize, AsChangeset)]
#[diesel(table_name = leads)]
pub struct LeadInput {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub sic_code: Option<String>,
    pub sector: Option<String>,
    pub source: Option<String>,
    pub notes: Option<String>,
    pub tags: Option<Vec<String>>,
    pub bucket_id: Option<Uuid>,
}

impl LeadInput {
    /// Trims blanks to `None`, normalises phone and email, fills the sector
    /// from the SIC code when it is missing.
    pub fn cleaned(mut self) -> Self {
        fn tidy(v: Option<String>) -> Option<String> {
            v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
        }
        self.first_name = tidy(self.first_name);
        self.last_name = tidy(self.last_name);
        self.company = tidy(self.company);
        self.address = tidy(self.address);
        self.city = tidy(self.city);
        self.state = tidy(self.state);
        self.zip = tidy(self.zip);
        self.source = tidy(self.source);
        self.notes = tidy(self.notes);
        self.phone = tidy(self.phone)
            .map(|p| normalize_phone(&p))
            .filter(|p| !p.is_empty());
        self.email = tidy(self.email)
            .map(|e| e.to_lowercase())
            .filter(|e| e.contains('@'));
        self.sic_code = tidy(self.sic_code);
        self.sector = tidy(self.sector)
            .or_else(|| self.sic_code.as_deref().and_then(sic::sector_for).map(String::from));
        self
    }

    pub fn is_contactable(&self) -> bool {
        self.phone.is_some() || self.email.is_some()
    }

    fn into_lead(self, team_id: Uuid, now: DateTime<Utc>) -> Lead {
        Lead {
            id: Uuid::new_v4(),
            team_id,
            first_name: self.first_name,
            last_name: self.last_name,
            company: self.company,
            phone: self.phone,
            email: self.email,
            address: self.address,
            city: self.city,
            state: self.state,
            zip: self.zip,
            sic_code: self.sic_code,
            sector: self.sector,
            status: LeadStatus::New.as_str().to_string(),
            tags: self.tags.unwrap_or_default(),
            priority_score: labels::STANDARD,
            source: self.source,
            bucket_id: self.bucket_id,
            notes: self.notes,
            last_contacted_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub sector: Option<String>,
    pub tag: Option<String>,
    pub search: Option<String>,
    pub bucket_id: Option<Uuid>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    pub leads: Vec<LeadInput>,
    pub source: Option<String>,
    pub bucket_id: Option<Uuid>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

#[derive(Debug, Deserialize)]
pub struct LabelRequest {
    pub message: String,
}

pub fn find_lead(conn: &mut PgConnection, team_id: Uuid, id: Uuid) -> Result<Lead, ApiError> {
    leads::table
        .filter(leads::id.eq(id))
        .filter(leads::team_id.eq(team_id))
        .select(Lead::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| ApiError::not_found("lead"))
}

pub fn find_by_phone(
    conn: &mut PgConnection,
    team_id: Uuid,
    phone: &str,
) -> Result<Option<Lead>, ApiError> {
    let phone = normalize_phone(phone);
    if phone.is_empty() {
        return Ok(None);
    }
    Ok(leads::table
        .filter(leads::team_id.eq(team_id))
        .filter(leads::phone.eq(phone))
        .order(leads::updated_at.desc())
        .select(Lead::as_select())
        .first(conn)
        .optional()?)
}

pub fn set_status(
    conn: &mut PgConnection,
    team_id: Uuid,
    id: Uuid,
    status: LeadStatus,
) -> Result<Lead, ApiError> {
    diesel::update(
        leads::table
            .filter(leads::id.eq(id))
            .filter(leads::team_id.eq(team_id)),
    )
    .set((
        leads::status.eq(status.as_str()),
        leads::updated_at.eq(Utc::now()),
    ))
    .returning(Lead::as_returning())
    .get_result(conn)
    .optional()?
    .ok_or_else(|| ApiError::not_found("lead"))
}

/// Upserts rows within a team keyed on normalised phone, falling back to
/// email for phoneless rows. Existing leads take the incoming values; rows
/// with neither phone nor email are skipped.
pub fn import_leads(
    conn: &mut PgConnection,
    team_id: Uuid,
    rows: Vec<LeadInput>,
    source: Option<&str>,
    bucket_id: Option<Uuid>,
) -> Result<ImportSummary, ApiError> {
    conn.transaction(|conn| {
        let mut summary = ImportSummary::default();
        let now = Utc::now();

        for row in rows {
            let mut row = row.cleaned();
            if !row.is_contactable() {
                summary.skipped += 1;
                continue;
            }
            if row.source.is_none() {
                row.source = source.map(String::from);
            }
            if row.bucket_id.is_none() {
                row.bucket_id = bucket_id;
            }

            let existing: Option<Uuid> = match (&row.phone, &row.email) {
                (Some(phone), _) => leads::table
                    .filter(leads::team_id.eq(team_id))
                    .filter(leads::phone.eq(phone))
                    .select(leads::id)
                    .first(conn)
                    .optional()?,
                (None, Some(email)) => leads::table
                    .filter(leads::team_id.eq(team_id))
                    .filter(leads::email.eq(email))
                    .select(leads::id)
                    .first(conn)
                    .optional()?,
                (None, None) => None,
            };

            match existing {
                Some(id) => {
                    diesel::update(leads::table.filter(leads::id.eq(id)))
                        .set((&row, leads::updated_at.eq(now)))
                        .execute(conn)?;
                    summary.updated += 1;
                }
                None => {
                    diesel::insert_into(leads::table)
                        .values(&row.into_lead(team_id, now))
                        .execute(conn)?;
                    summary.inserted += 1;
                }
            }
        }

        Ok::<_, ApiError>(summary)
    })
}

/// Classifies `message`, merges the resulting labels into the lead's tags and
/// moves its status along. Opt-outs and wrong numbers are terminal.
pub fn label_lead(
    conn: &mut PgConnection,
    lead: &Lead,
    message: &str,
) -> Result<LabelingResult, ApiError> {
    let result = apply_labels(classify(message), &lead.tags);

    let status = match result.classification.kind {
        _ if result.classification.opt_out => LeadStatus::OptedOut,
        ResponseKind::WrongNumber => LeadStatus::Invalid,
        ResponseKind::NotInterested => LeadStatus::Nurture,
        _ => match lead.status.parse::<LeadStatus>() {
            Ok(LeadStatus::New) | Ok(LeadStatus::Contacted) | Err(_) => LeadStatus::Responded,
            Ok(current) => current,
        },
    };
    let email = lead
        .email
        .clone()
        .or_else(|| result.classification.email.clone());

    diesel::update(leads::table.filter(leads::id.eq(lead.id)))
        .set((
            leads::tags.eq(&result.tags),
            leads::priority_score.eq(result.priority_score),
            leads::status.eq(status.as_str()),
            leads::email.eq(email),
            leads::updated_at.eq(Utc::now()),
        ))
        .execute(conn)?;

    debug!(
        "Labelled lead {} as {}: +{:?} -{:?} score {}",
        lead.id,
        result.classification.kind,
        result.applied,
        result.removed,
        result.priority_score
    );
    Ok(result)
}

pub async fn list_leads(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<Lead>> {
    let mut conn = state.conn.get()?;

    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).max(0);

    let mut q = leads::table
        .filter(leads::team_id.eq(ctx.team_id))
        .select(Lead::as_select())
        .into_boxed();

    if let Some(status) = query.status {
        q = q.filter(leads::status.eq(status));
    }
    if let Some(sector) = query.sector {
        q = q.filter(leads::sector.eq(sector));
    }
    if let Some(bucket_id) = query.bucket_id {
        q = q.filter(leads::bucket_id.eq(bucket_id));
    }
    if let Some(tag) = query.tag {
        q = q.filter(leads::tags.contains(vec![tag]));
    }
    if let Some(search) = query.search.filter(|s| !s.trim().is_empty()) {
        let pattern = format!("%{}%", search.trim());
        q = q.filter(
            leads::first_name
                .ilike(pattern.clone())
                .or(leads::last_name.ilike(pattern.clone()))
                .or(leads::company.ilike(pattern.clone()))
                .or(leads::email.ilike(pattern.clone()))
                .or(leads::phone.ilike(pattern)),
        );
    }

    let rows = q
        .order(leads::created_at.desc())
        .limit(limit)
        .offset(offset)
        .load(&mut conn)?;

    Ok(ApiResponse::ok(rows))
}

pub async fn get_lead(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Lead> {
    let mut conn = state.conn.get()?;
    Ok(ApiResponse::ok(find_lead(&mut conn, ctx.team_id, id)?))
}

pub async fn create_lead(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Json(req): Json<LeadInput>,
) -> ApiResult<Lead> {
    let input = req.cleaned();
    if !input.is_contactable() {
        return Err(ApiError::bad_request("a lead needs a phone or an email"));
    }

    let lead = input.into_lead(ctx.team_id, Utc::now());
    let mut conn = state.conn.get()?;
    diesel::insert_into(leads::table)
        .values(&lead)
        .execute(&mut conn)?;

    info!("Created lead {} for team {}", lead.id, ctx.team_id);
    Ok(ApiResponse::created(lead))
}

pub async fn update_lead(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(id): Path<Uuid>,
    Json(req): Json<LeadInput>,
) -> ApiResult<Lead> {
    let changes = req.cleaned();
    let mut conn = state.conn.get()?;

    let lead = diesel::update(
        leads::table
            .filter(leads::id.eq(id))
            .filter(leads::team_id.eq(ctx.team_id)),
    )
    .set((&changes, leads::updated_at.eq(Utc::now())))
    .returning(Lead::as_returning())
    .get_result(&mut conn)
    .optional()?
    .ok_or_else(|| ApiError::not_found("lead"))?;

    Ok(ApiResponse::ok(lead))
}

pub async fn delete_lead(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Uuid> {
    let mut conn = state.conn.get()?;
    let deleted = diesel::delete(
        leads::table
            .filter(leads::id.eq(id))
            .filter(leads::team_id.eq(ctx.team_id)),
    )
    .execute(&mut conn)?;

    if deleted == 0 {
        return Err(ApiError::not_found("lead"));
    }
    Ok(ApiResponse::ok(id))
}

pub async fn update_lead_status(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(id): Path<Uuid>,
    Json(req): Json<StatusUpdate>,
) -> ApiResult<Lead> {
    let status: LeadStatus = req.status.parse()?;
    let mut conn = state.conn.get()?;
    let lead = set_status(&mut conn, ctx.team_id, id, status)?;

    if status == LeadStatus::OptedOut {
        if let Some(phone) = &lead.phone {
            state
                .sms_queue
                .add_opt_out(Some(ctx.team_id), phone, OptOutOrigin::Team)
                .await;
        }
    }
    Ok(ApiResponse::ok(lead))
}

pub async fn import_leads_handler(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Json(req): Json<ImportRequest>,
) -> ApiResult<ImportSummary> {
    if req.leads.is_empty() {
        return Err(ApiError::bad_request("no leads to import"));
    }

    let mut conn = state.conn.get()?;
    let summary = import_leads(
        &mut conn,
        ctx.team_id,
        req.leads,
        req.source.as_deref(),
        req.bucket_id,
    )?;

    info!(
        "Imported leads for team {}: {} new, {} updated, {} skipped",
        ctx.team_id, summary.inserted, summary.updated, summary.skipped
    );
    Ok(ApiResponse::ok(summary))
}

pub async fn label_lead_handler(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(id): Path<Uuid>,
    Json(req): Json<LabelRequest>,
) -> ApiResult<LabelingResult> {
    if req.message.trim().is_empty() {
        return Err(ApiError::bad_request("message is required"));
    }

    let mut conn = state.conn.get()?;
    let lead = find_lead(&mut conn, ctx.team_id, id)?;
    let result = label_lead(&mut conn, &lead, &req.message)?;

    if result.cancels_pending() {
        if let Some(phone) = &lead.phone {
            state
                .sms_queue
                .add_opt_out(Some(ctx.team_id), phone, OptOutOrigin::Team)
                .await;
        }
    }
    Ok(ApiResponse::ok(result))
}

pub fn configure_lead_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/leads", get(list_leads).post(create_lead))
        .route("/api/leads/import", post(import_leads_handler))
        .route(
            "/api/leads/:id",
            get(get_lead).put(update_lead).delete(delete_lead),
        )
        .route("/api/leads/:id/status", patch(update_lead_status))
        .route("/api/leads/:id/label", post(label_lead_handler))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn sample_lead(team_id: Uuid, first: &str, last: &str, phone: &str) -> Lead {
        LeadInput {
            first_name: Some(first.to_string()),
            last_name: Some(last.to_string()),
            phone: Some(phone.to_string()),
            company: Some("Ruiz Roofing".to_string()),
            city: Some("Austin".to_string()),
            ..Default::default()
        }
        .cleaned()
        .into_lead(team_id, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleaning_normalises_contact_fields() {
        let input = LeadInput {
            first_name: Some("  Ana ".into()),
            phone: Some("+1 (555) 010-2030".into()),
            email: Some("  ANA@Example.COM ".into()),
            sic_code: Some("1711".into()),
            company: Some("   ".into()),
            ..Default::default()
        }
        .cleaned();

        assert_eq!(input.first_name.as_deref(), Some("Ana"));
        assert_eq!(input.phone.as_deref(), Some("5550102030"));
        assert_eq!(input.email.as_deref(), Some("ana@example.com"));
        assert_eq!(input.sector.as_deref(), Some("construction-contractors"));
        assert_eq!(input.company, None);
        assert!(input.is_contactable());
    }

    #[test]
    fn rows_without_phone_or_email_are_not_contactable() {
        let input = LeadInput {
            phone: Some("n/a".into()),
            email: Some("nope".into()),
            ..Default::default()
        }
        .cleaned();
        assert!(!input.is_contactable());
    }

    #[test]
    fn statuses_parse_and_reject_unknown() {
        assert_eq!("opted_out".parse::<LeadStatus>().unwrap(), LeadStatus::OptedOut);
        assert!("archived".parse::<LeadStatus>().is_err());
    }

    #[test]
    fn new_lead_defaults() {
        let lead = LeadInput {
            first_name: Some("Ana".into()),
            last_name: Some("Ruiz".into()),
            email: Some("ana@example.com".into()),
            ..Default::default()
        }
        .into_lead(Uuid::new_v4(), Utc::now());

        assert_eq!(lead.status, "new");
        assert_eq!(lead.priority_score, labels::STANDARD);
        assert_eq!(lead.full_name(), "Ana Ruiz");
        assert!(!lead.is_opted_out());
    }
}
