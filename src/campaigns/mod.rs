use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use diesel::dsl::count_star;
use diesel::prelude::*;
use diesel::PgConnection;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::core::shared::schema::{campaign_leads, campaigns, leads};
use crate::core::shared::{ApiError, ApiResponse, ApiResult, AppState, DbPool};
use crate::core::tenant::TeamContext;
use crate::leads::Lead;
use crate::sms::queue::{DraftOptions, DraftSummary, DraftTarget, DEFAULT_AGENT};
use crate::sms::templates::lead_vars;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Completed,
}

impl CampaignStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }

    /// Completed is terminal; everything else may pause, resume or finish.
    pub fn can_become(self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Completed, _) => false,
            (_, Draft) => false,
            (Draft, Active) | (Paused, Active) => true,
            (Active, Paused) => true,
            (_, Completed) => true,
            _ => false,
        }
    }
}

impl FromStr for CampaignStatus {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            other => Err(ApiError::bad_request(format!(
                "unknown campaign status: {other}"
            ))),
        }
    }
}

pub mod enrollment {
    pub const ENROLLED: &str = "enrolled";
    pub const QUEUED: &str = "queued";
    pub const CONTACTED: &str = "contacted";
    pub const RESPONDED: &str = "responded";
    pub const OPTED_OUT: &str = "opted_out";
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = campaigns)]
pub struct Campaign {
    pub id: Uuid,
    pub team_id: Uuid,
    pub name: String,
    pub status: String,
    pub channel: String,
    pub template: String,
    pub agent: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    pub fn current_status(&self) -> Result<CampaignStatus, ApiError> {
        self.status.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = campaign_leads)]
pub struct CampaignLead {
    pub campaign_id: Uuid,
    pub lead_id: Uuid,
    pub team_id: Uuid,
    pub status: String,
    pub enrolled_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateCampaignRequest {
    pub name: String,
    pub template: String,
    pub channel: Option<String>,
    pub agent: Option<String>,
}

#[derive(Debug, Default, Deserialize, AsChangeset)]
#[diesel(table_name = campaigns)]
pub struct UpdateCampaignRequest {
    pub name: Option<String>,
    pub status: Option<String>,
    pub template: Option<String>,
    pub agent: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CampaignListQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EnrollRequest {
    pub lead_ids: Vec<Uuid>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct EnrollSummary {
    pub requested: usize,
    pub enrolled: usize,
    pub already_enrolled: usize,
    pub not_found: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CampaignStats {
    pub enrolled: i64,
    pub queued: i64,
    pub contacted: i64,
    pub responded: i64,
    pub opted_out: i64,
    pub total: i64,
}

impl CampaignStats {
    pub fn from_rows<'a>(rows: impl IntoIterator<Item = (&'a str, i64)>) -> Self {
        let mut stats = Self::default();
        for (status, n) in rows {
            match status {
                enrollment::ENROLLED => stats.enrolled += n,
                enrollment::QUEUED => stats.queued += n,
                enrollment::CONTACTED => stats.contacted += n,
                enrollment::RESPONDED => stats.responded += n,
                enrollment::OPTED_OUT => stats.opted_out += n,
                _ => {}
            }
            stats.total += n;
        }
        stats
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchSummary {
    pub campaign_id: Uuid,
    pub drafts: DraftSummary,
    pub skipped_opted_out: usize,
    pub skipped_no_phone: usize,
}

/// Draft recipients for a launch. Opted-out leads and leads without a phone
/// are counted and left out.
pub fn launch_targets(leads: &[Lead]) -> (Vec<DraftTarget>, usize, usize) {
    let mut targets = Vec::with_capacity(leads.len());
    let mut opted_out = 0;
    let mut no_phone = 0;

    for lead in leads {
        if lead.is_opted_out() {
            opted_out += 1;
            continue;
        }
        let Some(phone) = lead.phone.clone() else {
            no_phone += 1;
            continue;
        };
        targets.push(DraftTarget {
            lead_id: Some(lead.id),
            phone,
            vars: lead_vars(lead),
        });
    }
    (targets, opted_out, no_phone)
}

pub fn find_campaign(
    conn: &mut PgConnection,
    team_id: Uuid,
    id: Uuid,
) -> Result<Campaign, ApiError> {
    campaigns::table
        .filter(campaigns::id.eq(id))
        .filter(campaigns::team_id.eq(team_id))
        .select(Campaign::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| ApiError::not_found("campaign"))
}

fn query_stats(pool: &DbPool, team_id: Uuid, campaign_id: Uuid) -> Result<CampaignStats, String> {
    let mut conn = pool.get().map_err(|e| e.to_string())?;
    let rows: Vec<(String, i64)> = campaign_leads::table
        .filter(campaign_leads::team_id.eq(team_id))
        .filter(campaign_leads::campaign_id.eq(campaign_id))
        .group_by(campaign_leads::status)
        .select((campaign_leads::status, count_star()))
        .load(&mut conn)
        .map_err(|e| e.to_string())?;
    Ok(CampaignStats::from_rows(
        rows.iter().map(|(s, n)| (s.as_str(), *n)),
    ))
}

/// Never fails: a database error is logged and reads as all zeros.
pub fn campaign_stats(pool: &DbPool, team_id: Uuid, campaign_id: Uuid) -> CampaignStats {
    query_stats(pool, team_id, campaign_id).unwrap_or_else(|e| {
        error!("Stats for campaign {campaign_id} failed, returning zeros: {e}");
        CampaignStats::default()
    })
}

pub async fn list_campaigns(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Query(query): Query<CampaignListQuery>,
) -> ApiResult<Vec<Campaign>> {
    let mut conn = state.conn.get()?;
    let mut q = campaigns::table
        .filter(campaigns::team_id.eq(ctx.team_id))
        .select(Campaign::as_select())
        .into_boxed();
    if let Some(status) = query.status {
        let status: CampaignStatus = status.parse()?;
        q = q.filter(campaigns::status.eq(status.as_str()));
    }
    let rows = q.order(campaigns::created_at.desc()).load(&mut conn)?;
    Ok(ApiResponse::ok(rows))
}

pub async fn get_campaign(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Campaign> {
    let mut conn = state.conn.get()?;
    Ok(ApiResponse::ok(find_campaign(&mut conn, ctx.team_id, id)?))
}

pub async fn create_campaign(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Json(req): Json<CreateCampaignRequest>,
) -> ApiResult<Campaign> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("campaign name is required"));
    }
    if req.template.trim().is_empty() {
        return Err(ApiError::bad_request("campaign template is required"));
    }

    let now = Utc::now();
    let campaign = Campaign {
        id: Uuid::new_v4(),
        team_id: ctx.team_id,
        name: name.to_string(),
        status: CampaignStatus::Draft.as_str().to_string(),
        channel: req.channel.unwrap_or_else(|| "sms".to_string()),
        template: req.template,
        agent: req.agent.unwrap_or_else(|| DEFAULT_AGENT.to_string()),
        created_at: now,
        updated_at: now,
    };

    let mut conn = state.conn.get()?;
    diesel::insert_into(campaigns::table)
        .values(&campaign)
        .execute(&mut conn)?;

    info!("Created campaign {} for team {}", campaign.id, ctx.team_id);
    Ok(ApiResponse::created(campaign))
}

pub async fn update_campaign(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(id): Path<Uuid>,
    Json(mut req): Json<UpdateCampaignRequest>,
) -> ApiResult<Campaign> {
    let mut conn = state.conn.get()?;
    let current = find_campaign(&mut conn, ctx.team_id, id)?;

    if let Some(next) = req.status.as_deref() {
        let next: CampaignStatus = next.parse()?;
        let from = current.current_status()?;
        if !from.can_become(next) {
            return Err(ApiError::bad_request(format!(
                "campaign cannot move from {} to {}",
                from.as_str(),
                next.as_str()
            )));
        }
        req.status = Some(next.as_str().to_string());
    }
    if req.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        return Err(ApiError::bad_request("campaign name cannot be empty"));
    }

    let updated = diesel::update(campaigns::table.filter(campaigns::id.eq(current.id)))
        .set((&req, campaigns::updated_at.eq(Utc::now())))
        .returning(Campaign::as_returning())
        .get_result(&mut conn)?;
    Ok(ApiResponse::ok(updated))
}

pub async fn delete_campaign(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Uuid> {
    let mut conn = state.conn.get()?;
    let deleted = diesel::delete(
        campaigns::table
            .filter(campaigns::id.eq(id))
            .filter(campaigns::team_id.eq(ctx.team_id)),
    )
    .execute(&mut conn)?;
    if deleted == 0 {
        return Err(ApiError::not_found("campaign"));
    }
    let cancelled = state.sms_queue.cancel_campaign(ctx.team_id, id).await;
    info!("Deleted campaign {id}, cancelled {cancelled} queued messages");
    Ok(ApiResponse::ok(id))
}

/// Enrolls team leads. Re-enrolling is a no-op.
pub async fn enroll_leads(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(id): Path<Uuid>,
    Json(req): Json<EnrollRequest>,
) -> ApiResult<EnrollSummary> {
    if req.lead_ids.is_empty() {
        return Err(ApiError::bad_request("lead_ids is required"));
    }

    let mut conn = state.conn.get()?;
    let campaign = find_campaign(&mut conn, ctx.team_id, id)?;

    let mut requested = req.lead_ids.clone();
    requested.sort();
    requested.dedup();

    let owned: Vec<Uuid> = leads::table
        .filter(leads::team_id.eq(ctx.team_id))
        .filter(leads::id.eq_any(requested.clone()))
        .select(leads::id)
        .load(&mut conn)?;

    let now = Utc::now();
    let rows: Vec<CampaignLead> = owned
        .iter()
        .map(|lead_id| CampaignLead {
            campaign_id: campaign.id,
            lead_id: *lead_id,
            team_id: ctx.team_id,
            status: enrollment::ENROLLED.to_string(),
            enrolled_at: now,
        })
        .collect();

    let enrolled = diesel::insert_into(campaign_leads::table)
        .values(&rows)
        .on_conflict((campaign_leads::campaign_id, campaign_leads::lead_id))
        .do_nothing()
        .execute(&mut conn)?;

    let summary = EnrollSummary {
        requested: requested.len(),
        enrolled,
        already_enrolled: owned.len() - enrolled,
        not_found: requested.len() - owned.len(),
    };
    info!(
        "Enrolled {} leads in campaign {} ({} already in, {} unknown)",
        summary.enrolled, campaign.id, summary.already_enrolled, summary.not_found
    );
    Ok(ApiResponse::ok(summary))
}

pub async fn get_campaign_stats(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(id): Path<Uuid>,
) -> ApiResponse<CampaignStats> {
    let pool = state.conn.clone();
    let team_id = ctx.team_id;
    let stats = tokio::task::spawn_blocking(move || campaign_stats(&pool, team_id, id))
        .await
        .unwrap_or_else(|e| {
            error!("Stats task for campaign {id} failed: {e}");
            CampaignStats::default()
        });
    ApiResponse::ok(stats)
}

/// Renders the template for every enrolled lead into review drafts and
/// marks the campaign active.
pub async fn launch_campaign(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(id): Path<Uuid>,
) -> ApiResult<LaunchSummary> {
    let mut conn = state.conn.get()?;
    let campaign = find_campaign(&mut conn, ctx.team_id, id)?;
    let status = campaign.current_status()?;
    if !status.can_become(CampaignStatus::Active) {
        return Err(ApiError::bad_request(format!(
            "a {} campaign cannot be launched",
            status.as_str()
        )));
    }

    let enrolled: Vec<Lead> = campaign_leads::table
        .inner_join(leads::table)
        .filter(campaign_leads::campaign_id.eq(campaign.id))
        .filter(campaign_leads::team_id.eq(ctx.team_id))
        .filter(campaign_leads::status.eq(enrollment::ENROLLED))
        .select(Lead::as_select())
        .load(&mut conn)?;

    let (targets, skipped_opted_out, skipped_no_phone) = launch_targets(&enrolled);

    let drafts = state
        .sms_queue
        .add_drafts(
            ctx.team_id,
            &campaign.template,
            targets,
            DraftOptions {
                campaign_id: Some(campaign.id),
                agent: Some(campaign.agent.clone()),
                priority: None,
            },
        )
        .await;

    // Only leads the queue accepted move to `queued`.
    let now = Utc::now();
    let committed = conn.transaction(|conn| {
        diesel::update(
            campaign_leads::table
                .filter(campaign_leads::campaign_id.eq(campaign.id))
                .filter(campaign_leads::lead_id.eq_any(drafts.lead_ids.clone())),
        )
        .set(campaign_leads::status.eq(enrollment::QUEUED))
        .execute(conn)?;
        diesel::update(campaigns::table.filter(campaigns::id.eq(campaign.id)))
            .set((
                campaigns::status.eq(CampaignStatus::Active.as_str()),
                campaigns::updated_at.eq(now),
            ))
            .execute(conn)?;
        Ok::<_, ApiError>(())
    });
    if let Err(e) = committed {
        let discarded = state.sms_queue.discard_drafts(ctx.team_id, &drafts.ids).await;
        warn!(
            "Launch of campaign {} failed, discarded {discarded} drafts: {e}",
            campaign.id
        );
        return Err(e);
    }

    info!(
        "Launched campaign {}: {} drafts, {} opted out, {} without phone",
        campaign.id, drafts.added, skipped_opted_out, skipped_no_phone
    );
    Ok(ApiResponse::ok(LaunchSummary {
        campaign_id: campaign.id,
        drafts,
        skipped_opted_out,
        skipped_no_phone,
    }))
}

pub fn configure_campaign_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/campaigns", get(list_campaigns).post(create_campaign))
        .route(
            "/api/campaigns/:id",
            get(get_campaign)
                .put(update_campaign)
                .delete(delete_campaign),
        )
        .route("/api/campaigns/:id/enroll", post(enroll_leads))
        .route("/api/campaigns/:id/stats", get(get_campaign_stats))
        .route("/api/campaigns/:id/launch", post(launch_campaign))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shared::test_utils::create_test_db_pool;
    use crate::leads::testing::sample_lead;

    #[test]
    fn status_transitions() {
        use CampaignStatus::*;
        assert!(Draft.can_become(Active));
        assert!(Active.can_become(Paused));
        assert!(Paused.can_become(Active));
        assert!(Paused.can_become(Completed));
        assert!(!Completed.can_become(Active));
        assert!(!Active.can_become(Draft));
        assert!(!Draft.can_become(Paused));
    }

    #[test]
    fn launch_skips_opted_out_and_phoneless_leads() {
        let team = Uuid::new_v4();
        let ok = sample_lead(team, "Ana", "Ruiz", "5550000001");
        let mut opted = sample_lead(team, "Bo", "Li", "5550000002");
        opted.status = "opted_out".to_string();
        let mut phoneless = sample_lead(team, "Cy", "Ng", "5550000003");
        phoneless.phone = None;

        let (targets, opted_out, no_phone) = launch_targets(&[ok.clone(), opted, phoneless]);
        assert_eq!((opted_out, no_phone), (1, 1));
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].lead_id, Some(ok.id));
        assert_eq!(targets[0].vars.get("firstName").map(String::as_str), Some("Ana"));
    }

    #[tokio::test]
    async fn only_drafted_leads_count_as_queued() {
        let team = Uuid::new_v4();
        let ok = sample_lead(team, "Ana", "Ruiz", "5550000001");
        let short = sample_lead(team, "Bo", "Li", "555-0102");
        let (targets, _, _) = launch_targets(&[ok.clone(), short]);
        assert_eq!(targets.len(), 2);

        let queue = crate::sms::queue::SmsQueue::new(Default::default());
        let drafts = queue
            .add_drafts(team, "Hi {firstName}", targets, DraftOptions::default())
            .await;
        assert_eq!(drafts.skipped_invalid, 1);
        assert_eq!(drafts.lead_ids, vec![ok.id]);
    }

    #[test]
    fn stats_fold_enrollment_rows() {
        let stats = CampaignStats::from_rows([("enrolled", 3), ("queued", 2), ("mystery", 1)]);
        assert_eq!(stats.enrolled, 3);
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.total, 6);
    }

    #[test]
    fn stats_read_as_zeros_when_the_database_is_down() {
        let stats = campaign_stats(&create_test_db_pool(), Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(stats, CampaignStats::default());
    }
}
