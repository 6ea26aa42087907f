use axum::{
    extract::{Path, Query, State},
    routing::{delete, get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::limits::{self, SendCounts};
use super::queue::{
    DraftOptions, DraftSummary, DraftTarget, NewMessage, OptOutOrigin, QueueStats, QueueStatus,
    QueuedMessage,
};
use super::templates::{self, SegmentInfo, SmsTemplate, TemplateCategory};
use super::{log_message, SmsMessage, SmsSender};
use crate::core::shared::schema::leads;
use crate::core::shared::{normalize_phone, ApiError, ApiResponse, ApiResult, AppState};
use crate::core::tenant::TeamContext;
use crate::leads::{Lead, LeadStatus};

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub to: String,
    #[serde(alias = "message")]
    pub body: String,
    pub from: Option<String>,
    pub lead_id: Option<Uuid>,
    pub campaign_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct TemplateListQuery {
    pub category: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SegmentsRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct RenderRequest {
    pub template: String,
    pub lead_id: Option<Uuid>,
    #[serde(default)]
    pub vars: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct RenderResponse {
    pub text: String,
    pub segments: SegmentInfo,
    pub missing: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct QueueListQuery {
    pub status: Option<QueueStatus>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct DraftRequest {
    pub template: String,
    #[serde(default)]
    pub lead_ids: Vec<Uuid>,
    #[serde(default)]
    pub targets: Vec<DraftTarget>,
    #[serde(flatten)]
    pub options: DraftOptions,
}

#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EditRequest {
    pub body: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeployRequest {
    pub ids: Option<Vec<Uuid>>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct CleanupRequest {
    pub older_than_hours: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct OptOutRequest {
    pub phone: String,
}

#[derive(Debug, Serialize)]
pub struct OptOutStatus {
    pub phone: String,
    pub opted_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<OptOutOrigin>,
    pub cancelled: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessSummary {
    pub taken: usize,
    pub sent: usize,
    pub retrying: usize,
    pub failed: usize,
    pub remaining_today: u32,
}

#[derive(Debug, Serialize)]
pub struct Count {
    pub count: usize,
}

fn sender(state: &AppState) -> Result<Arc<dyn SmsSender>, ApiError> {
    state
        .sms_sender
        .clone()
        .ok_or(ApiError::NotConfigured("SMS provider"))
}

fn valid_phone(raw: &str) -> Result<String, ApiError> {
    let phone = normalize_phone(raw);
    if phone.len() != 10 {
        return Err(ApiError::bad_request(format!("invalid phone number: {raw}")));
    }
    Ok(phone)
}

/// Stamps the lead as contacted. A `new` lead moves to `contacted`.
pub fn mark_contacted(conn: &mut PgConnection, lead_id: Uuid) -> Result<(), ApiError> {
    let now = Utc::now();
    diesel::update(leads::table.filter(leads::id.eq(lead_id)))
        .set((leads::last_contacted_at.eq(now), leads::updated_at.eq(now)))
        .execute(conn)?;
    diesel::update(
        leads::table
            .filter(leads::id.eq(lead_id))
            .filter(leads::status.eq(LeadStatus::New.as_str())),
    )
    .set(leads::status.eq(LeadStatus::Contacted.as_str()))
    .execute(conn)?;
    Ok(())
}

pub async fn send_sms(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Json(req): Json<SendRequest>,
) -> ApiResult<SmsMessage> {
    let to = valid_phone(&req.to)?;
    if req.body.trim().is_empty() {
        return Err(ApiError::bad_request("message body is required"));
    }
    let sender = sender(&state)?;

    if state.sms_queue.is_opted_out(&to).await {
        return Err(ApiError::bad_request(format!("{to} has opted out")));
    }

    let mut conn = state.conn.get()?;
    let lead = match req.lead_id {
        Some(id) => Some(crate::leads::find_lead(&mut conn, ctx.team_id, id)?),
        None => crate::leads::find_by_phone(&mut conn, ctx.team_id, &to)?,
    };
    if lead.as_ref().is_some_and(Lead::is_opted_out) {
        return Err(ApiError::bad_request(format!("{to} has opted out")));
    }

    let counts = limits::sent_counts(&mut conn, ctx.team_id, Utc::now())?;
    if limits::remaining_today(state.sms_queue.config(), counts) == 0 {
        return Err(ApiError::bad_request("daily SMS limit reached"));
    }

    let outcome = sender.send(&to, req.from.as_deref(), &req.body).await?;
    let message = SmsMessage::outbound(
        ctx.team_id,
        lead.as_ref().map(|l| l.id),
        req.campaign_id,
        &to,
        &req.body,
        &outcome,
    );
    log_message(&mut conn, &message)?;
    if let Some(lead) = &lead {
        mark_contacted(&mut conn, lead.id)?;
    }

    info!("Sent SMS {} to {} for team {}", message.id, to, ctx.team_id);
    Ok(ApiResponse::created(message))
}

pub async fn list_templates(
    Query(query): Query<TemplateListQuery>,
) -> ApiResult<Vec<&'static SmsTemplate>> {
    let list = match query.category.as_deref() {
        Some(raw) => {
            let category = TemplateCategory::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown category: {raw}")))?;
            templates::by_category(category)
        }
        None => templates::LIBRARY.iter().collect(),
    };
    Ok(ApiResponse::ok(list))
}

pub async fn count_segments(Json(req): Json<SegmentsRequest>) -> ApiResponse<SegmentInfo> {
    ApiResponse::ok(templates::segments(&req.text))
}

pub async fn render_template(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Json(req): Json<RenderRequest>,
) -> ApiResult<RenderResponse> {
    let mut vars = HashMap::new();
    if let Some(id) = req.lead_id {
        let mut conn = state.conn.get()?;
        let lead = crate::leads::find_lead(&mut conn, ctx.team_id, id)?;
        vars = templates::lead_vars(&lead);
    }
    vars.extend(req.vars);

    let text = templates::render(&req.template, &vars);
    let missing = templates::placeholders(&text);
    Ok(ApiResponse::ok(RenderResponse {
        segments: templates::segments(&text),
        text,
        missing,
    }))
}

pub async fn list_queue(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Query(query): Query<QueueListQuery>,
) -> ApiResponse<Vec<QueuedMessage>> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    ApiResponse::ok(state.sms_queue.list(ctx.team_id, query.status, limit).await)
}

pub async fn queue_stats(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
) -> ApiResponse<QueueStats> {
    ApiResponse::ok(state.sms_queue.stats(ctx.team_id).await)
}

/// Drafts for explicit targets and/or team leads. Leads that are opted out
/// in the database count as opted out here too.
pub async fn create_drafts(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Json(req): Json<DraftRequest>,
) -> ApiResult<DraftSummary> {
    if req.template.trim().is_empty() {
        return Err(ApiError::bad_request("template is required"));
    }
    if req.lead_ids.is_empty() && req.targets.is_empty() {
        return Err(ApiError::bad_request("lead_ids or targets are required"));
    }

    let mut targets = req.targets;
    let mut opted_out = 0;
    if !req.lead_ids.is_empty() {
        let mut conn = state.conn.get()?;
        let rows: Vec<Lead> = leads::table
            .filter(leads::team_id.eq(ctx.team_id))
            .filter(leads::id.eq_any(req.lead_ids.clone()))
            .select(Lead::as_select())
            .load(&mut conn)?;
        for lead in rows {
            if lead.is_opted_out() {
                opted_out += 1;
                continue;
            }
            if let Some(phone) = lead.phone.clone() {
                targets.push(DraftTarget {
                    lead_id: Some(lead.id),
                    vars: templates::lead_vars(&lead),
                    phone,
                });
            }
        }
    }

    let mut summary = state
        .sms_queue
        .add_drafts(ctx.team_id, &req.template, targets, req.options)
        .await;
    summary.skipped_opted_out += opted_out;
    Ok(ApiResponse::created(summary))
}

pub async fn enqueue_message(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Json(req): Json<NewMessage>,
) -> ApiResult<QueuedMessage> {
    let msg = state.sms_queue.enqueue(ctx.team_id, req).await?;
    Ok(ApiResponse::created(msg))
}

pub async fn approve_message(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(id): Path<Uuid>,
) -> ApiResult<QueuedMessage> {
    Ok(ApiResponse::ok(state.sms_queue.approve(ctx.team_id, id).await?))
}

pub async fn approve_campaign(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(campaign_id): Path<Uuid>,
) -> ApiResponse<Count> {
    let count = state
        .sms_queue
        .approve_campaign(ctx.team_id, campaign_id)
        .await;
    ApiResponse::ok(Count { count })
}

pub async fn reject_message(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(id): Path<Uuid>,
    Json(req): Json<RejectRequest>,
) -> ApiResult<QueuedMessage> {
    let msg = state.sms_queue.reject(ctx.team_id, id, req.reason).await?;
    Ok(ApiResponse::ok(msg))
}

pub async fn edit_message(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(id): Path<Uuid>,
    Json(req): Json<EditRequest>,
) -> ApiResult<QueuedMessage> {
    let msg = state.sms_queue.edit(ctx.team_id, id, req.body).await?;
    Ok(ApiResponse::ok(msg))
}

pub async fn deploy_approved(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Json(req): Json<DeployRequest>,
) -> ApiResponse<Count> {
    let count = state
        .sms_queue
        .deploy_approved(ctx.team_id, req.ids.as_deref(), req.scheduled_at)
        .await;
    ApiResponse::ok(Count { count })
}

pub async fn cancel_lead_messages(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(lead_id): Path<Uuid>,
) -> ApiResponse<Count> {
    let count = state.sms_queue.cancel_lead(ctx.team_id, lead_id).await;
    ApiResponse::ok(Count { count })
}

pub async fn cleanup_queue(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Json(req): Json<CleanupRequest>,
) -> ApiResponse<Count> {
    let hours = req.older_than_hours.unwrap_or(24).max(0);
    let count = state
        .sms_queue
        .cleanup(ctx.team_id, Utc::now() - Duration::hours(hours))
        .await;
    ApiResponse::ok(Count { count })
}

pub async fn add_opt_out(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Json(req): Json<OptOutRequest>,
) -> ApiResult<OptOutStatus> {
    let phone = valid_phone(&req.phone)?;
    let cancelled = state
        .sms_queue
        .add_opt_out(Some(ctx.team_id), &phone, OptOutOrigin::Team)
        .await;
    let origin = state.sms_queue.opt_out(&phone).await.map(|o| o.origin);
    Ok(ApiResponse::ok(OptOutStatus {
        phone,
        opted_out: true,
        origin,
        cancelled,
    }))
}

pub async fn get_opt_out(
    State(state): State<Arc<AppState>>,
    _ctx: TeamContext,
    Path(phone): Path<String>,
) -> ApiResult<OptOutStatus> {
    let phone = valid_phone(&phone)?;
    let entry = state.sms_queue.opt_out(&phone).await;
    Ok(ApiResponse::ok(OptOutStatus {
        phone,
        opted_out: entry.is_some(),
        origin: entry.map(|o| o.origin),
        cancelled: 0,
    }))
}

pub async fn remove_opt_out(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(phone): Path<String>,
) -> ApiResult<OptOutStatus> {
    let phone = valid_phone(&phone)?;
    if !state.sms_queue.remove_opt_out(ctx.team_id, &phone).await? {
        return Err(ApiError::not_found("opt-out"));
    }
    Ok(ApiResponse::ok(OptOutStatus {
        phone,
        opted_out: false,
        origin: None,
        cancelled: 0,
    }))
}

/// Sends one batch of due pending messages for a team. Successful sends are
/// logged to `sms_messages`; failures go back for retry.
pub async fn process_batch(
    state: &AppState,
    sender: &dyn SmsSender,
    team_id: Uuid,
    now: DateTime<Utc>,
    counts: SendCounts,
) -> ProcessSummary {
    let queue = &state.sms_queue;
    let batch = queue
        .take_batch(team_id, now, counts.today, counts.this_hour)
        .await;
    let mut summary = ProcessSummary {
        taken: batch.len(),
        ..Default::default()
    };

    for msg in batch {
        match sender.send(&msg.to, None, &msg.body).await {
            Ok(outcome) => {
                if let Err(e) = queue
                    .mark_sent(team_id, msg.id, outcome.provider_message_id.clone(), now)
                    .await
                {
                    warn!("Queue entry {} vanished after send: {e}", msg.id);
                }
                summary.sent += 1;

                let row = SmsMessage::outbound(
                    team_id,
                    msg.lead_id,
                    msg.campaign_id,
                    &msg.to,
                    &msg.body,
                    &outcome,
                );
                let logged = state.conn.get().map_err(ApiError::from).and_then(|mut conn| {
                    log_message(&mut conn, &row)?;
                    if let Some(lead_id) = msg.lead_id {
                        mark_contacted(&mut conn, lead_id)?;
                    }
                    Ok(())
                });
                if let Err(e) = logged {
                    warn!("Sent {} but could not log it: {e}", msg.id);
                }
            }
            Err(e) => match queue.mark_failed(team_id, msg.id, &e.to_string(), now).await {
                Ok(QueueStatus::Failed) => summary.failed += 1,
                Ok(_) => summary.retrying += 1,
                Err(e) => warn!("Queue entry {} vanished after failure: {e}", msg.id),
            },
        }
    }

    let after = SendCounts {
        today: counts.today + summary.sent as u32,
        this_hour: counts.this_hour + summary.sent as u32,
    };
    summary.remaining_today = limits::remaining_today(queue.config(), after);
    summary
}

pub async fn process_queue(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
) -> ApiResult<ProcessSummary> {
    let sender = sender(&state)?;
    let now = Utc::now();
    let counts = {
        let mut conn = state.conn.get()?;
        limits::sent_counts(&mut conn, ctx.team_id, now)?
    };

    let summary = process_batch(&state, sender.as_ref(), ctx.team_id, now, counts).await;
    info!(
        "Processed SMS queue for team {}: {} taken, {} sent, {} retrying, {} failed",
        ctx.team_id, summary.taken, summary.sent, summary.retrying, summary.failed
    );
    Ok(ApiResponse::ok(summary))
}

pub fn configure_sms_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/sms/send", post(send_sms))
        .route("/api/sms/templates", get(list_templates))
        .route("/api/sms/templates/render", post(render_template))
        .route("/api/sms/segments", post(count_segments))
        .route("/api/sms/queue", get(list_queue).post(enqueue_message))
        .route("/api/sms/queue/stats", get(queue_stats))
        .route("/api/sms/queue/drafts", post(create_drafts))
        .route("/api/sms/queue/deploy", post(deploy_approved))
        .route("/api/sms/queue/process", post(process_queue))
        .route("/api/sms/queue/cleanup", post(cleanup_queue))
        .route(
            "/api/sms/queue/campaign/:campaign_id/approve",
            post(approve_campaign),
        )
        .route("/api/sms/queue/lead/:lead_id", delete(cancel_lead_messages))
        .route("/api/sms/queue/:id", patch(edit_message))
        .route("/api/sms/queue/:id/approve", post(approve_message))
        .route("/api/sms/queue/:id/reject", post(reject_message))
        .route("/api/sms/opt-outs", post(add_opt_out))
        .route(
            "/api/sms/opt-outs/:phone",
            get(get_opt_out).delete(remove_opt_out),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shared::test_utils::TestAppStateBuilder;
    use crate::sms::testing::RecordingSender;
    use chrono::TimeZone;

    fn open_hours() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 14, 10, 0, 0).unwrap()
    }

    fn message(to: &str) -> NewMessage {
        NewMessage {
            lead_id: None,
            campaign_id: None,
            to: to.to_string(),
            body: "hello".to_string(),
            agent: None,
            priority: None,
            scheduled_at: None,
        }
    }

    #[tokio::test]
    async fn processes_a_batch_and_counts_outcomes() {
        let state = TestAppStateBuilder::new().build();
        let team = Uuid::new_v4();
        state.sms_queue.enqueue(team, message("5550000001")).await.unwrap();
        state.sms_queue.enqueue(team, message("5550000002")).await.unwrap();

        let sender = RecordingSender::default();
        let summary =
            process_batch(&state, &sender, team, open_hours(), SendCounts::default()).await;

        assert_eq!(summary.taken, 2);
        assert_eq!(summary.sent, 2);
        assert_eq!(summary.remaining_today, 1998);
        assert_eq!(sender.sent.lock().unwrap().len(), 2);
        assert_eq!(state.sms_queue.stats(team).await.sent, 2);
    }

    #[tokio::test]
    async fn failed_sends_are_retried() {
        let state = TestAppStateBuilder::new().build();
        let team = Uuid::new_v4();
        state.sms_queue.enqueue(team, message("5550000001")).await.unwrap();

        let sender = RecordingSender {
            fail: true,
            ..Default::default()
        };
        let summary =
            process_batch(&state, &sender, team, open_hours(), SendCounts::default()).await;

        assert_eq!((summary.sent, summary.retrying), (0, 1));
        assert_eq!(state.sms_queue.stats(team).await.pending, 1);
    }

    #[test]
    fn phone_validation() {
        assert_eq!(valid_phone("+1 (555) 000-0001").unwrap(), "5550000001");
        assert!(valid_phone("911").is_err());
    }
}
