//! Provider callbacks: inbound replies and delivery receipts.
//!
//! Webhooks carry no tenant header. The team comes from the `team_id` query
//! parameter configured on the provider webhook, falling back to whichever
//! team owns a lead with the sender's number. Unattributable messages are
//! acknowledged without being stored so the provider stops retrying.

use axum::{
    extract::{Query, State},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use diesel::prelude::*;
use diesel::PgConnection;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::queue::OptOutOrigin;
use super::signalhouse::Payload;
use super::{log_message, SmsMessage};
use crate::core::shared::schema::{leads, sms_messages};
use crate::core::shared::{normalize_phone, ApiError, ApiResponse, ApiResult, AppState};
use crate::leads::classification::is_opt_out;
use crate::leads::labels::{
    follow_ups, priority_tier, CallQueueConfig, FollowUps, LabelingResult, PriorityTier,
    WANTS_CALL,
};
use crate::leads::{find_by_phone, label_lead, Lead};
use crate::notifications::{NewNotification, Priority};
use crate::sdr::record_event;

#[derive(Debug, Deserialize)]
pub struct WebhookQuery {
    pub team_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct InboundPayload {
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(alias = "body", alias = "text")]
    pub message: String,
    #[serde(alias = "messageId", alias = "message_id")]
    pub id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusPayload {
    #[serde(alias = "messageId", alias = "message_id")]
    pub id: String,
    pub status: String,
}

#[derive(Debug, Default, Serialize)]
pub struct InboundReceipt {
    pub stored: bool,
    pub message_id: Option<Uuid>,
    pub team_id: Option<Uuid>,
    pub lead_id: Option<Uuid>,
    pub classification: Option<String>,
    pub opted_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_tier: Option<PriorityTier>,
    #[serde(skip_serializing_if = "FollowUps::is_empty")]
    pub follow_ups: FollowUps,
}

#[derive(Debug, Serialize)]
pub struct StatusReceipt {
    pub updated: usize,
}

fn lead_by_phone_any_team(conn: &mut PgConnection, phone: &str) -> Result<Option<Lead>, ApiError> {
    let phone = normalize_phone(phone);
    if phone.is_empty() {
        return Ok(None);
    }
    Ok(leads::table
        .filter(leads::phone.eq(phone))
        .order(leads::updated_at.desc())
        .select(Lead::as_select())
        .first(conn)
        .optional()?)
}

/// What the team should hear about a classified reply, if anything.
pub fn notification_for(
    lead: &Lead,
    result: &LabelingResult,
    plan: &FollowUps,
) -> Option<NewNotification> {
    let kind = result.classification.kind;
    let who = match lead.full_name() {
        name if name.is_empty() => lead.phone.clone().unwrap_or_else(|| "A lead".to_string()),
        name => name,
    };

    if result.applied.iter().any(|t| t == WANTS_CALL) {
        let mut body = plan
            .operator_notes
            .first()
            .cloned()
            .unwrap_or_else(|| format!("Reply classified as {kind}"));
        if let Some(at) = plan.call_at {
            body.push_str(&format!(", call at {}", at.format("%a %b %-d %H:%M UTC")));
        }
        return Some(NewNotification {
            kind: "call_request".to_string(),
            title: format!("{who} wants a call"),
            body,
            lead_id: Some(lead.id),
            priority: Priority::Urgent,
        });
    }
    if !kind.actionable() {
        return None;
    }

    let priority = match &result.classification.email {
        Some(_) => Priority::High,
        None => Priority::Normal,
    };
    let mut body = match &result.classification.email {
        Some(email) => format!("Captured email {email}"),
        None => format!("Reply classified as {kind}"),
    };
    for deliverable in &plan.deliverables {
        body.push_str(&format!(", send {deliverable}"));
    }
    Some(NewNotification {
        kind: "reply".to_string(),
        title: format!("{who} replied"),
        body,
        lead_id: Some(lead.id),
        priority,
    })
}

/// Inbound replies. Opt-out keywords are honoured before anything else so a
/// STOP sticks even when the sender is unknown or the database is down.
pub async fn inbound_sms(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WebhookQuery>,
    Json(payload): Json<Payload<InboundPayload>>,
) -> ApiResult<InboundReceipt> {
    let payload = payload.into_inner();
    let from = normalize_phone(&payload.from);
    if from.is_empty() || payload.message.trim().is_empty() {
        return Err(ApiError::bad_request("from and message are required"));
    }

    let stop = is_opt_out(&payload.message);
    let mut cancelled = 0;
    if stop {
        cancelled += state
            .sms_queue
            .add_opt_out(query.team_id, &from, OptOutOrigin::Recipient)
            .await;
        info!("{from} replied with an opt-out keyword, cancelled {cancelled} queued messages");
    }

    let mut conn = state.conn.get()?;
    let (team_id, lead) = match query.team_id {
        Some(team_id) => (team_id, find_by_phone(&mut conn, team_id, &from)?),
        None => match lead_by_phone_any_team(&mut conn, &from)? {
            Some(lead) => (lead.team_id, Some(lead)),
            None => {
                warn!("Inbound SMS from {from} matches no team, dropping");
                return Ok(ApiResponse::ok(InboundReceipt {
                    opted_out: stop,
                    ..Default::default()
                }));
            }
        },
    };

    let mut message = SmsMessage::inbound(
        team_id,
        lead.as_ref().map(|l| l.id),
        &from,
        &normalize_phone(&payload.to),
        &payload.message,
        payload.id.clone(),
    );

    let mut receipt = InboundReceipt {
        stored: true,
        message_id: Some(message.id),
        team_id: Some(team_id),
        lead_id: lead.as_ref().map(|l| l.id),
        opted_out: stop,
        ..Default::default()
    };

    let Some(lead) = lead else {
        if stop {
            state
                .sms_queue
                .add_opt_out(Some(team_id), &from, OptOutOrigin::Recipient)
                .await;
        }
        log_message(&mut conn, &message)?;
        record_event(
            &mut conn,
            team_id,
            None,
            "sms.inbound",
            &format!("Unmatched reply from {from}"),
            serde_json::json!({ "from": from, "message": payload.message, "opted_out": stop }),
        )?;
        debug!("Stored unmatched inbound SMS {} for team {team_id}", message.id);
        return Ok(ApiResponse::ok(receipt));
    };

    let result = label_lead(&mut conn, &lead, &payload.message)?;
    let kind = result.classification.kind;
    message.classification = Some(kind.id().to_string());
    log_message(&mut conn, &message)?;
    receipt.classification = message.classification.clone();

    let now = Utc::now();
    let plan = follow_ups(&result, now, &CallQueueConfig::default());
    let tier = priority_tier(result.priority_score);

    if result.cancels_pending() {
        cancelled += state
            .sms_queue
            .add_opt_out(Some(team_id), &from, OptOutOrigin::Recipient)
            .await;
        cancelled += state.sms_queue.cancel_lead(team_id, lead.id).await;
        receipt.opted_out = true;
        info!("{from} opted out, cancelled {cancelled} queued messages");
    }

    record_event(
        &mut conn,
        team_id,
        Some(lead.id),
        "sms.inbound",
        &format!("{} replied ({kind})", lead.full_name()),
        serde_json::json!({
            "from": from,
            "message": payload.message,
            "classification": kind.id(),
            "tags": result.tags,
            "priority_score": result.priority_score,
            "priority_tier": tier,
            "actions": result.actions,
            "follow_ups": plan,
        }),
    )?;

    if let Some(at) = plan.call_at.filter(|_| result.wants_call_queue()) {
        record_event(
            &mut conn,
            team_id,
            Some(lead.id),
            "call.queued",
            &format!("Call {} at {}", lead.full_name(), at.format("%Y-%m-%d %H:%M UTC")),
            serde_json::json!({ "call_at": at, "priority": plan.call_priority }),
        )?;
    }

    if let Some(note) = notification_for(&lead, &result, &plan) {
        state.notifications.push(team_id, note).await;
    }

    info!(
        "Inbound SMS {} from lead {} classified as {kind} ({tier:?})",
        message.id, lead.id
    );
    receipt.priority_tier = Some(tier);
    receipt.follow_ups = plan;
    Ok(ApiResponse::ok(receipt))
}

pub async fn delivery_status(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Payload<StatusPayload>>,
) -> ApiResult<StatusReceipt> {
    let payload = payload.into_inner();
    if payload.id.trim().is_empty() || payload.status.trim().is_empty() {
        return Err(ApiError::bad_request("id and status are required"));
    }

    let mut conn = state.conn.get()?;
    let updated = diesel::update(
        sms_messages::table.filter(sms_messages::provider_message_id.eq(&payload.id)),
    )
    .set((
        sms_messages::status.eq(payload.status.to_lowercase()),
        sms_messages::updated_at.eq(Utc::now()),
    ))
    .execute(&mut conn)?;

    if updated == 0 {
        debug!("Delivery status for unknown message {}", payload.id);
    }
    Ok(ApiResponse::ok(StatusReceipt { updated }))
}

pub fn configure_sms_webhook_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/webhooks/sms/inbound", post(inbound_sms))
        .route("/api/webhooks/sms/status", post(delivery_status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shared::test_utils::test_state;
    use crate::leads::classification::classify;
    use crate::leads::labels::apply_labels;
    use crate::leads::testing::sample_lead;
    use chrono::TimeZone;

    fn lead() -> Lead {
        sample_lead(Uuid::new_v4(), "Dana", "Ruiz", "5551234567")
    }

    fn plan_for(result: &LabelingResult) -> FollowUps {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        follow_ups(result, now, &CallQueueConfig::default())
    }

    #[test]
    fn payload_accepts_provider_aliases() {
        let p: Payload<InboundPayload> = serde_json::from_value(serde_json::json!({
            "from": "+15551234567",
            "to": "+15559990000",
            "text": "yes please",
            "messageId": "abc"
        }))
        .unwrap();
        let p = p.into_inner();
        assert_eq!(p.message, "yes please");
        assert_eq!(p.id.as_deref(), Some("abc"));

        let s: Payload<StatusPayload> =
            serde_json::from_value(serde_json::json!({"message_id": "abc", "status": "DELIVERED"}))
                .unwrap();
        assert_eq!(s.into_inner().id, "abc");
    }

    #[test]
    fn payload_accepts_the_data_envelope() {
        let p: Payload<InboundPayload> = serde_json::from_value(serde_json::json!({
            "event": "message.received",
            "data": { "from": "+15551234567", "body": "STOP", "id": "sh_9" }
        }))
        .unwrap();
        let p = p.into_inner();
        assert_eq!(p.from, "+15551234567");
        assert_eq!(p.message, "STOP");
        assert_eq!(p.to, "");
    }

    #[test]
    fn email_capture_notifies_with_high_priority() {
        let lead = lead();
        let result = apply_labels(classify("sure, reach me at dana@example.com"), &lead.tags);
        let note = notification_for(&lead, &result, &plan_for(&result)).unwrap();
        assert_eq!(note.priority, Priority::High);
        assert!(note.body.contains("dana@example.com"));
        assert!(note.body.contains("property-valuation-report"));
        assert_eq!(note.title, "Dana Ruiz replied");
    }

    #[test]
    fn suppressed_replies_stay_quiet() {
        let lead = lead();
        let result = apply_labels(classify("STOP"), &lead.tags);
        assert!(result.cancels_pending());
        assert!(notification_for(&lead, &result, &plan_for(&result)).is_none());
    }

    #[test]
    fn call_requests_are_urgent_and_scheduled() {
        let lead = lead();
        let result = apply_labels(classify("[CALL] called back from my cell"), &lead.tags);
        assert!(result.applied.iter().any(|t| t == WANTS_CALL));

        // 10:00 + 24h lands in the morning window
        let note = notification_for(&lead, &result, &plan_for(&result)).unwrap();
        assert_eq!(note.priority, Priority::Urgent);
        assert_eq!(note.kind, "call_request");
        assert!(note.body.starts_with("Lead requested callback"));
        assert!(note.body.ends_with("call at Tue Mar 3 10:00 UTC"));
    }

    #[tokio::test]
    async fn stop_is_recorded_before_the_database_is_touched() {
        let state = test_state();
        let payload = Payload::Bare(InboundPayload {
            from: "+1 (555) 123-4567".to_string(),
            to: String::new(),
            message: "STOP texting me, damn it".to_string(),
            id: None,
        });

        let err = inbound_sms(
            State(state.clone()),
            Query(WebhookQuery { team_id: None }),
            Json(payload),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::Database(_)));

        let entry = state.sms_queue.opt_out("5551234567").await.unwrap();
        assert_eq!(entry.origin, OptOutOrigin::Recipient);
        assert_eq!(entry.team_id, None);
    }

    #[tokio::test]
    async fn ordinary_replies_do_not_opt_out() {
        let state = test_state();
        let payload = Payload::Bare(InboundPayload {
            from: "5551234567".to_string(),
            to: String::new(),
            message: "yes, tell me more".to_string(),
            id: None,
        });
        let team = Uuid::new_v4();
        let _ = inbound_sms(
            State(state.clone()),
            Query(WebhookQuery { team_id: Some(team) }),
            Json(payload),
        )
        .await;
        assert!(!state.sms_queue.is_opted_out("5551234567").await);
    }
}
