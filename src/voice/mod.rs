//! Twilio voice: inbound call TwiML, call status callbacks and operator
//! dispositions, all recorded in `call_logs`.

pub mod twilio;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel::PgConnection;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::core::config::TwilioConfig;
use crate::core::shared::schema::{call_logs, leads};
use crate::core::shared::{normalize_phone, ApiError, ApiResponse, ApiResult, AppState};
use crate::core::tenant::TeamContext;
use crate::leads::{find_by_phone, Lead};
use crate::sdr::record_event;
use twilio::{CallWebhook, Twiml, TwilioError, SIGNATURE_HEADER};

pub const FORWARD_TIMEOUT_SECS: u32 = 20;
pub const VOICEMAIL_MAX_SECS: u32 = 120;

pub const DISPOSITIONS: &[&str] = &[
    "interested",
    "not_interested",
    "callback",
    "voicemail",
    "no_answer",
    "wrong_number",
    "do_not_call",
    "appointment_set",
];

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = call_logs)]
pub struct CallLog {
    pub id: Uuid,
    pub team_id: Uuid,
    pub lead_id: Option<Uuid>,
    pub call_sid: String,
    pub direction: String,
    pub from_number: String,
    pub to_number: String,
    pub status: String,
    pub duration_seconds: i32,
    pub disposition: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct VoiceWebhookQuery {
    pub team_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct DispositionRequest {
    pub disposition: String,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallListQuery {
    pub lead_id: Option<Uuid>,
    pub limit: Option<i64>,
}

/// TwiML for an inbound call: ring the forward number when one is set,
/// otherwise take a voicemail.
pub fn inbound_twiml(config: &TwilioConfig, status_callback: &str) -> String {
    match config.forward_number.as_deref() {
        Some(number) => Twiml::new()
            .say("Thanks for calling. Connecting you now.")
            .dial(number, FORWARD_TIMEOUT_SECS, Some(status_callback))
            .build(),
        None => Twiml::new()
            .say("Thanks for calling. Please leave a message after the tone.")
            .record(VOICEMAIL_MAX_SECS, Some(status_callback))
            .hangup()
            .build(),
    }
}

fn xml(body: String) -> Response {
    ([(header::CONTENT_TYPE, "application/xml")], body).into_response()
}

fn twilio_config(state: &AppState) -> Result<&TwilioConfig, ApiError> {
    state
        .config
        .twilio
        .as_ref()
        .ok_or(ApiError::NotConfigured("Twilio"))
}

fn verify(
    state: &AppState,
    config: &TwilioConfig,
    headers: &HeaderMap,
    uri: &Uri,
    params: &HashMap<String, String>,
) -> Result<(), ApiError> {
    if !config.validate_signatures {
        return Ok(());
    }
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(TwilioError::InvalidSignature)?;
    let url = format!(
        "{}{}",
        state.config.server.base_url.trim_end_matches('/'),
        uri.path_and_query().map(|p| p.as_str()).unwrap_or("/")
    );
    twilio::validate_signature(&config.auth_token, signature, &url, params).map_err(|e| {
        warn!("Rejected Twilio webhook for {url}");
        ApiError::from(e)
    })
}

/// The caller's team and lead: explicit team first, otherwise the team that
/// owns the caller's number.
fn resolve_caller(
    conn: &mut PgConnection,
    team_id: Option<Uuid>,
    phone: &str,
) -> Result<Option<(Uuid, Option<Lead>)>, ApiError> {
    if let Some(team_id) = team_id {
        return Ok(Some((team_id, find_by_phone(conn, team_id, phone)?)));
    }
    let phone = normalize_phone(phone);
    if phone.is_empty() {
        return Ok(None);
    }
    let lead = leads::table
        .filter(leads::phone.eq(phone))
        .order(leads::updated_at.desc())
        .select(Lead::as_select())
        .first(conn)
        .optional()?;
    Ok(lead.map(|l| (l.team_id, Some(l))))
}

/// Inserts or refreshes the log row for a call. Status and duration take
/// the latest callback.
pub fn upsert_call(
    conn: &mut PgConnection,
    team_id: Uuid,
    lead_id: Option<Uuid>,
    call: &CallWebhook,
) -> Result<CallLog, ApiError> {
    let now = Utc::now();
    let row = CallLog {
        id: Uuid::new_v4(),
        team_id,
        lead_id,
        call_sid: call.call_sid.clone(),
        direction: call.direction.clone(),
        from_number: normalize_phone(&call.from),
        to_number: normalize_phone(&call.to),
        status: call.status.clone(),
        duration_seconds: call.duration_secs,
        disposition: None,
        notes: None,
        created_at: now,
        updated_at: now,
    };

    Ok(diesel::insert_into(call_logs::table)
        .values(&row)
        .on_conflict(call_logs::call_sid)
        .do_update()
        .set((
            call_logs::status.eq(excluded(call_logs::status)),
            call_logs::duration_seconds.eq(excluded(call_logs::duration_seconds)),
            call_logs::updated_at.eq(now),
        ))
        .returning(CallLog::as_returning())
        .get_result(conn)?)
}

pub async fn inbound_call(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VoiceWebhookQuery>,
    headers: HeaderMap,
    uri: Uri,
    Form(params): Form<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let config = twilio_config(&state)?;
    verify(&state, config, &headers, &uri, &params)?;
    let call = CallWebhook::from_params(&params)?;

    let status_callback = match query.team_id {
        Some(team_id) => format!("/api/voice/status?team_id={team_id}"),
        None => "/api/voice/status".to_string(),
    };
    let twiml = inbound_twiml(config, &status_callback);

    // A logging failure must not drop the caller.
    let logged = state.conn.get().map_err(ApiError::from).and_then(|mut conn| {
        let Some((team_id, lead)) = resolve_caller(&mut conn, query.team_id, &call.from)? else {
            debug!("Inbound call {} from unknown number", call.call_sid);
            return Ok(());
        };
        let lead_id = lead.as_ref().map(|l| l.id);
        upsert_call(&mut conn, team_id, lead_id, &call)?;
        let who = lead
            .as_ref()
            .map(Lead::full_name)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| normalize_phone(&call.from));
        record_event(
            &mut conn,
            team_id,
            lead_id,
            "call.inbound",
            &format!("Inbound call from {who}"),
            serde_json::json!({ "call_sid": call.call_sid, "from": call.from }),
        )?;
        Ok::<_, ApiError>(())
    });
    if let Err(e) = logged {
        warn!("Could not log inbound call {}: {e}", call.call_sid);
    }

    info!("Answered inbound call {}", call.call_sid);
    Ok(xml(twiml))
}

pub async fn call_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VoiceWebhookQuery>,
    headers: HeaderMap,
    uri: Uri,
    Form(params): Form<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let config = twilio_config(&state)?;
    verify(&state, config, &headers, &uri, &params)?;
    let call = CallWebhook::from_params(&params)?;

    let mut conn = state.conn.get()?;
    // Inbound calls are keyed on the caller, outbound on the callee.
    let party = if call.direction == "outbound" {
        &call.to
    } else {
        &call.from
    };
    match resolve_caller(&mut conn, query.team_id, party)? {
        Some((team_id, lead)) => {
            let log = upsert_call(&mut conn, team_id, lead.map(|l| l.id), &call)?;
            debug!("Call {} is {} ({}s)", log.call_sid, log.status, log.duration_seconds);
        }
        None => debug!("Status for unattributed call {}", call.call_sid),
    }

    Ok(xml(Twiml::new().build()))
}

pub async fn set_disposition(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(id): Path<Uuid>,
    Json(req): Json<DispositionRequest>,
) -> ApiResult<CallLog> {
    let disposition = req.disposition.trim().to_lowercase();
    if !DISPOSITIONS.contains(&disposition.as_str()) {
        return Err(ApiError::bad_request(format!(
            "unknown disposition {disposition}, expected one of {}",
            DISPOSITIONS.join(", ")
        )));
    }

    let mut conn = state.conn.get()?;
    let log: CallLog = diesel::update(
        call_logs::table
            .filter(call_logs::id.eq(id))
            .filter(call_logs::team_id.eq(ctx.team_id)),
    )
    .set((
        call_logs::disposition.eq(Some(disposition.as_str())),
        call_logs::notes.eq(req.notes.as_deref()),
        call_logs::updated_at.eq(Utc::now()),
    ))
    .returning(CallLog::as_returning())
    .get_result(&mut conn)
    .optional()?
    .ok_or_else(|| ApiError::not_found("call"))?;

    record_event(
        &mut conn,
        ctx.team_id,
        log.lead_id,
        "call.disposition",
        &format!("Call marked {disposition}"),
        serde_json::json!({ "call_id": log.id, "disposition": disposition }),
    )?;
    Ok(ApiResponse::ok(log))
}

pub async fn list_calls(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Query(query): Query<CallListQuery>,
) -> ApiResult<Vec<CallLog>> {
    let mut conn = state.conn.get()?;
    let mut q = call_logs::table
        .filter(call_logs::team_id.eq(ctx.team_id))
        .select(CallLog::as_select())
        .into_boxed();
    if let Some(lead_id) = query.lead_id {
        q = q.filter(call_logs::lead_id.eq(lead_id));
    }
    let rows = q
        .order(call_logs::created_at.desc())
        .limit(query.limit.unwrap_or(50).clamp(1, 500))
        .load(&mut conn)?;
    Ok(ApiResponse::ok(rows))
}

pub fn configure_voice_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/voice/inbound", post(inbound_call))
        .route("/api/voice/status", post(call_status))
        .route("/api/voice/calls", get(list_calls))
        .route("/api/voice/calls/:id/disposition", post(set_disposition))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(forward: Option<&str>) -> TwilioConfig {
        TwilioConfig {
            account_sid: "AC123".to_string(),
            auth_token: "secret".to_string(),
            from_number: "+15550001111".to_string(),
            forward_number: forward.map(String::from),
            validate_signatures: true,
        }
    }

    #[test]
    fn forwards_when_a_number_is_configured() {
        let xml = inbound_twiml(&config(Some("+15552223333")), "/api/voice/status");
        assert!(xml.contains("<Dial timeout=\"20\" action=\"/api/voice/status\">+15552223333</Dial>"));
        assert!(!xml.contains("<Record"));
    }

    #[test]
    fn takes_voicemail_otherwise() {
        let xml = inbound_twiml(&config(None), "/api/voice/status");
        assert!(xml.contains("<Record maxLength=\"120\""));
        assert!(xml.contains("<Hangup />"));
        assert!(!xml.contains("<Dial"));
    }
}
