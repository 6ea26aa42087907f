//! Power-dialer sessions. A session is an ordered list of leads and a
//! cursor, stored as one JSON document in the key-value table.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

use crate::core::shared::kv::{kv_get, kv_put};
use crate::core::shared::schema::leads;
use crate::core::shared::{ApiError, ApiResponse, ApiResult, AppState};
use crate::core::tenant::TeamContext;
use crate::leads::Lead;
use crate::sdr::record_event;

/// Dispositions that mean someone picked up.
const CONTACTED: &[&str] = &["interested", "not_interested", "callback", "appointment_set"];

pub fn session_key(team_id: Uuid, session_id: Uuid) -> String {
    format!("dialer:{team_id}:{session_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallOutcome {
    pub disposition: String,
    pub notes: Option<String>,
    pub duration_secs: u32,
    pub skipped: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialerEntry {
    pub lead_id: Uuid,
    pub name: String,
    pub phone: String,
    pub outcome: Option<CallOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialerSession {
    pub id: Uuid,
    pub team_id: Uuid,
    pub name: Option<String>,
    pub entries: Vec<DialerEntry>,
    /// Index of the lead being dialled; equals `entries.len()` once done.
    pub cursor: usize,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DialerStats {
    pub total: usize,
    pub dialed: usize,
    pub skipped: usize,
    pub remaining: usize,
    pub contacted: usize,
    pub talk_time_secs: u64,
    pub by_disposition: BTreeMap<String, usize>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DialerError {
    #[error("dialer session is {0:?}")]
    Closed(SessionStatus),
    #[error("already at the first lead")]
    AtStart,
    #[error("disposition is required")]
    MissingDisposition,
}

impl From<DialerError> for ApiError {
    fn from(err: DialerError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl DialerSession {
    pub fn new(team_id: Uuid, name: Option<String>, entries: Vec<DialerEntry>, now: DateTime<Utc>) -> Self {
        let status = if entries.is_empty() {
            SessionStatus::Completed
        } else {
            SessionStatus::Active
        };
        Self {
            id: Uuid::new_v4(),
            team_id,
            name,
            entries,
            cursor: 0,
            status,
            started_at: now,
            updated_at: now,
            ended_at: None,
        }
    }

    pub fn current(&self) -> Option<&DialerEntry> {
        match self.status {
            SessionStatus::Active => self.entries.get(self.cursor),
            _ => None,
        }
    }

    fn ensure_active(&self) -> Result<(), DialerError> {
        match self.status {
            SessionStatus::Active => Ok(()),
            other => Err(DialerError::Closed(other)),
        }
    }

    fn settle(&mut self, outcome: CallOutcome, now: DateTime<Utc>) {
        if let Some(entry) = self.entries.get_mut(self.cursor) {
            entry.outcome = Some(outcome);
        }
        self.cursor = (self.cursor + 1).min(self.entries.len());
        if self.cursor == self.entries.len() {
            self.status = SessionStatus::Completed;
            self.ended_at = Some(now);
        }
        self.updated_at = now;
    }

    /// Records the call on the current lead and moves to the next one.
    pub fn record(
        &mut self,
        disposition: &str,
        notes: Option<String>,
        duration_secs: u32,
        now: DateTime<Utc>,
    ) -> Result<(), DialerError> {
        self.ensure_active()?;
        let disposition = disposition.trim().to_lowercase();
        if disposition.is_empty() {
            return Err(DialerError::MissingDisposition);
        }
        self.settle(
            CallOutcome {
                disposition,
                notes: notes.filter(|n| !n.trim().is_empty()),
                duration_secs,
                skipped: false,
                at: now,
            },
            now,
        );
        Ok(())
    }

    pub fn skip(&mut self, now: DateTime<Utc>) -> Result<(), DialerError> {
        self.ensure_active()?;
        self.settle(
            CallOutcome {
                disposition: "skipped".to_string(),
                notes: None,
                duration_secs: 0,
                skipped: true,
                at: now,
            },
            now,
        );
        Ok(())
    }

    /// Steps back one lead. Going back from the end reopens the session;
    /// an ended session stays ended.
    pub fn previous(&mut self, now: DateTime<Utc>) -> Result<(), DialerError> {
        if self.status == SessionStatus::Ended {
            return Err(DialerError::Closed(SessionStatus::Ended));
        }
        if self.cursor == 0 {
            return Err(DialerError::AtStart);
        }
        self.cursor -= 1;
        self.status = SessionStatus::Active;
        self.ended_at = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn end(&mut self, now: DateTime<Utc>) {
        if self.status != SessionStatus::Ended {
            self.status = SessionStatus::Ended;
            self.ended_at = Some(now);
            self.updated_at = now;
        }
    }

    pub fn stats(&self) -> DialerStats {
        let mut stats = DialerStats {
            total: self.entries.len(),
            remaining: self.entries.len() - self.cursor.min(self.entries.len()),
            ..Default::default()
        };
        for outcome in self.entries.iter().filter_map(|e| e.outcome.as_ref()) {
            if outcome.skipped {
                stats.skipped += 1;
                continue;
            }
            stats.dialed += 1;
            stats.talk_time_secs += u64::from(outcome.duration_secs);
            if CONTACTED.contains(&outcome.disposition.as_str()) {
                stats.contacted += 1;
            }
            *stats
                .by_disposition
                .entry(outcome.disposition.clone())
                .or_default() += 1;
        }
        stats
    }
}

#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    pub lead_ids: Vec<Uuid>,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NextRequest {
    pub disposition: String,
    pub notes: Option<String>,
    #[serde(default)]
    pub duration_secs: u32,
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub session: DialerSession,
    pub current: Option<DialerEntry>,
}

impl From<DialerSession> for SessionView {
    fn from(session: DialerSession) -> Self {
        let current = session.current().cloned();
        Self { session, current }
    }
}

/// Dialable entries in request order. Unknown ids, opted-out leads and
/// leads without a phone are dropped.
pub fn build_entries(requested: &[Uuid], found: Vec<Lead>) -> Vec<DialerEntry> {
    let mut by_id: HashMap<Uuid, Lead> = found.into_iter().map(|l| (l.id, l)).collect();
    requested
        .iter()
        .filter_map(|id| by_id.remove(id))
        .filter(|lead| !lead.is_opted_out())
        .filter_map(|lead| {
            let phone = lead.phone.clone()?;
            Some(DialerEntry {
                lead_id: lead.id,
                name: lead.full_name(),
                phone,
                outcome: None,
            })
        })
        .collect()
}

fn load_session(conn: &mut PgConnection, team_id: Uuid, id: Uuid) -> Result<DialerSession, ApiError> {
    kv_get(conn, team_id, &session_key(team_id, id))?
        .ok_or_else(|| ApiError::not_found("dialer session"))
}

fn save_session(conn: &mut PgConnection, session: &DialerSession) -> Result<(), ApiError> {
    kv_put(conn, session.team_id, &session_key(session.team_id, session.id), session)
}

pub async fn start_session(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Json(req): Json<StartSessionRequest>,
) -> ApiResult<SessionView> {
    if req.lead_ids.is_empty() {
        return Err(ApiError::bad_request("lead_ids is required"));
    }

    let mut conn = state.conn.get()?;
    let found: Vec<Lead> = leads::table
        .filter(leads::team_id.eq(ctx.team_id))
        .filter(leads::id.eq_any(req.lead_ids.clone()))
        .select(Lead::as_select())
        .load(&mut conn)?;

    let entries = build_entries(&req.lead_ids, found);
    if entries.is_empty() {
        return Err(ApiError::bad_request("none of the leads can be dialled"));
    }

    let session = DialerSession::new(ctx.team_id, req.name, entries, Utc::now());
    save_session(&mut conn, &session)?;
    info!(
        "Started dialer session {} with {} leads for team {}",
        session.id,
        session.entries.len(),
        ctx.team_id
    );
    Ok(ApiResponse::created(session.into()))
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(id): Path<Uuid>,
) -> ApiResult<SessionView> {
    let mut conn = state.conn.get()?;
    Ok(ApiResponse::ok(load_session(&mut conn, ctx.team_id, id)?.into()))
}

pub async fn next_lead(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(id): Path<Uuid>,
    Json(req): Json<NextRequest>,
) -> ApiResult<SessionView> {
    let mut conn = state.conn.get()?;
    let mut session = load_session(&mut conn, ctx.team_id, id)?;
    let called = session.current().cloned();

    session.record(&req.disposition, req.notes, req.duration_secs, Utc::now())?;
    save_session(&mut conn, &session)?;

    if let Some(entry) = called {
        let disposition = req.disposition.trim().to_lowercase();
        record_event(
            &mut conn,
            ctx.team_id,
            Some(entry.lead_id),
            "dialer.call",
            &format!("Called {} ({disposition})", entry.name),
            serde_json::json!({
                "session_id": session.id,
                "disposition": disposition,
                "duration_secs": req.duration_secs,
            }),
        )?;
    }
    Ok(ApiResponse::ok(session.into()))
}

pub async fn skip_lead(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(id): Path<Uuid>,
) -> ApiResult<SessionView> {
    let mut conn = state.conn.get()?;
    let mut session = load_session(&mut conn, ctx.team_id, id)?;
    session.skip(Utc::now())?;
    save_session(&mut conn, &session)?;
    Ok(ApiResponse::ok(session.into()))
}

pub async fn previous_lead(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(id): Path<Uuid>,
) -> ApiResult<SessionView> {
    let mut conn = state.conn.get()?;
    let mut session = load_session(&mut conn, ctx.team_id, id)?;
    session.previous(Utc::now())?;
    save_session(&mut conn, &session)?;
    Ok(ApiResponse::ok(session.into()))
}

pub async fn end_session(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(id): Path<Uuid>,
) -> ApiResult<DialerStats> {
    let mut conn = state.conn.get()?;
    let mut session = load_session(&mut conn, ctx.team_id, id)?;
    session.end(Utc::now());
    save_session(&mut conn, &session)?;
    debug!("Ended dialer session {}", session.id);
    Ok(ApiResponse::ok(session.stats()))
}

pub async fn session_stats(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(id): Path<Uuid>,
) -> ApiResult<DialerStats> {
    let mut conn = state.conn.get()?;
    Ok(ApiResponse::ok(load_session(&mut conn, ctx.team_id, id)?.stats()))
}

pub fn configure_dialer_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/dialer/sessions", post(start_session))
        .route("/api/dialer/sessions/:id", get(get_session))
        .route("/api/dialer/sessions/:id/next", post(next_lead))
        .route("/api/dialer/sessions/:id/skip", post(skip_lead))
        .route("/api/dialer/sessions/:id/previous", post(previous_lead))
        .route("/api/dialer/sessions/:id/end", post(end_session))
        .route("/api/dialer/sessions/:id/stats", get(session_stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leads::testing::sample_lead;

    fn session(n: usize) -> DialerSession {
        let entries = (0..n)
            .map(|i| DialerEntry {
                lead_id: Uuid::new_v4(),
                name: format!("Lead {i}"),
                phone: format!("555000000{i}"),
                outcome: None,
            })
            .collect();
        DialerSession::new(Uuid::new_v4(), None, entries, Utc::now())
    }

    #[test]
    fn walks_to_completion_and_stops() {
        let mut s = session(3);
        let now = Utc::now();
        s.record("interested", Some("call back friday".into()), 95, now).unwrap();
        s.skip(now).unwrap();
        s.record("voicemail", None, 30, now).unwrap();

        assert_eq!(s.cursor, 3);
        assert_eq!(s.status, SessionStatus::Completed);
        assert!(s.current().is_none());
        assert_eq!(s.skip(now), Err(DialerError::Closed(SessionStatus::Completed)));
        assert_eq!(s.cursor, 3);

        let stats = s.stats();
        assert_eq!((stats.dialed, stats.skipped, stats.remaining), (2, 1, 0));
        assert_eq!(stats.contacted, 1);
        assert_eq!(stats.talk_time_secs, 125);
        assert_eq!(stats.by_disposition.get("voicemail"), Some(&1));
    }

    #[test]
    fn previous_reopens_a_completed_session() {
        let mut s = session(1);
        let now = Utc::now();
        assert_eq!(s.previous(now), Err(DialerError::AtStart));
        s.record("no_answer", None, 0, now).unwrap();
        assert_eq!(s.status, SessionStatus::Completed);

        s.previous(now).unwrap();
        assert_eq!(s.status, SessionStatus::Active);
        assert_eq!(s.cursor, 0);
        assert!(s.ended_at.is_none());
    }

    #[test]
    fn ended_sessions_reject_everything() {
        let mut s = session(2);
        let now = Utc::now();
        s.end(now);
        assert!(s.record("interested", None, 10, now).is_err());
        assert!(s.previous(now).is_err());
        assert_eq!(s.stats().remaining, 2);
    }

    #[test]
    fn blank_disposition_is_rejected() {
        let mut s = session(1);
        assert_eq!(
            s.record("  ", None, 0, Utc::now()),
            Err(DialerError::MissingDisposition)
        );
        assert_eq!(s.cursor, 0);
    }

    #[test]
    fn entries_keep_request_order_and_drop_undialable_leads() {
        let team = Uuid::new_v4();
        let a = sample_lead(team, "Ana", "Ruiz", "5550000001");
        let b = sample_lead(team, "Bo", "Li", "5550000002");
        let mut opted = sample_lead(team, "Cy", "Ng", "5550000003");
        opted.tags.push("opted_out".into());
        let missing = Uuid::new_v4();

        let requested = vec![b.id, missing, opted.id, a.id];
        let entries = build_entries(&requested, vec![a.clone(), b.clone(), opted]);
        let ids: Vec<Uuid> = entries.iter().map(|e| e.lead_id).collect();
        assert_eq!(ids, vec![b.id, a.id]);
        assert_eq!(entries[1].name, "Ana Ruiz");
    }

    #[test]
    fn session_keys_are_team_scoped() {
        let team = Uuid::nil();
        let id = Uuid::nil();
        assert_eq!(
            session_key(team, id),
            format!("dialer:{}:{}", Uuid::nil(), Uuid::nil())
        );
    }
}
