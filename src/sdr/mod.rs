//! SDR activity feed: team events written by the webhooks and dialer,
//! served as a list and as a Server-Sent Events stream.
//!
//! Each stream connection runs its own polling task. The task ends when the
//! client goes away (the channel closes) or when the lifetime runs out, at
//! which point the client is told to reconnect.

use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use futures::stream::Stream;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::core::config::SseConfig;
use crate::core::shared::schema::activity_events;
use crate::core::shared::{ApiError, ApiResponse, ApiResult, AppState, DbPool};
use crate::core::tenant::TeamContext;

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = activity_events)]
pub struct ActivityEvent {
    pub id: Uuid,
    pub team_id: Uuid,
    pub lead_id: Option<Uuid>,
    pub kind: String,
    pub summary: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

pub fn record_event(
    conn: &mut PgConnection,
    team_id: Uuid,
    lead_id: Option<Uuid>,
    kind: &str,
    summary: &str,
    payload: serde_json::Value,
) -> Result<ActivityEvent, ApiError> {
    let event = ActivityEvent {
        id: Uuid::new_v4(),
        team_id,
        lead_id,
        kind: kind.to_string(),
        summary: summary.to_string(),
        payload,
        created_at: Utc::now(),
    };
    diesel::insert_into(activity_events::table)
        .values(&event)
        .execute(conn)?;
    Ok(event)
}

/// Stream position. Events are ordered by `(created_at, id)`, so rows sharing
/// a timestamp are told apart by id. `id: None` starts strictly after `at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub at: DateTime<Utc>,
    pub id: Option<Uuid>,
}

impl Cursor {
    pub fn after(at: DateTime<Utc>) -> Self {
        Self { at, id: None }
    }

    pub fn of(event: &ActivityEvent) -> Self {
        Self {
            at: event.created_at,
            id: Some(event.id),
        }
    }

    /// Whether `event` sorts after this position.
    pub fn precedes(&self, event: &ActivityEvent) -> bool {
        match self.id {
            None => event.created_at > self.at,
            Some(id) => (self.at, id) < (event.created_at, event.id),
        }
    }
}

#[async_trait]
pub trait ActivitySource: Send + Sync {
    /// Events after `cursor` in `(created_at, id)` order.
    async fn since(
        &self,
        team_id: Uuid,
        cursor: Cursor,
        limit: i64,
    ) -> Result<Vec<ActivityEvent>, ApiError>;

    /// Latest events, newest first.
    async fn recent(&self, team_id: Uuid, limit: i64) -> Result<Vec<ActivityEvent>, ApiError>;
}

pub struct DbActivitySource {
    pool: DbPool,
}

impl DbActivitySource {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Runs a diesel query on the blocking pool so polls never stall the runtime.
async fn with_conn<T, F>(pool: &DbPool, query: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&mut PgConnection) -> Result<T, ApiError> + Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get()?;
        query(&mut conn)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("activity query task failed: {e}")))?
}

#[async_trait]
impl ActivitySource for DbActivitySource {
    async fn since(
        &self,
        team_id: Uuid,
        cursor: Cursor,
        limit: i64,
    ) -> Result<Vec<ActivityEvent>, ApiError> {
        with_conn(&self.pool, move |conn| {
            let mut query = activity_events::table
                .filter(activity_events::team_id.eq(team_id))
                .order((activity_events::created_at.asc(), activity_events::id.asc()))
                .limit(limit)
                .select(ActivityEvent::as_select())
                .into_boxed();
            query = match cursor.id {
                Some(id) => query.filter(
                    activity_events::created_at.gt(cursor.at).or(activity_events::created_at
                        .eq(cursor.at)
                        .and(activity_events::id.gt(id))),
                ),
                None => query.filter(activity_events::created_at.gt(cursor.at)),
            };
            Ok(query.load(conn)?)
        })
        .await
    }

    async fn recent(&self, team_id: Uuid, limit: i64) -> Result<Vec<ActivityEvent>, ApiError> {
        with_conn(&self.pool, move |conn| {
            Ok(activity_events::table
                .filter(activity_events::team_id.eq(team_id))
                .order((activity_events::created_at.desc(), activity_events::id.desc()))
                .limit(limit)
                .select(ActivityEvent::as_select())
                .load(conn)?)
        })
        .await
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SdrEvent {
    Connected {
        team_id: Uuid,
        poll_interval_ms: u64,
        max_lifetime_secs: u64,
    },
    Activity(ActivityEvent),
    Heartbeat { at: DateTime<Utc> },
    Reconnect { retry_ms: u64 },
}

impl SdrEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Activity(_) => "activity",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Reconnect { .. } => "reconnect",
        }
    }

    pub fn to_sse_event(&self) -> Event {
        let event = Event::default().event(self.name());
        match serde_json::to_string(self) {
            Ok(data) => event.data(data),
            Err(e) => {
                warn!("Could not serialize SDR event: {e}");
                event.data("{}")
            }
        }
    }
}

/// Polls `source` for one connection until the client hangs up or the
/// lifetime elapses.
pub async fn run_activity_loop(
    source: Arc<dyn ActivitySource>,
    team_id: Uuid,
    since: DateTime<Utc>,
    config: SseConfig,
    tx: mpsc::Sender<SdrEvent>,
) {
    let mut cursor = Cursor::after(since);
    let connected = SdrEvent::Connected {
        team_id,
        poll_interval_ms: config.poll_interval_ms,
        max_lifetime_secs: config.max_lifetime_secs,
    };
    if tx.send(connected).await.is_err() {
        return;
    }

    let deadline = Instant::now() + config.max_lifetime();
    loop {
        sleep(config.poll_interval()).await;

        if Instant::now() >= deadline {
            let _ = tx
                .send(SdrEvent::Reconnect {
                    retry_ms: config.poll_interval_ms,
                })
                .await;
            debug!("SDR stream for team {team_id} reached its lifetime");
            return;
        }

        let rows = match source.since(team_id, cursor, config.batch_size).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("SDR activity poll for team {team_id} failed: {e}");
                Vec::new()
            }
        };

        if rows.is_empty() {
            if tx.send(SdrEvent::Heartbeat { at: Utc::now() }).await.is_err() {
                trace!("SDR client for team {team_id} went away");
                return;
            }
            continue;
        }

        for row in rows {
            if !cursor.precedes(&row) {
                continue;
            }
            cursor = Cursor::of(&row);
            if tx.send(SdrEvent::Activity(row)).await.is_err() {
                trace!("SDR client for team {team_id} went away");
                return;
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Replay events after this instant. Defaults to now.
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<i64>,
}

pub async fn activity_stream(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let config = state.config.sse.clone();
    let keep_alive = config.heartbeat();
    let (tx, rx) = mpsc::channel::<SdrEvent>(64);

    tokio::spawn(run_activity_loop(
        state.activity.clone(),
        ctx.team_id,
        query.since.unwrap_or_else(Utc::now),
        config,
        tx,
    ));

    let stream = ReceiverStream::new(rx).map(|event| Ok(event.to_sse_event()));
    Sse::new(stream).keep_alive(KeepAlive::new().interval(keep_alive).text("keep-alive"))
}

pub async fn recent_activity(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Query(query): Query<RecentQuery>,
) -> ApiResult<Vec<ActivityEvent>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let rows = state.activity.recent(ctx.team_id, limit).await?;
    Ok(ApiResponse::ok(rows))
}

pub fn configure_sdr_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/sdr/activity", get(recent_activity))
        .route("/api/sdr/activity/stream", get(activity_stream))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Hands out queued batches, one per poll, then nothing.
    #[derive(Default)]
    pub struct ScriptedSource {
        pub batches: Mutex<Vec<Vec<ActivityEvent>>>,
        pub polls: Mutex<Vec<Cursor>>,
    }

    pub fn event(team_id: Uuid, at: DateTime<Utc>, summary: &str) -> ActivityEvent {
        ActivityEvent {
            id: Uuid::new_v4(),
            team_id,
            lead_id: None,
            kind: "sms.inbound".to_string(),
            summary: summary.to_string(),
            payload: serde_json::json!({}),
            created_at: at,
        }
    }

    #[async_trait]
    impl ActivitySource for ScriptedSource {
        async fn since(
            &self,
            _team_id: Uuid,
            cursor: Cursor,
            _limit: i64,
        ) -> Result<Vec<ActivityEvent>, ApiError> {
            self.polls
                .lock()
                .map_err(|e| ApiError::Internal(e.to_string()))?
                .push(cursor);
            let mut batches = self
                .batches
                .lock()
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            Ok(if batches.is_empty() {
                Vec::new()
            } else {
                batches.remove(0)
            })
        }

        async fn recent(&self, _team_id: Uuid, _limit: i64) -> Result<Vec<ActivityEvent>, ApiError> {
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{event, ScriptedSource};
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::sync::Mutex;

    #[tokio::test(start_paused = true)]
    async fn stream_emits_connected_activity_heartbeats_then_reconnect() {
        let team = Uuid::new_v4();
        let start = Utc::now();
        let first = event(team, start + ChronoDuration::seconds(1), "Ana replied");
        let second = event(team, start + ChronoDuration::seconds(3), "Bo replied");
        let source = Arc::new(ScriptedSource {
            batches: Mutex::new(vec![vec![first.clone()], vec![second.clone()]]),
            ..Default::default()
        });

        let (tx, mut rx) = mpsc::channel(64);
        let handle = tokio::spawn(run_activity_loop(
            source.clone(),
            team,
            start,
            SseConfig::default(),
            tx,
        ));

        let mut names = Vec::new();
        while let Some(event) = rx.recv().await {
            names.push(event.name());
        }
        handle.await.unwrap();

        assert_eq!(names.first(), Some(&"connected"));
        assert_eq!(names.last(), Some(&"reconnect"));
        assert_eq!(names.iter().filter(|n| **n == "activity").count(), 2);
        assert_eq!(names.iter().filter(|n| **n == "heartbeat").count(), 12);

        // the cursor follows the newest row seen
        let polls = source.polls.lock().unwrap();
        assert_eq!(polls[0], Cursor::after(start));
        assert_eq!(polls[1], Cursor::of(&first));
        assert_eq!(polls[2], Cursor::of(&second));
    }

    #[tokio::test(start_paused = true)]
    async fn rows_sharing_a_timestamp_survive_a_batch_boundary() {
        let team = Uuid::new_v4();
        let start = Utc::now();
        let at = start + ChronoDuration::seconds(1);
        let mut same: Vec<ActivityEvent> = (0..3).map(|i| event(team, at, &format!("row {i}"))).collect();
        same.sort_by_key(|e| e.id);

        // a batch of two ends mid-timestamp, the third row comes next poll
        let source = Arc::new(ScriptedSource {
            batches: Mutex::new(vec![same[..2].to_vec(), same[2..].to_vec()]),
            ..Default::default()
        });
        let config = SseConfig {
            batch_size: 2,
            ..SseConfig::default()
        };

        let (tx, mut rx) = mpsc::channel(64);
        let handle = tokio::spawn(run_activity_loop(source.clone(), team, start, config, tx));

        let mut delivered = Vec::new();
        while let Some(event) = rx.recv().await {
            if let SdrEvent::Activity(row) = event {
                delivered.push(row.id);
            }
        }
        handle.await.unwrap();

        assert_eq!(delivered, same.iter().map(|e| e.id).collect::<Vec<_>>());
        let polls = source.polls.lock().unwrap();
        assert_eq!(polls[1], Cursor::of(&same[1]));
        assert!(polls[1].precedes(&same[2]));
    }

    #[test]
    fn cursor_orders_by_time_then_id() {
        let team = Uuid::new_v4();
        let at = Utc::now();
        let mut pair = [event(team, at, "a"), event(team, at, "b")];
        pair.sort_by_key(|e| e.id);

        assert!(Cursor::after(at - ChronoDuration::seconds(1)).precedes(&pair[0]));
        assert!(!Cursor::after(at).precedes(&pair[0]));
        assert!(Cursor::of(&pair[0]).precedes(&pair[1]));
        assert!(!Cursor::of(&pair[1]).precedes(&pair[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_client_ends_the_loop() {
        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(run_activity_loop(
            Arc::new(ScriptedSource::default()),
            Uuid::new_v4(),
            Utc::now(),
            SseConfig::default(),
            tx,
        ));
        drop(rx);
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("loop should stop once the client is gone")
            .unwrap();
    }

    #[test]
    fn events_carry_their_names() {
        let e = SdrEvent::Heartbeat { at: Utc::now() };
        assert_eq!(e.name(), "heartbeat");
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "heartbeat");
    }
}
