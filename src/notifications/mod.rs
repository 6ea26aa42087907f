use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::core::shared::{ApiError, ApiResponse, ApiResult, AppState};
use crate::core::tenant::TeamContext;

pub const DEFAULT_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: Uuid,
    pub team_id: Uuid,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub lead_id: Option<Uuid>,
    pub priority: Priority,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewNotification {
    #[serde(default = "default_kind")]
    pub kind: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub lead_id: Option<Uuid>,
    #[serde(default)]
    pub priority: Priority,
}

fn default_kind() -> String {
    "info".to_string()
}

/// Recent notifications for every team, oldest evicted past capacity.
#[derive(Debug)]
pub struct NotificationLog {
    capacity: usize,
    entries: RwLock<VecDeque<Notification>>,
}

impl Default for NotificationLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl NotificationLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
        }
    }

    pub async fn push(&self, team_id: Uuid, new: NewNotification) -> Notification {
        let notification = Notification {
            id: Uuid::new_v4(),
            team_id,
            kind: new.kind,
            title: new.title,
            body: new.body,
            lead_id: new.lead_id,
            priority: new.priority,
            read: false,
            created_at: Utc::now(),
        };

        let mut entries = self.entries.write().await;
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(notification.clone());
        debug!("Notification {} for team {team_id}: {}", notification.id, notification.title);
        notification
    }

    /// Newest first.
    pub async fn list(&self, team_id: Uuid, unread_only: bool, limit: usize) -> Vec<Notification> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .rev()
            .filter(|n| n.team_id == team_id && (!unread_only || !n.read))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn unread_count(&self, team_id: Uuid) -> usize {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|n| n.team_id == team_id && !n.read)
            .count()
    }

    pub async fn mark_read(&self, team_id: Uuid, id: Uuid) -> bool {
        let mut entries = self.entries.write().await;
        match entries
            .iter_mut()
            .find(|n| n.id == id && n.team_id == team_id)
        {
            Some(n) => {
                n.read = true;
                true
            }
            None => false,
        }
    }

    pub async fn mark_all_read(&self, team_id: Uuid) -> usize {
        let mut entries = self.entries.write().await;
        let mut marked = 0;
        for n in entries
            .iter_mut()
            .filter(|n| n.team_id == team_id && !n.read)
        {
            n.read = true;
            marked += 1;
        }
        marked
    }

    pub async fn clear(&self, team_id: Uuid) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|n| n.team_id != team_id);
        before - entries.len()
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub unread: bool,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct NotificationList {
    pub notifications: Vec<Notification>,
    pub unread: usize,
}

#[derive(Debug, Serialize)]
pub struct Affected {
    pub count: usize,
}

pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Query(query): Query<ListQuery>,
) -> ApiResponse<NotificationList> {
    let limit = query.limit.unwrap_or(50).clamp(1, DEFAULT_CAPACITY);
    let notifications = state
        .notifications
        .list(ctx.team_id, query.unread, limit)
        .await;
    let unread = state.notifications.unread_count(ctx.team_id).await;
    ApiResponse::ok(NotificationList {
        notifications,
        unread,
    })
}

pub async fn create_notification(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Json(req): Json<NewNotification>,
) -> ApiResult<Notification> {
    if req.title.trim().is_empty() {
        return Err(ApiError::bad_request("title is required"));
    }
    let n = state.notifications.push(ctx.team_id, req).await;
    Ok(ApiResponse::created(n))
}

pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Uuid> {
    if !state.notifications.mark_read(ctx.team_id, id).await {
        return Err(ApiError::not_found("notification"));
    }
    Ok(ApiResponse::ok(id))
}

pub async fn mark_all_read(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
) -> ApiResponse<Affected> {
    let count = state.notifications.mark_all_read(ctx.team_id).await;
    ApiResponse::ok(Affected { count })
}

pub async fn clear_notifications(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
) -> ApiResponse<Affected> {
    let count = state.notifications.clear(ctx.team_id).await;
    ApiResponse::ok(Affected { count })
}

pub fn configure_notification_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/api/notifications",
            get(list_notifications)
                .post(create_notification)
                .delete(clear_notifications),
        )
        .route("/api/notifications/read-all", post(mark_all_read))
        .route("/api/notifications/:id/read", post(mark_read))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(title: &str) -> NewNotification {
        NewNotification {
            kind: "reply".to_string(),
            title: title.to_string(),
            body: String::new(),
            lead_id: None,
            priority: Priority::High,
        }
    }

    #[tokio::test]
    async fn evicts_oldest_past_capacity() {
        let log = NotificationLog::with_capacity(3);
        let team = Uuid::new_v4();
        for i in 0..5 {
            log.push(team, note(&format!("n{i}"))).await;
        }
        let titles: Vec<String> = log.list(team, false, 10).await.into_iter().map(|n| n.title).collect();
        assert_eq!(titles, vec!["n4", "n3", "n2"]);
    }

    #[tokio::test]
    async fn read_state_is_per_team() {
        let log = NotificationLog::default();
        let team = Uuid::new_v4();
        let other = Uuid::new_v4();
        let first = log.push(team, note("a")).await;
        log.push(team, note("b")).await;
        log.push(other, note("c")).await;

        assert!(log.mark_read(team, first.id).await);
        assert!(!log.mark_read(other, first.id).await);
        assert_eq!(log.unread_count(team).await, 1);
        assert_eq!(log.list(team, true, 10).await.len(), 1);

        assert_eq!(log.mark_all_read(team).await, 1);
        assert_eq!(log.unread_count(other).await, 1);

        assert_eq!(log.clear(team).await, 2);
        assert_eq!(log.list(other, false, 10).await.len(), 1);
    }
}
