//! Gianna, the AI SMS agent: per-team reply settings and the auto-reply
//! gate. Settings live in memory only and reset on restart.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::core::shared::{ApiError, ApiResponse, ApiResult, AppState};
use crate::core::tenant::TeamContext;
use crate::leads::classification::ResponseKind;
use crate::sms::remix::RemixSettings;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMode {
    #[default]
    HumanInLoop,
    FullAuto,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessHours {
    /// `HH:MM`, UTC.
    pub start: String,
    pub end: String,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            start: "09:00".to_string(),
            end: "18:00".to_string(),
        }
    }
}

impl BusinessHours {
    fn parse(value: &str) -> Result<NaiveTime, ApiError> {
        NaiveTime::parse_from_str(value.trim(), "%H:%M")
            .map_err(|_| ApiError::bad_request(format!("invalid time {value}, expected HH:MM")))
    }

    pub fn bounds(&self) -> Result<(NaiveTime, NaiveTime), ApiError> {
        let start = Self::parse(&self.start)?;
        let end = Self::parse(&self.end)?;
        if start >= end {
            return Err(ApiError::bad_request("business hours must start before they end"));
        }
        Ok((start, end))
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        match self.bounds() {
            Ok((start, end)) => {
                let t = now.time();
                t >= start && t < end
            }
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GiannaSettings {
    pub mode: ReplyMode,
    pub auto_reply_delay_secs: u32,
    /// 0-100
    pub min_confidence: u8,
    pub default_tone: RemixSettings,
    /// Classification ids Gianna may answer on her own.
    pub enabled_categories: Vec<String>,
    pub business_hours: BusinessHours,
    pub max_auto_replies_per_day: u32,
    pub notify_on_reply: bool,
}

impl Default for GiannaSettings {
    fn default() -> Self {
        Self {
            mode: ReplyMode::HumanInLoop,
            auto_reply_delay_secs: 60,
            min_confidence: 80,
            default_tone: RemixSettings::default(),
            enabled_categories: vec![
                ResponseKind::Question.id().to_string(),
                ResponseKind::Interested.id().to_string(),
                ResponseKind::ThankYou.id().to_string(),
            ],
            business_hours: BusinessHours::default(),
            max_auto_replies_per_day: 100,
            notify_on_reply: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SettingsUpdate {
    pub mode: Option<ReplyMode>,
    pub auto_reply_delay_secs: Option<u32>,
    pub min_confidence: Option<u8>,
    pub default_tone: Option<RemixSettings>,
    pub enabled_categories: Option<Vec<String>>,
    pub business_hours: Option<BusinessHours>,
    pub max_auto_replies_per_day: Option<u32>,
    pub notify_on_reply: Option<bool>,
}

impl GiannaSettings {
    /// Applies the fields present in `update`, rejecting the whole update
    /// when any field is out of range.
    pub fn apply(&self, update: SettingsUpdate) -> Result<Self, ApiError> {
        let mut next = self.clone();
        if let Some(mode) = update.mode {
            next.mode = mode;
        }
        if let Some(delay) = update.auto_reply_delay_secs {
            if delay > 3600 {
                return Err(ApiError::bad_request("auto_reply_delay_secs must be at most 3600"));
            }
            next.auto_reply_delay_secs = delay;
        }
        if let Some(confidence) = update.min_confidence {
            if confidence > 100 {
                return Err(ApiError::bad_request("min_confidence must be between 0 and 100"));
            }
            next.min_confidence = confidence;
        }
        if let Some(tone) = update.default_tone {
            next.default_tone = tone.clamped();
        }
        if let Some(categories) = update.enabled_categories {
            for c in &categories {
                c.parse::<ResponseKind>().map_err(ApiError::bad_request)?;
            }
            next.enabled_categories = categories;
        }
        if let Some(hours) = update.business_hours {
            hours.bounds()?;
            next.business_hours = hours;
        }
        if let Some(max) = update.max_auto_replies_per_day {
            next.max_auto_replies_per_day = max;
        }
        if let Some(notify) = update.notify_on_reply {
            next.notify_on_reply = notify;
        }
        Ok(next)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyDecision {
    pub auto_reply: bool,
    pub reason: &'static str,
    pub delay_secs: u32,
}

impl ReplyDecision {
    fn no(reason: &'static str) -> Self {
        Self {
            auto_reply: false,
            reason,
            delay_secs: 0,
        }
    }
}

/// Whether Gianna may answer a classified reply without a human. Every gate
/// must pass; the first failing one is reported.
pub fn should_auto_reply(
    settings: &GiannaSettings,
    category: ResponseKind,
    confidence: u8,
    now: DateTime<Utc>,
    replies_today: u32,
) -> ReplyDecision {
    if settings.mode != ReplyMode::FullAuto {
        return ReplyDecision::no("human_in_loop");
    }
    if category.suppressed() {
        return ReplyDecision::no("suppressed_category");
    }
    if !settings.enabled_categories.iter().any(|c| c == category.id()) {
        return ReplyDecision::no("category_disabled");
    }
    if confidence < settings.min_confidence {
        return ReplyDecision::no("low_confidence");
    }
    if !settings.business_hours.contains(now) {
        return ReplyDecision::no("outside_business_hours");
    }
    if replies_today >= settings.max_auto_replies_per_day {
        return ReplyDecision::no("daily_limit");
    }
    ReplyDecision {
        auto_reply: true,
        reason: "ok",
        delay_secs: settings.auto_reply_delay_secs,
    }
}

#[derive(Debug, Default)]
struct TeamEntry {
    settings: Option<GiannaSettings>,
    replies: Option<(NaiveDate, u32)>,
}

#[derive(Debug, Default)]
pub struct GiannaSettingsStore {
    teams: RwLock<HashMap<Uuid, TeamEntry>>,
}

impl GiannaSettingsStore {
    pub async fn get(&self, team_id: Uuid) -> GiannaSettings {
        let teams = self.teams.read().await;
        teams
            .get(&team_id)
            .and_then(|e| e.settings.clone())
            .unwrap_or_default()
    }

    pub async fn update(&self, team_id: Uuid, update: SettingsUpdate) -> Result<GiannaSettings, ApiError> {
        let mut teams = self.teams.write().await;
        let entry = teams.entry(team_id).or_default();
        let next = entry.settings.clone().unwrap_or_default().apply(update)?;
        entry.settings = Some(next.clone());
        info!("Updated Gianna settings for team {team_id}: mode {:?}", next.mode);
        Ok(next)
    }

    pub async fn reset(&self, team_id: Uuid) -> GiannaSettings {
        let mut teams = self.teams.write().await;
        if let Some(entry) = teams.get_mut(&team_id) {
            entry.settings = None;
        }
        GiannaSettings::default()
    }

    pub async fn replies_today(&self, team_id: Uuid, now: DateTime<Utc>) -> u32 {
        let teams = self.teams.read().await;
        match teams.get(&team_id).and_then(|e| e.replies) {
            Some((day, n)) if day == now.date_naive() => n,
            _ => 0,
        }
    }

    pub async fn record_auto_reply(&self, team_id: Uuid, now: DateTime<Utc>) -> u32 {
        let mut teams = self.teams.write().await;
        let entry = teams.entry(team_id).or_default();
        let today = now.date_naive();
        let count = match entry.replies {
            Some((day, n)) if day == today => n + 1,
            _ => 1,
        };
        entry.replies = Some((today, count));
        count
    }
}

#[derive(Debug, Deserialize)]
pub struct DecideRequest {
    pub category: String,
    #[serde(default = "full_confidence")]
    pub confidence: u8,
    /// Count the reply against today's limit when it is allowed.
    #[serde(default)]
    pub commit: bool,
}

fn full_confidence() -> u8 {
    100
}

pub async fn get_settings(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
) -> ApiResponse<GiannaSettings> {
    ApiResponse::ok(state.gianna.get(ctx.team_id).await)
}

pub async fn update_settings(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Json(req): Json<SettingsUpdate>,
) -> ApiResult<GiannaSettings> {
    Ok(ApiResponse::ok(state.gianna.update(ctx.team_id, req).await?))
}

pub async fn reset_settings(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
) -> ApiResponse<GiannaSettings> {
    ApiResponse::ok(state.gianna.reset(ctx.team_id).await)
}

pub async fn decide(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Json(req): Json<DecideRequest>,
) -> ApiResult<ReplyDecision> {
    let category: ResponseKind = req.category.parse().map_err(ApiError::bad_request)?;
    let now = Utc::now();
    let settings = state.gianna.get(ctx.team_id).await;
    let replies = state.gianna.replies_today(ctx.team_id, now).await;

    let decision = should_auto_reply(&settings, category, req.confidence, now, replies);
    if decision.auto_reply && req.commit {
        state.gianna.record_auto_reply(ctx.team_id, now).await;
    }
    debug!(
        "Gianna decision for team {} on {category}: {}",
        ctx.team_id, decision.reason
    );
    Ok(ApiResponse::ok(decision))
}

pub fn configure_gianna_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/api/gianna/settings",
            get(get_settings).put(update_settings).delete(reset_settings),
        )
        .route("/api/gianna/decide", post(decide))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 14, 12, 0, 0).unwrap()
    }

    fn auto() -> GiannaSettings {
        GiannaSettings {
            mode: ReplyMode::FullAuto,
            ..Default::default()
        }
    }

    #[test]
    fn human_in_loop_never_auto_replies() {
        let d = should_auto_reply(&GiannaSettings::default(), ResponseKind::Question, 100, noon(), 0);
        assert_eq!(d, ReplyDecision::no("human_in_loop"));
    }

    #[test]
    fn gates_apply_in_order() {
        let s = auto();
        assert_eq!(should_auto_reply(&s, ResponseKind::OptOut, 100, noon(), 0).reason, "suppressed_category");
        assert_eq!(should_auto_reply(&s, ResponseKind::EmailCapture, 100, noon(), 0).reason, "category_disabled");
        assert_eq!(should_auto_reply(&s, ResponseKind::Question, 79, noon(), 0).reason, "low_confidence");

        let late = Utc.with_ymd_and_hms(2026, 1, 14, 18, 0, 0).unwrap();
        assert_eq!(should_auto_reply(&s, ResponseKind::Question, 90, late, 0).reason, "outside_business_hours");
        assert_eq!(should_auto_reply(&s, ResponseKind::Question, 90, noon(), 100).reason, "daily_limit");

        let ok = should_auto_reply(&s, ResponseKind::Question, 90, noon(), 99);
        assert!(ok.auto_reply);
        assert_eq!(ok.delay_secs, 60);
    }

    #[test]
    fn updates_are_validated_as_a_whole() {
        let base = GiannaSettings::default();
        let bad = base.apply(SettingsUpdate {
            mode: Some(ReplyMode::FullAuto),
            min_confidence: Some(101),
            ..Default::default()
        });
        assert!(bad.is_err());

        assert!(base
            .apply(SettingsUpdate {
                enabled_categories: Some(vec!["gossip".into()]),
                ..Default::default()
            })
            .is_err());

        assert!(base
            .apply(SettingsUpdate {
                business_hours: Some(BusinessHours {
                    start: "17:00".into(),
                    end: "09:00".into(),
                }),
                ..Default::default()
            })
            .is_err());

        let next = base
            .apply(SettingsUpdate {
                mode: Some(ReplyMode::FullAuto),
                min_confidence: Some(60),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(next.mode, ReplyMode::FullAuto);
        assert_eq!(next.min_confidence, 60);
        assert_eq!(next.max_auto_replies_per_day, 100);
    }

    #[tokio::test]
    async fn store_is_per_team_and_counts_replies_per_day() {
        let store = GiannaSettingsStore::default();
        let team = Uuid::new_v4();
        let other = Uuid::new_v4();

        store
            .update(team, SettingsUpdate {
                mode: Some(ReplyMode::FullAuto),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(store.get(team).await.mode, ReplyMode::FullAuto);
        assert_eq!(store.get(other).await, GiannaSettings::default());

        assert_eq!(store.record_auto_reply(team, noon()).await, 1);
        assert_eq!(store.record_auto_reply(team, noon()).await, 2);
        assert_eq!(store.replies_today(team, noon()).await, 2);
        let tomorrow = noon() + chrono::Duration::days(1);
        assert_eq!(store.replies_today(team, tomorrow).await, 0);

        store.reset(team).await;
        assert_eq!(store.get(team).await.mode, ReplyMode::HumanInLoop);
    }
}
