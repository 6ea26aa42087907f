//! Human-in-the-loop SMS queue.
//!
//! Drafts are rendered per lead and wait for an operator. Approved messages
//! are deployed to `pending`, and the processor drains pending messages in
//! priority order inside the sending window and under the daily and hourly
//! limits. Lives in memory only; a restart drops the queue.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::templates;
use crate::core::config::SmsConfig;
use crate::core::shared::{normalize_phone, ApiError};

pub const DEFAULT_PRIORITY: u8 = 5;
pub const DEFAULT_AGENT: &str = "gianna";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Draft,
    Approved,
    Pending,
    Processing,
    Sent,
    Failed,
    Rejected,
    Cancelled,
}

impl QueueStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Sent | Self::Failed | Self::Rejected | Self::Cancelled
        )
    }

    /// Still waiting to go out, so an opt-out or lead cancel applies.
    pub fn is_cancellable(self) -> bool {
        matches!(self, Self::Draft | Self::Approved | Self::Pending)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedMessage {
    pub id: Uuid,
    pub team_id: Uuid,
    pub lead_id: Option<Uuid>,
    pub campaign_id: Option<Uuid>,
    pub to: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_body: Option<String>,
    pub agent: String,
    pub priority: u8,
    pub status: QueueStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub provider_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One recipient of a draft run.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DraftTarget {
    pub lead_id: Option<Uuid>,
    pub phone: String,
    #[serde(default)]
    pub vars: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DraftOptions {
    pub campaign_id: Option<Uuid>,
    pub agent: Option<String>,
    pub priority: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DraftSummary {
    pub added: usize,
    pub skipped_opted_out: usize,
    pub skipped_invalid: usize,
    pub ids: Vec<Uuid>,
    /// Leads that actually got a draft.
    pub lead_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewMessage {
    pub lead_id: Option<Uuid>,
    pub campaign_id: Option<Uuid>,
    pub to: String,
    pub body: String,
    pub agent: Option<String>,
    pub priority: Option<u8>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub draft: usize,
    pub approved: usize,
    pub pending: usize,
    pub processing: usize,
    pub sent: usize,
    pub failed: usize,
    pub rejected: usize,
    pub cancelled: usize,
    pub opted_out_numbers: usize,
}

/// Who asked for the number to be suppressed. A recipient STOP outranks an
/// operator entry and cannot be lifted through the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptOutOrigin {
    Recipient,
    Team,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptOut {
    pub phone: String,
    pub origin: OptOutOrigin,
    /// Team the opt-out was recorded under. `None` for a STOP that could not
    /// be tied to a team.
    pub team_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queued message {0} not found")]
    NotFound(Uuid),
    #[error("message {id} is {status:?} and cannot be changed that way")]
    InvalidState { id: Uuid, status: QueueStatus },
    #[error("{0} has opted out")]
    OptedOut(String),
    #[error("invalid phone number: {0}")]
    InvalidPhone(String),
    #[error("message body is empty")]
    EmptyBody,
    #[error("{0} opted out by replying STOP and cannot be re-enabled")]
    RecipientOptOut(String),
    #[error("opt-out for {0} belongs to another team")]
    OptOutNotOwned(String),
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotFound(_) => Self::NotFound(err.to_string()),
            QueueError::RecipientOptOut(_) | QueueError::OptOutNotOwned(_) => {
                Self::Forbidden(err.to_string())
            }
            _ => Self::BadRequest(err.to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    /// Kept in send order: higher priority first, FIFO within a priority.
    messages: Vec<QueuedMessage>,
    opt_outs: HashMap<String, OptOut>,
}

impl QueueInner {
    fn insert(&mut self, msg: QueuedMessage) {
        let at = self
            .messages
            .iter()
            .position(|m| m.priority < msg.priority)
            .unwrap_or(self.messages.len());
        self.messages.insert(at, msg);
    }

    fn find_mut(&mut self, team_id: Uuid, id: Uuid) -> Result<&mut QueuedMessage, QueueError> {
        self.messages
            .iter_mut()
            .find(|m| m.id == id && m.team_id == team_id)
            .ok_or(QueueError::NotFound(id))
    }
}

#[derive(Debug)]
pub struct SmsQueue {
    config: SmsConfig,
    inner: RwLock<QueueInner>,
}

impl SmsQueue {
    pub fn new(config: SmsConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(QueueInner::default()),
        }
    }

    pub fn config(&self) -> &SmsConfig {
        &self.config
    }

    /// Renders `template` for every target as a draft. Opted-out and
    /// unusable numbers are counted and skipped.
    pub async fn add_drafts(
        &self,
        team_id: Uuid,
        template: &str,
        targets: Vec<DraftTarget>,
        options: DraftOptions,
    ) -> DraftSummary {
        let now = Utc::now();
        let agent = options.agent.unwrap_or_else(|| DEFAULT_AGENT.to_string());
        let priority = options.priority.unwrap_or(DEFAULT_PRIORITY).clamp(1, 10);

        let mut inner = self.inner.write().await;
        let mut summary = DraftSummary::default();

        for target in targets {
            let to = normalize_phone(&target.phone);
            if to.len() != 10 {
                summary.skipped_invalid += 1;
                continue;
            }
            if inner.opt_outs.contains_key(&to) {
                summary.skipped_opted_out += 1;
                continue;
            }

            let body = templates::render(template, &target.vars);
            let msg = QueuedMessage {
                id: Uuid::new_v4(),
                team_id,
                lead_id: target.lead_id,
                campaign_id: options.campaign_id,
                to,
                body,
                original_body: None,
                agent: agent.clone(),
                priority,
                status: QueueStatus::Draft,
                attempts: 0,
                last_error: None,
                rejection_reason: None,
                scheduled_at: None,
                sent_at: None,
                provider_message_id: None,
                created_at: now,
                updated_at: now,
            };
            summary.ids.push(msg.id);
            summary.lead_ids.extend(msg.lead_id);
            inner.insert(msg);
            summary.added += 1;
        }

        info!(
            "Queued {} SMS drafts for team {} ({} opted out, {} invalid)",
            summary.added, team_id, summary.skipped_opted_out, summary.skipped_invalid
        );
        summary
    }

    /// Adds a message straight to `pending`, skipping review.
    pub async fn enqueue(
        &self,
        team_id: Uuid,
        new: NewMessage,
    ) -> Result<QueuedMessage, QueueError> {
        let to = normalize_phone(&new.to);
        if to.len() != 10 {
            return Err(QueueError::InvalidPhone(new.to));
        }
        if new.body.trim().is_empty() {
            return Err(QueueError::EmptyBody);
        }

        let mut inner = self.inner.write().await;
        if inner.opt_outs.contains_key(&to) {
            return Err(QueueError::OptedOut(to));
        }

        let now = Utc::now();
        let msg = QueuedMessage {
            id: Uuid::new_v4(),
            team_id,
            lead_id: new.lead_id,
            campaign_id: new.campaign_id,
            to,
            body: new.body,
            original_body: None,
            agent: new.agent.unwrap_or_else(|| DEFAULT_AGENT.to_string()),
            priority: new.priority.unwrap_or(DEFAULT_PRIORITY).clamp(1, 10),
            status: QueueStatus::Pending,
            attempts: 0,
            last_error: None,
            rejection_reason: None,
            scheduled_at: new.scheduled_at,
            sent_at: None,
            provider_message_id: None,
            created_at: now,
            updated_at: now,
        };
        inner.insert(msg.clone());
        Ok(msg)
    }

    /// Drops drafts that were added but never committed anywhere else.
    /// Only `draft` entries of the team go; returns how many.
    pub async fn discard_drafts(&self, team_id: Uuid, ids: &[Uuid]) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.messages.len();
        inner.messages.retain(|m| {
            !(m.team_id == team_id && m.status == QueueStatus::Draft && ids.contains(&m.id))
        });
        before - inner.messages.len()
    }

    pub async fn get(&self, team_id: Uuid, id: Uuid) -> Option<QueuedMessage> {
        let inner = self.inner.read().await;
        inner
            .messages
            .iter()
            .find(|m| m.id == id && m.team_id == team_id)
            .cloned()
    }

    pub async fn list(
        &self,
        team_id: Uuid,
        status: Option<QueueStatus>,
        limit: usize,
    ) -> Vec<QueuedMessage> {
        let inner = self.inner.read().await;
        inner
            .messages
            .iter()
            .filter(|m| m.team_id == team_id)
            .filter(|m| status.map_or(true, |s| m.status == s))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn approve(&self, team_id: Uuid, id: Uuid) -> Result<QueuedMessage, QueueError> {
        let mut inner = self.inner.write().await;
        let msg = inner.find_mut(team_id, id)?;
        if msg.status != QueueStatus::Draft {
            return Err(QueueError::InvalidState {
                id,
                status: msg.status,
            });
        }
        msg.status = QueueStatus::Approved;
        msg.updated_at = Utc::now();
        Ok(msg.clone())
    }

    /// Approves every draft of a campaign. Returns how many moved.
    pub async fn approve_campaign(&self, team_id: Uuid, campaign_id: Uuid) -> usize {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let mut approved = 0;
        for msg in inner.messages.iter_mut().filter(|m| {
            m.team_id == team_id
                && m.campaign_id == Some(campaign_id)
                && m.status == QueueStatus::Draft
        }) {
            msg.status = QueueStatus::Approved;
            msg.updated_at = now;
            approved += 1;
        }
        approved
    }

    pub async fn reject(
        &self,
        team_id: Uuid,
        id: Uuid,
        reason: Option<String>,
    ) -> Result<QueuedMessage, QueueError> {
        let mut inner = self.inner.write().await;
        let msg = inner.find_mut(team_id, id)?;
        if !matches!(msg.status, QueueStatus::Draft | QueueStatus::Approved) {
            return Err(QueueError::InvalidState {
                id,
                status: msg.status,
            });
        }
        msg.status = QueueStatus::Rejected;
        msg.rejection_reason = reason;
        msg.updated_at = Utc::now();
        Ok(msg.clone())
    }

    /// Replaces the body of a draft or approved message. The first edit
    /// keeps the rendered text in `original_body`.
    pub async fn edit(
        &self,
        team_id: Uuid,
        id: Uuid,
        body: String,
    ) -> Result<QueuedMessage, QueueError> {
        if body.trim().is_empty() {
            return Err(QueueError::EmptyBody);
        }
        let mut inner = self.inner.write().await;
        let msg = inner.find_mut(team_id, id)?;
        if !matches!(msg.status, QueueStatus::Draft | QueueStatus::Approved) {
            return Err(QueueError::InvalidState {
                id,
                status: msg.status,
            });
        }
        if msg.original_body.is_none() {
            msg.original_body = Some(std::mem::take(&mut msg.body));
        }
        msg.body = body;
        msg.updated_at = Utc::now();
        Ok(msg.clone())
    }

    /// Moves approved messages to `pending`. With `ids`, only those.
    pub async fn deploy_approved(
        &self,
        team_id: Uuid,
        ids: Option<&[Uuid]>,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> usize {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let mut deployed = 0;
        for msg in inner.messages.iter_mut().filter(|m| {
            m.team_id == team_id
                && m.status == QueueStatus::Approved
                && ids.map_or(true, |ids| ids.contains(&m.id))
        }) {
            msg.status = QueueStatus::Pending;
            msg.scheduled_at = scheduled_at.or(msg.scheduled_at);
            msg.updated_at = now;
            deployed += 1;
        }
        if deployed > 0 {
            info!("Deployed {deployed} approved messages for team {team_id}");
        }
        deployed
    }

    async fn cancel_where(&self, team_id: Uuid, matches: impl Fn(&QueuedMessage) -> bool) -> usize {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let mut cancelled = 0;
        for msg in inner
            .messages
            .iter_mut()
            .filter(|m| m.team_id == team_id && m.status.is_cancellable() && matches(m))
        {
            msg.status = QueueStatus::Cancelled;
            msg.updated_at = now;
            cancelled += 1;
        }
        cancelled
    }

    pub async fn cancel_lead(&self, team_id: Uuid, lead_id: Uuid) -> usize {
        self.cancel_where(team_id, |m| m.lead_id == Some(lead_id))
            .await
    }

    pub async fn cancel_campaign(&self, team_id: Uuid, campaign_id: Uuid) -> usize {
        self.cancel_where(team_id, |m| m.campaign_id == Some(campaign_id))
            .await
    }

    /// Records the number as opted out and cancels everything still waiting
    /// to go to it, for every team. Returns how many messages were cancelled.
    ///
    /// An existing entry keeps its owner; a recipient STOP upgrades a team
    /// entry to [`OptOutOrigin::Recipient`].
    pub async fn add_opt_out(
        &self,
        team_id: Option<Uuid>,
        phone: &str,
        origin: OptOutOrigin,
    ) -> usize {
        let number = normalize_phone(phone);
        if number.is_empty() {
            return 0;
        }
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let mut cancelled = 0;
        for msg in inner
            .messages
            .iter_mut()
            .filter(|m| m.to == number && m.status.is_cancellable())
        {
            msg.status = QueueStatus::Cancelled;
            msg.updated_at = now;
            cancelled += 1;
        }

        match inner.opt_outs.get_mut(&number) {
            Some(existing) => {
                if origin == OptOutOrigin::Recipient {
                    existing.origin = OptOutOrigin::Recipient;
                    existing.team_id = existing.team_id.or(team_id);
                }
            }
            None => {
                inner.opt_outs.insert(
                    number.clone(),
                    OptOut {
                        phone: number.clone(),
                        origin,
                        team_id,
                        created_at: now,
                    },
                );
                info!("Opt-out ({origin:?}) recorded for {number}, cancelled {cancelled} queued messages");
            }
        }
        cancelled
    }

    /// Lifts a team-recorded opt-out. Recipient STOPs stay, and a team can
    /// only lift its own entries. `Ok(false)` when the number is not listed.
    pub async fn remove_opt_out(&self, team_id: Uuid, phone: &str) -> Result<bool, QueueError> {
        let number = normalize_phone(phone);
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.opt_outs.get(&number) else {
            return Ok(false);
        };
        if entry.origin == OptOutOrigin::Recipient {
            return Err(QueueError::RecipientOptOut(number));
        }
        if entry.team_id != Some(team_id) {
            warn!("Team {team_id} tried to lift an opt-out for {number} it does not own");
            return Err(QueueError::OptOutNotOwned(number));
        }
        inner.opt_outs.remove(&number);
        info!("Opt-out for {number} lifted by team {team_id}");
        Ok(true)
    }

    pub async fn opt_out(&self, phone: &str) -> Option<OptOut> {
        let number = normalize_phone(phone);
        self.inner.read().await.opt_outs.get(&number).cloned()
    }

    pub async fn is_opted_out(&self, phone: &str) -> bool {
        let number = normalize_phone(phone);
        self.inner.read().await.opt_outs.contains_key(&number)
    }

    pub async fn stats(&self, team_id: Uuid) -> QueueStats {
        let inner = self.inner.read().await;
        let mut stats = QueueStats {
            opted_out_numbers: inner
                .opt_outs
                .values()
                .filter(|o| o.team_id == Some(team_id))
                .count(),
            ..Default::default()
        };
        for msg in inner.messages.iter().filter(|m| m.team_id == team_id) {
            match msg.status {
                QueueStatus::Draft => stats.draft += 1,
                QueueStatus::Approved => stats.approved += 1,
                QueueStatus::Pending => stats.pending += 1,
                QueueStatus::Processing => stats.processing += 1,
                QueueStatus::Sent => stats.sent += 1,
                QueueStatus::Failed => stats.failed += 1,
                QueueStatus::Rejected => stats.rejected += 1,
                QueueStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    pub fn in_window(&self, now: DateTime<Utc>) -> bool {
        self.config.window_days.contains(&now.weekday())
            && (self.config.window_start_hour..self.config.window_end_hour).contains(&now.hour())
    }

    /// How many more messages the limits allow right now.
    pub fn capacity(&self, sent_today: u32, sent_this_hour: u32) -> usize {
        let day = self.config.max_per_day.saturating_sub(sent_today);
        let hour = self.config.max_per_hour.saturating_sub(sent_this_hour);
        (day.min(hour) as usize).min(self.config.batch_size)
    }

    /// Claims the next due pending messages for a team and marks them
    /// `processing`. Empty outside the sending window or once a limit is hit.
    pub async fn take_batch(
        &self,
        team_id: Uuid,
        now: DateTime<Utc>,
        sent_today: u32,
        sent_this_hour: u32,
    ) -> Vec<QueuedMessage> {
        if !self.in_window(now) {
            debug!("Outside the sending window at {now}, nothing taken");
            return Vec::new();
        }
        let capacity = self.capacity(sent_today, sent_this_hour);
        if capacity == 0 {
            warn!("SMS limits reached for team {team_id}: {sent_today} today, {sent_this_hour} this hour");
            return Vec::new();
        }

        let mut inner = self.inner.write().await;
        let QueueInner { messages, opt_outs } = &mut *inner;
        let mut batch = Vec::new();

        for msg in messages.iter_mut().filter(|m| {
            m.team_id == team_id
                && m.status == QueueStatus::Pending
                && m.scheduled_at.map_or(true, |at| at <= now)
        }) {
            if batch.len() >= capacity {
                break;
            }
            if opt_outs.contains_key(&msg.to) {
                msg.status = QueueStatus::Cancelled;
                msg.updated_at = now;
                continue;
            }
            msg.status = QueueStatus::Processing;
            msg.attempts += 1;
            msg.updated_at = now;
            batch.push(msg.clone());
        }
        batch
    }

    pub async fn mark_sent(
        &self,
        team_id: Uuid,
        id: Uuid,
        provider_message_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.write().await;
        let msg = inner.find_mut(team_id, id)?;
        msg.status = QueueStatus::Sent;
        msg.sent_at = Some(now);
        msg.provider_message_id = provider_message_id;
        msg.last_error = None;
        msg.updated_at = now;
        Ok(())
    }

    /// Puts the message back to `pending` after the retry delay, or fails it
    /// for good once it has used its attempts.
    pub async fn mark_failed(
        &self,
        team_id: Uuid,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<QueueStatus, QueueError> {
        let max_retries = self.config.max_retries;
        let delay = Duration::seconds(self.config.retry_delay_secs);

        let mut inner = self.inner.write().await;
        let msg = inner.find_mut(team_id, id)?;
        msg.last_error = Some(error.to_string());
        msg.updated_at = now;
        if msg.attempts < max_retries {
            msg.status = QueueStatus::Pending;
            msg.scheduled_at = Some(now + delay);
        } else {
            warn!("Giving up on message {id} to {} after {} attempts: {error}", msg.to, msg.attempts);
            msg.status = QueueStatus::Failed;
        }
        Ok(msg.status)
    }

    /// Drops the team's finished messages last touched before `older_than`.
    pub async fn cleanup(&self, team_id: Uuid, older_than: DateTime<Utc>) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.messages.len();
        inner.messages.retain(|m| {
            !(m.team_id == team_id && m.status.is_terminal() && m.updated_at < older_than)
        });
        let removed = before - inner.messages.len();
        if removed > 0 {
            debug!("Cleaned up {removed} finished queue entries for team {team_id}");
        }
        removed
    }
}
