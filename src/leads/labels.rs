use chrono::{DateTime, Duration, Timelike, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use super::classification::{Classification, ResponseKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AutoAction {
    AddToSuppression { reason: String },
    CancelPendingMessages,
    MoveToBucket { bucket: String },
    ScheduleNurture { delay_days: u32 },
    SendValueX { deliverable: String },
    QueueForCall { priority: CallPriority },
    NotifyOperator { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallPriority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagDefinition {
    pub id: &'static str,
    pub name: &'static str,
    pub priority: u32,
    pub mutually_exclusive: &'static [&'static str],
}

pub const OPTED_OUT: &str = "opted_out";
pub const WRONG_NUMBER: &str = "wrong_number";
pub const NOT_INTERESTED: &str = "not_interested";
pub const EMAIL_CAPTURED: &str = "email_captured";
pub const MOBILE_CAPTURED: &str = "mobile_captured";
pub const WANTS_CALL: &str = "wants_call";
pub const QUESTION_PENDING: &str = "question_pending";
pub const HIGH_INTENT: &str = "high_intent";
pub const QUALIFIED: &str = "qualified";
pub const NURTURE: &str = "nurture";

pub const TAGS: &[TagDefinition] = &[
    TagDefinition {
        id: OPTED_OUT,
        name: "Opted Out",
        priority: 200,
        mutually_exclusive: &[HIGH_INTENT, QUALIFIED, WANTS_CALL],
    },
    TagDefinition {
        id: WRONG_NUMBER,
        name: "Wrong Number",
        priority: 185,
        mutually_exclusive: &[EMAIL_CAPTURED, MOBILE_CAPTURED, QUALIFIED],
    },
    TagDefinition {
        id: NOT_INTERESTED,
        name: "Not Interested",
        priority: 180,
        mutually_exclusive: &[],
    },
    TagDefinition {
        id: EMAIL_CAPTURED,
        name: "Email Captured",
        priority: 100,
        mutually_exclusive: &[],
    },
    TagDefinition {
        id: MOBILE_CAPTURED,
        name: "Mobile Verified",
        priority: 95,
        mutually_exclusive: &[],
    },
    TagDefinition {
        id: WANTS_CALL,
        name: "Wants Call",
        priority: 90,
        mutually_exclusive: &[],
    },
    TagDefinition {
        id: QUESTION_PENDING,
        name: "Question Pending",
        priority: 85,
        mutually_exclusive: &[],
    },
    TagDefinition {
        id: HIGH_INTENT,
        name: "High Intent",
        priority: 80,
        mutually_exclusive: &[],
    },
    TagDefinition {
        id: QUALIFIED,
        name: "Qualified",
        priority: 75,
        mutually_exclusive: &[],
    },
    TagDefinition {
        id: NURTURE,
        name: "Nurture",
        priority: 30,
        mutually_exclusive: &[],
    },
];

pub fn tag(id: &str) -> Option<&'static TagDefinition> {
    TAGS.iter().find(|t| t.id == id)
}

fn auto_actions(tag_id: &str) -> Vec<AutoAction> {
    match tag_id {
        OPTED_OUT => vec![
            AutoAction::AddToSuppression {
                reason: "opt_out".into(),
            },
            AutoAction::CancelPendingMessages,
        ],
        WRONG_NUMBER => vec![
            AutoAction::AddToSuppression {
                reason: "wrong_number".into(),
            },
            AutoAction::CancelPendingMessages,
            AutoAction::MoveToBucket {
                bucket: "invalid-leads".into(),
            },
        ],
        NOT_INTERESTED => vec![AutoAction::ScheduleNurture { delay_days: 90 }],
        EMAIL_CAPTURED => vec![
            AutoAction::SendValueX {
                deliverable: "property-valuation-report".into(),
            },
            AutoAction::QueueForCall {
                priority: CallPriority::High,
            },
            AutoAction::NotifyOperator {
                message: "New email capture - Value X queued".into(),
            },
        ],
        WANTS_CALL => vec![
            AutoAction::QueueForCall {
                priority: CallPriority::High,
            },
            AutoAction::NotifyOperator {
                message: "Lead requested callback".into(),
            },
        ],
        QUESTION_PENDING => vec![AutoAction::NotifyOperator {
            message: "Question needs response".into(),
        }],
        HIGH_INTENT => vec![AutoAction::QueueForCall {
            priority: CallPriority::High,
        }],
        _ => Vec::new(),
    }
}

fn tags_for(classification: &Classification) -> &'static [&'static str] {
    match classification.kind {
        ResponseKind::OptOut => &[OPTED_OUT],
        ResponseKind::Profanity if classification.opt_out => &[OPTED_OUT],
        ResponseKind::WrongNumber => &[WRONG_NUMBER],
        ResponseKind::NotInterested => &[NOT_INTERESTED],
        ResponseKind::EmailCapture if classification.email.is_some() => {
            &[EMAIL_CAPTURED, HIGH_INTENT]
        }
        ResponseKind::CalledPhoneLine => &[HIGH_INTENT, WANTS_CALL, MOBILE_CAPTURED],
        ResponseKind::Question => &[QUESTION_PENDING],
        ResponseKind::Assistance => &[QUESTION_PENDING, HIGH_INTENT],
        ResponseKind::Interested => &[HIGH_INTENT],
        _ => &[],
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LabelingResult {
    pub classification: Classification,
    pub applied: Vec<String>,
    pub removed: Vec<String>,
    pub actions: Vec<AutoAction>,
    pub priority_score: i32,
    pub tags: Vec<String>,
}

impl LabelingResult {
    pub fn wants_call_queue(&self) -> bool {
        self.actions
            .iter()
            .any(|a| matches!(a, AutoAction::QueueForCall { .. }))
    }

    pub fn cancels_pending(&self) -> bool {
        self.actions.contains(&AutoAction::CancelPendingMessages)
    }
}

fn exclusive(a: &TagDefinition, b: &str) -> bool {
    a.mutually_exclusive.contains(&b)
        || tag(b).is_some_and(|other| other.mutually_exclusive.contains(&a.id))
}

/// Maps a classified reply onto the lead's tag set. Exclusive tags resolve by
/// priority: a new tag is skipped when the lead already carries a
/// higher-priority tag it conflicts with, otherwise it lands and evicts the
/// conflicting tags. `tags` is the resulting set.
pub fn apply_labels(classification: Classification, existing: &[String]) -> LabelingResult {
    let mut applied: Vec<String> = Vec::new();
    let mut removed: Vec<String> = Vec::new();
    let mut actions = Vec::new();

    for &tag_id in tags_for(&classification) {
        let Some(def) = tag(tag_id) else { continue };

        let blocked = existing.iter().any(|t| {
            exclusive(def, t) && tag(t).is_some_and(|other| other.priority > def.priority)
        });
        if blocked {
            debug!("Skipping tag {tag_id}: lead carries a higher-priority exclusive tag");
            continue;
        }

        if !applied.iter().any(|t| t == tag_id) {
            applied.push(tag_id.to_string());
        }
        for t in existing {
            if exclusive(def, t) && !removed.contains(t) {
                removed.push(t.clone());
            }
        }
        actions.extend(auto_actions(tag_id));
    }

    let mut tags: Vec<String> = existing
        .iter()
        .filter(|t| !removed.contains(*t))
        .cloned()
        .collect();
    for t in &applied {
        if !tags.contains(t) {
            tags.push(t.clone());
        }
    }

    let priority_score = priority_score(&tags);
    LabelingResult {
        classification,
        applied,
        removed,
        actions,
        priority_score,
        tags,
    }
}

pub const GOLD: i32 = 100;
pub const GREEN: i32 = 75;
pub const STANDARD: i32 = 50;
pub const LOW: i32 = 25;

pub fn priority_score<S: AsRef<str>>(tags: &[S]) -> i32 {
    let has = |id: &str| tags.iter().any(|t| t.as_ref() == id);

    if has(EMAIL_CAPTURED) && has(MOBILE_CAPTURED) {
        GOLD
    } else if has(EMAIL_CAPTURED) || has(HIGH_INTENT) || has(WANTS_CALL) {
        GREEN
    } else if has(OPTED_OUT) || has(WRONG_NUMBER) || has(NOT_INTERESTED) {
        LOW
    } else {
        STANDARD
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityTier {
    Gold,
    Green,
    Standard,
    Low,
}

pub fn priority_tier(score: i32) -> PriorityTier {
    if score >= GOLD {
        PriorityTier::Gold
    } else if score >= GREEN {
        PriorityTier::Green
    } else if score > LOW {
        PriorityTier::Standard
    } else {
        PriorityTier::Low
    }
}

#[derive(Debug, Clone)]
pub struct CallQueueConfig {
    pub follow_up_delay_hours: i64,
    pub max_call_attempts: u32,
    /// `[start, end)` hours, sorted.
    pub windows: Vec<(u32, u32)>,
}

impl Default for CallQueueConfig {
    fn default() -> Self {
        Self {
            follow_up_delay_hours: 24,
            max_call_attempts: 3,
            windows: vec![(9, 12), (14, 17)],
        }
    }
}

/// When to call back: `now` plus the follow-up delay, moved forward to the
/// next window start when it lands outside every window.
pub fn call_queue_time(now: DateTime<Utc>, config: &CallQueueConfig) -> DateTime<Utc> {
    let target = now + Duration::hours(config.follow_up_delay_hours);
    let hour = target.hour();

    if config.windows.is_empty() || config.windows.iter().any(|&(s, e)| hour >= s && hour < e) {
        return target;
    }

    let day = target.date_naive();
    let (day, start) = match config.windows.iter().find(|&&(s, _)| s > hour) {
        Some(&(s, _)) => (day, s),
        None => (day + Duration::days(1), config.windows[0].0),
    };

    day.and_hms_opt(start, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(target)
}

/// The auto-actions of a labelling run, resolved to concrete follow-ups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FollowUps {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suppression: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_priority: Option<CallPriority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nurture_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deliverables: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub operator_notes: Vec<String>,
}

impl FollowUps {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub fn follow_ups(result: &LabelingResult, now: DateTime<Utc>, calls: &CallQueueConfig) -> FollowUps {
    let mut plan = FollowUps::default();
    for action in &result.actions {
        match action {
            AutoAction::AddToSuppression { reason } => {
                plan.suppression.get_or_insert_with(|| reason.clone());
            }
            // applied by the caller through `cancels_pending`
            AutoAction::CancelPendingMessages => {}
            AutoAction::MoveToBucket { bucket } => plan.bucket = Some(bucket.clone()),
            AutoAction::ScheduleNurture { delay_days } => {
                plan.nurture_at = Some(now + Duration::days(i64::from(*delay_days)));
            }
            AutoAction::SendValueX { deliverable } => {
                if !plan.deliverables.contains(deliverable) {
                    plan.deliverables.push(deliverable.clone());
                }
            }
            AutoAction::QueueForCall { priority } => {
                plan.call_at.get_or_insert_with(|| call_queue_time(now, calls));
                plan.call_priority.get_or_insert(*priority);
            }
            AutoAction::NotifyOperator { message } => plan.operator_notes.push(message.clone()),
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leads::classification::classify;
    use chrono::TimeZone;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn email_capture_applies_gold_path_tags() {
        let result = apply_labels(classify("me@home.com"), &tags(&[MOBILE_CAPTURED]));
        assert_eq!(result.applied, tags(&[EMAIL_CAPTURED, HIGH_INTENT]));
        assert_eq!(result.priority_score, GOLD);
        assert!(result.wants_call_queue());
        assert_eq!(priority_tier(result.priority_score), PriorityTier::Gold);
    }

    #[test]
    fn opt_out_removes_positive_tags() {
        let result = apply_labels(classify("STOP"), &tags(&[HIGH_INTENT, WANTS_CALL, NURTURE]));
        assert_eq!(result.applied, tags(&[OPTED_OUT]));
        assert_eq!(result.removed, tags(&[HIGH_INTENT, WANTS_CALL]));
        assert_eq!(result.tags, tags(&[NURTURE, OPTED_OUT]));
        assert_eq!(result.priority_score, LOW);
        assert!(result.cancels_pending());
    }

    #[test]
    fn profane_stop_is_labelled_opted_out() {
        let result = apply_labels(classify("STOP texting me, damn it"), &tags(&[HIGH_INTENT]));
        assert_eq!(result.applied, tags(&[OPTED_OUT]));
        assert_eq!(result.removed, tags(&[HIGH_INTENT]));
        assert!(result.cancels_pending());
    }

    #[test]
    fn follow_ups_resolve_auto_actions() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        let config = CallQueueConfig::default();

        let email = apply_labels(classify("dana@example.com"), &[]);
        let plan = follow_ups(&email, now, &config);
        assert_eq!(plan.deliverables, vec!["property-valuation-report".to_string()]);
        assert_eq!(plan.call_at, Some(call_queue_time(now, &config)));
        assert_eq!(plan.call_priority, Some(CallPriority::High));
        assert_eq!(plan.operator_notes.len(), 1);

        let refusal = apply_labels(classify("not interested"), &[]);
        let plan = follow_ups(&refusal, now, &config);
        assert_eq!(plan.nurture_at, Some(now + Duration::days(90)));
        assert!(plan.call_at.is_none());

        let wrong = apply_labels(classify("wrong number"), &[]);
        let plan = follow_ups(&wrong, now, &config);
        assert_eq!(plan.suppression.as_deref(), Some("wrong_number"));
        assert_eq!(plan.bucket.as_deref(), Some("invalid-leads"));

        assert!(follow_ups(&apply_labels(classify("thanks"), &[]), now, &config).is_empty());
    }

    #[test]
    fn higher_priority_exclusive_tag_blocks_new_tag() {
        let result = apply_labels(classify("yes"), &tags(&[OPTED_OUT]));
        assert!(result.applied.is_empty());
        assert!(result.actions.is_empty());
        assert_eq!(result.tags, tags(&[OPTED_OUT]));
    }

    #[test]
    fn wrong_number_evicts_qualified() {
        let result = apply_labels(classify("wrong number"), &tags(&[QUALIFIED]));
        assert_eq!(result.applied, tags(&[WRONG_NUMBER]));
        assert_eq!(result.removed, tags(&[QUALIFIED]));
    }

    #[test]
    fn thank_you_changes_nothing() {
        let result = apply_labels(classify("thanks"), &[]);
        assert!(result.applied.is_empty());
        assert_eq!(result.priority_score, STANDARD);
        assert_eq!(priority_tier(STANDARD), PriorityTier::Standard);
        assert_eq!(priority_tier(LOW), PriorityTier::Low);
    }

    #[test]
    fn call_time_snaps_into_windows() {
        let config = CallQueueConfig::default();

        // 10:00 + 24h is inside the morning window
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        assert_eq!(call_queue_time(now, &config), now + Duration::hours(24));

        // 12:30 + 24h falls into the lunch gap, moves to 14:00
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 12, 30, 0).unwrap();
        assert_eq!(
            call_queue_time(now, &config),
            Utc.with_ymd_and_hms(2026, 3, 3, 14, 0, 0).unwrap()
        );

        // 20:00 + 24h is after the last window, next morning
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 20, 0, 0).unwrap();
        assert_eq!(
            call_queue_time(now, &config),
            Utc.with_ymd_and_hms(2026, 3, 4, 9, 0, 0).unwrap()
        );
    }
}
