use chrono::{DateTime, Duration, DurationRound, Utc};
use diesel::dsl::count_star;
use diesel::prelude::*;
use diesel::PgConnection;
use serde::Serialize;
use uuid::Uuid;

use crate::core::config::SmsConfig;
use crate::core::shared::schema::sms_messages;
use crate::core::shared::ApiError;

pub const OUTBOUND: &str = "outbound";
pub const INBOUND: &str = "inbound";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SendCounts {
    pub today: u32,
    pub this_hour: u32,
}

pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(Duration::days(1)).unwrap_or(now)
}

pub fn start_of_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(Duration::hours(1)).unwrap_or(now)
}

fn outbound_since(
    conn: &mut PgConnection,
    team_id: Uuid,
    since: DateTime<Utc>,
) -> Result<u32, ApiError> {
    let n: i64 = sms_messages::table
        .filter(sms_messages::team_id.eq(team_id))
        .filter(sms_messages::direction.eq(OUTBOUND))
        .filter(sms_messages::created_at.ge(since))
        .select(count_star())
        .first(conn)?;
    Ok(u32::try_from(n).unwrap_or(u32::MAX))
}

/// Outbound rows logged for the team since the start of the current UTC day
/// and hour.
pub fn sent_counts(
    conn: &mut PgConnection,
    team_id: Uuid,
    now: DateTime<Utc>,
) -> Result<SendCounts, ApiError> {
    Ok(SendCounts {
        today: outbound_since(conn, team_id, start_of_day(now))?,
        this_hour: outbound_since(conn, team_id, start_of_hour(now))?,
    })
}

pub fn remaining_today(config: &SmsConfig, counts: SendCounts) -> u32 {
    config.max_per_day.saturating_sub(counts.today)
}

pub fn remaining_this_hour(config: &SmsConfig, counts: SendCounts) -> u32 {
    config.max_per_hour.saturating_sub(counts.this_hour)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn truncates_to_utc_boundaries() {
        let now = Utc.with_ymd_and_hms(2026, 3, 9, 14, 37, 12).unwrap();
        assert_eq!(
            start_of_day(now),
            Utc.with_ymd_and_hms(2026, 3, 9, 0, 0, 0).unwrap()
        );
        assert_eq!(
            start_of_hour(now),
            Utc.with_ymd_and_hms(2026, 3, 9, 14, 0, 0).unwrap()
        );
    }

    #[test]
    fn remaining_never_underflows() {
        let config = SmsConfig::default();
        let counts = SendCounts {
            today: 2500,
            this_hour: 10,
        };
        assert_eq!(remaining_today(&config, counts), 0);
        assert_eq!(remaining_this_hour(&config, counts), 490);
    }
}
