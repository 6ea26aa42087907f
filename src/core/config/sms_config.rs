use chrono::Weekday;

use super::{env_opt, env_parse};

/// Drip-queue limits and the sending window. Hours are UTC.
#[derive(Clone, Debug)]
pub struct SmsConfig {
    pub batch_size: usize,
    pub max_per_day: u32,
    pub max_per_hour: u32,
    pub max_retries: u32,
    pub retry_delay_secs: i64,
    pub window_start_hour: u32,
    pub window_end_hour: u32,
    pub window_days: Vec<Weekday>,
    pub message_budget: usize,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            batch_size: 250,
            max_per_day: 2000,
            max_per_hour: 500,
            max_retries: 3,
            retry_delay_secs: 60,
            window_start_hour: 9,
            window_end_hour: 17,
            window_days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
            message_budget: 160,
        }
    }
}

impl SmsConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let window_days = env_opt("SMS_WINDOW_DAYS")
            .map(|raw| parse_days(&raw))
            .filter(|days| !days.is_empty())
            .unwrap_or(d.window_days);

        Self {
            batch_size: env_parse("SMS_BATCH_SIZE", d.batch_size),
            max_per_day: env_parse("SMS_MAX_PER_DAY", d.max_per_day),
            max_per_hour: env_parse("SMS_MAX_PER_HOUR", d.max_per_hour),
            max_retries: env_parse("SMS_MAX_RETRIES", d.max_retries),
            retry_delay_secs: env_parse("SMS_RETRY_DELAY_SECS", d.retry_delay_secs),
            window_start_hour: env_parse("SMS_WINDOW_START", d.window_start_hour).min(23),
            window_end_hour: env_parse("SMS_WINDOW_END", d.window_end_hour).min(24),
            window_days,
            message_budget: env_parse("SMS_MESSAGE_BUDGET", d.message_budget),
        }
    }
}

/// Parses "mon,tue,fri" style lists; unknown names are ignored.
pub fn parse_days(raw: &str) -> Vec<Weekday> {
    raw.split(',')
        .filter_map(|d| d.trim().parse::<Weekday>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_day_lists() {
        assert_eq!(
            parse_days("mon, wed,Fri"),
            vec![Weekday::Mon, Weekday::Wed, Weekday::Fri]
        );
        assert!(parse_days("someday").is_empty());
    }
}
