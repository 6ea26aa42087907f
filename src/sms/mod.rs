pub mod api;
pub mod limits;
pub mod queue;
pub mod remix;
pub mod signalhouse;
pub mod templates;
pub mod webhook;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::shared::schema::sms_messages;
use crate::core::shared::ApiError;

pub use api::configure_sms_routes;
pub use signalhouse::configure_signalhouse_routes;
pub use webhook::configure_sms_webhook_routes;

/// What the provider told us about an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendOutcome {
    pub provider_message_id: Option<String>,
    pub status: String,
    pub from: String,
}

#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, to: &str, from: Option<&str>, body: &str) -> Result<SendOutcome, ApiError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = sms_messages)]
pub struct SmsMessage {
    pub id: Uuid,
    pub team_id: Uuid,
    pub lead_id: Option<Uuid>,
    pub campaign_id: Option<Uuid>,
    pub direction: String,
    pub from_number: String,
    pub to_number: String,
    pub body: String,
    pub status: String,
    pub provider_message_id: Option<String>,
    pub classification: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SmsMessage {
    pub fn outbound(
        team_id: Uuid,
        lead_id: Option<Uuid>,
        campaign_id: Option<Uuid>,
        to: &str,
        body: &str,
        outcome: &SendOutcome,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            team_id,
            lead_id,
            campaign_id,
            direction: limits::OUTBOUND.to_string(),
            from_number: outcome.from.clone(),
            to_number: to.to_string(),
            body: body.to_string(),
            status: outcome.status.clone(),
            provider_message_id: outcome.provider_message_id.clone(),
            classification: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn inbound(
        team_id: Uuid,
        lead_id: Option<Uuid>,
        from: &str,
        to: &str,
        body: &str,
        provider_message_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            team_id,
            lead_id,
            campaign_id: None,
            direction: limits::INBOUND.to_string(),
            from_number: from.to_string(),
            to_number: to.to_string(),
            body: body.to_string(),
            status: "received".to_string(),
            provider_message_id,
            classification: None,
            created_at: now,
            updated_at: now,
        }
    }
}

pub fn log_message(conn: &mut PgConnection, message: &SmsMessage) -> Result<(), ApiError> {
    diesel::insert_into(sms_messages::table)
        .values(message)
        .execute(conn)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every send and answers with a fixed outcome.
    #[derive(Default)]
    pub struct RecordingSender {
        pub sent: Mutex<Vec<(String, String)>>,
        pub fail: bool,
    }

    #[async_trait]
    impl SmsSender for RecordingSender {
        async fn send(
            &self,
            to: &str,
            _from: Option<&str>,
            body: &str,
        ) -> Result<SendOutcome, ApiError> {
            if self.fail {
                return Err(ApiError::Upstream("carrier rejected".to_string()));
            }
            let mut sent = self.sent.lock().map_err(|e| ApiError::Internal(e.to_string()))?;
            sent.push((to.to_string(), body.to_string()));
            Ok(SendOutcome {
                provider_message_id: Some(format!("test-{}", sent.len())),
                status: "sent".to_string(),
                from: "5559990000".to_string(),
            })
        }
    }
}
