//! Every API route, merged from the module that owns it.

use axum::Router;
use std::sync::Arc;

use crate::core::shared::state::AppState;

pub fn configure_api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(crate::core::tenant::configure_team_routes())
        .merge(crate::leads::configure_lead_routes())
        .merge(crate::sectors::configure_sector_routes())
        .merge(crate::campaigns::configure_campaign_routes())
        .merge(crate::sms::api::configure_sms_routes())
        .merge(crate::sms::signalhouse::configure_signalhouse_routes())
        .merge(crate::sms::webhook::configure_sms_webhook_routes())
        .merge(crate::voice::configure_voice_routes())
        .merge(crate::dialer::configure_dialer_routes())
        .merge(crate::sdr::configure_sdr_routes())
        .merge(crate::notifications::configure_notification_routes())
        .merge(crate::gianna::configure_gianna_routes())
        .merge(crate::billing::configure_billing_routes())
        .merge(crate::enrichment::configure_enrichment_routes())
        .merge(crate::llm::configure_llm_routes())
        .merge(crate::drive::configure_bucket_routes())
}
