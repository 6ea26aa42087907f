use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;

use crate::core::shared::state::AppState;

/// Liveness only; never touches the database.
pub async fn health_check_simple() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "service": "nextier",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let db_ok = state.conn.get().is_ok();

    let status = if db_ok { "healthy" } else { "degraded" };
    let code = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(serde_json::json!({
            "status": status,
            "service": "nextier",
            "version": env!("CARGO_PKG_VERSION"),
            "database": db_ok,
            "providers": {
                "sms": state.sms_sender.is_some(),
                "twilio": state.config.twilio.is_some(),
                "stripe": state.stripe.is_some(),
                "apollo": state.apollo.is_some(),
                "realestate": state.realestate.is_some(),
                "drive": state.drive.is_some(),
                "llm": state.llm.as_ref().map(|g| g.name()),
            }
        })),
    )
}
