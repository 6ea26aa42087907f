use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use log::{debug, error};
use reqwest::{Client, Method};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;

use super::{SendOutcome, SmsSender};
use crate::core::config::SignalHouseConfig;
use crate::core::shared::{normalize_phone, ApiError, ApiResponse, ApiResult, AppState};
use crate::core::tenant::TeamContext;

#[derive(Debug, thiserror::Error)]
pub enum SignalHouseError {
    #[error("network error: {0}")]
    Network(String),
    #[error("SignalHouse API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("no sender number configured")]
    MissingSender,
}

impl From<SignalHouseError> for ApiError {
    fn from(err: SignalHouseError) -> Self {
        match err {
            SignalHouseError::MissingSender => Self::BadRequest(err.to_string()),
            other => Self::Upstream(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageResult {
    pub message_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub from: String,
    pub segments: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenDlcCampaign {
    pub campaign_id: String,
    #[serde(default)]
    pub brand_id: String,
    #[serde(default)]
    pub usecase: String,
    pub description: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCampaignInput {
    pub brand_id: String,
    pub usecase: String,
    pub description: Option<String>,
    #[serde(default)]
    pub sample_messages: Vec<String>,
    pub message_flow: Option<String>,
    pub help_message: Option<String>,
    pub optout_message: Option<String>,
    pub sub_group_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubGroup {
    pub sub_group_id: String,
    pub name: String,
    pub description: Option<String>,
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub phone_numbers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubGroupInput {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageTemplate {
    pub template_id: String,
    pub name: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub variables: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneNumber {
    pub phone_number: String,
    pub friendly_name: Option<String>,
    pub campaign_id: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookInput {
    pub name: String,
    pub url: String,
    pub events: Vec<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    #[serde(alias = "id")]
    pub webhook_id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub events: Vec<String>,
    pub status: Option<String>,
}

/// SignalHouse answers, and calls back with, either `{"data": ...}` or the
/// bare payload.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Payload<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Payload<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Wrapped { data } => data,
            Self::Bare(data) => data,
        }
    }
}

#[derive(Deserialize)]
struct ApiErrorBody {
    #[serde(alias = "error")]
    message: Option<String>,
}

/// US numbers in E.164.
pub fn to_e164(phone: &str) -> String {
    let digits = normalize_phone(phone);
    format!("+1{digits}")
}

pub struct SignalHouseClient {
    http_client: Client,
    api_key: String,
    base_url: String,
    default_from: Option<String>,
}

impl SignalHouseClient {
    pub fn new(config: &SignalHouseConfig) -> Self {
        Self {
            http_client: Client::new(),
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            default_from: config.default_from.clone(),
        }
    }

    pub fn default_from(&self) -> Option<&str> {
        self.default_from.as_deref()
    }

    async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> Result<T, SignalHouseError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!("SignalHouse {method} {path}");

        let mut req = self
            .http_client
            .request(method, &url)
            .header("apiKey", &self.api_key)
            .header("x-client", "nextier-platform");
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = req
            .send()
            .await
            .map_err(|e| SignalHouseError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<ApiErrorBody>()
                .await
                .ok()
                .and_then(|b| b.message)
                .unwrap_or_else(|| status.to_string());
            error!("SignalHouse {path} failed: {status} {message}");
            return Err(SignalHouseError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<Payload<T>>()
            .await
            .map(Payload::into_inner)
            .map_err(|e| SignalHouseError::Parse(e.to_string()))
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, SignalHouseError> {
        self.request::<T, ()>(Method::GET, path, query, None).await
    }

    async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, SignalHouseError> {
        self.request(Method::POST, path, &[], Some(body)).await
    }

    pub async fn send_sms(
        &self,
        to: &str,
        from: Option<&str>,
        message: &str,
    ) -> Result<MessageResult, SignalHouseError> {
        let from = from
            .or(self.default_from.as_deref())
            .ok_or(SignalHouseError::MissingSender)?;
        let body = serde_json::json!({
            "to": to_e164(to),
            "from": to_e164(from),
            "message": message,
        });
        self.post("/message/sendSMS", &body).await
    }

    pub async fn list_campaigns(&self) -> Result<Vec<TenDlcCampaign>, SignalHouseError> {
        self.get("/campaign/details/basicCampaign", &[]).await
    }

    pub async fn create_campaign(
        &self,
        input: &CreateCampaignInput,
    ) -> Result<TenDlcCampaign, SignalHouseError> {
        self.post("/campaign/storeForReview", input).await
    }

    pub async fn list_sub_groups(&self) -> Result<Vec<SubGroup>, SignalHouseError> {
        self.get("/user/subGroup/get", &[]).await
    }

    pub async fn create_sub_group(
        &self,
        input: &CreateSubGroupInput,
    ) -> Result<SubGroup, SignalHouseError> {
        self.post("/user/subGroup/create", input).await
    }

    pub async fn list_templates(
        &self,
        name: Option<&str>,
    ) -> Result<Vec<MessageTemplate>, SignalHouseError> {
        match name {
            Some(name) => self.get("/message/findTemplate", &[("name", name)]).await,
            None => self.get("/message/findTemplate", &[]).await,
        }
    }

    pub async fn list_numbers(&self) -> Result<Vec<PhoneNumber>, SignalHouseError> {
        self.get("/phoneNumber/myPhoneNumbers", &[]).await
    }

    pub async fn list_webhooks(&self) -> Result<Vec<Webhook>, SignalHouseError> {
        self.get("/webhook", &[]).await
    }

    pub async fn create_webhook(&self, input: &WebhookInput) -> Result<Webhook, SignalHouseError> {
        self.post("/webhook", input).await
    }
}

#[async_trait]
impl SmsSender for SignalHouseClient {
    async fn send(&self, to: &str, from: Option<&str>, body: &str) -> Result<SendOutcome, ApiError> {
        let result = self.send_sms(to, from, body).await?;
        Ok(SendOutcome {
            provider_message_id: Some(result.message_id),
            status: if result.status.is_empty() {
                "sent".to_string()
            } else {
                result.status.to_lowercase()
            },
            from: from
                .or(self.default_from.as_deref())
                .map(normalize_phone)
                .unwrap_or_default(),
        })
    }
}

fn client(state: &AppState) -> Result<&SignalHouseClient, ApiError> {
    state
        .signalhouse
        .as_deref()
        .ok_or(ApiError::NotConfigured("SignalHouse"))
}

#[derive(Debug, Deserialize)]
pub struct TemplateQuery {
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConfigureWebhookRequest {
    /// Defaults to this server's inbound webhook.
    pub url: Option<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

pub async fn list_campaigns(
    State(state): State<Arc<AppState>>,
    _ctx: TeamContext,
) -> ApiResult<Vec<TenDlcCampaign>> {
    Ok(ApiResponse::ok(client(&state)?.list_campaigns().await?))
}

pub async fn create_campaign(
    State(state): State<Arc<AppState>>,
    _ctx: TeamContext,
    Json(input): Json<CreateCampaignInput>,
) -> ApiResult<TenDlcCampaign> {
    if input.brand_id.trim().is_empty() || input.usecase.trim().is_empty() {
        return Err(ApiError::bad_request("brandId and usecase are required"));
    }
    Ok(ApiResponse::created(
        client(&state)?.create_campaign(&input).await?,
    ))
}

pub async fn list_sub_groups(
    State(state): State<Arc<AppState>>,
    _ctx: TeamContext,
) -> ApiResult<Vec<SubGroup>> {
    Ok(ApiResponse::ok(client(&state)?.list_sub_groups().await?))
}

pub async fn create_sub_group(
    State(state): State<Arc<AppState>>,
    _ctx: TeamContext,
    Json(input): Json<CreateSubGroupInput>,
) -> ApiResult<SubGroup> {
    if input.name.trim().is_empty() {
        return Err(ApiError::bad_request("name is required"));
    }
    Ok(ApiResponse::created(
        client(&state)?.create_sub_group(&input).await?,
    ))
}

pub async fn list_templates(
    State(state): State<Arc<AppState>>,
    _ctx: TeamContext,
    Query(query): Query<TemplateQuery>,
) -> ApiResult<Vec<MessageTemplate>> {
    let templates = client(&state)?
        .list_templates(query.name.as_deref())
        .await?;
    Ok(ApiResponse::ok(templates))
}

pub async fn list_numbers(
    State(state): State<Arc<AppState>>,
    _ctx: TeamContext,
) -> ApiResult<Vec<PhoneNumber>> {
    Ok(ApiResponse::ok(client(&state)?.list_numbers().await?))
}

pub async fn list_webhooks(
    State(state): State<Arc<AppState>>,
    _ctx: TeamContext,
) -> ApiResult<Vec<Webhook>> {
    Ok(ApiResponse::ok(client(&state)?.list_webhooks().await?))
}

pub async fn configure_webhook(
    State(state): State<Arc<AppState>>,
    _ctx: TeamContext,
    Json(req): Json<ConfigureWebhookRequest>,
) -> ApiResult<Webhook> {
    let client = client(&state)?;
    let url = req.url.unwrap_or_else(|| {
        format!("{}/api/webhooks/sms/inbound", state.config.server.base_url)
    });
    let events = if req.events.is_empty() {
        vec!["message.received".to_string(), "message.status".to_string()]
    } else {
        req.events
    };

    let input = WebhookInput {
        name: "nextier-inbound".to_string(),
        url,
        events,
        description: None,
    };
    Ok(ApiResponse::created(client.create_webhook(&input).await?))
}

pub fn configure_signalhouse_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/api/signalhouse/campaigns",
            get(list_campaigns).post(create_campaign),
        )
        .route(
            "/api/signalhouse/subgroups",
            get(list_sub_groups).post(create_sub_group),
        )
        .route("/api/signalhouse/templates", get(list_templates))
        .route("/api/signalhouse/numbers", get(list_numbers))
        .route(
            "/api/signalhouse/webhooks",
            get(list_webhooks).post(configure_webhook),
        )
}
