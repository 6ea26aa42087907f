//! Text generation for chat and SMS copy. OpenAI is preferred when both
//! providers have keys; without either, SMS copy falls back to the local
//! remixer.

pub mod anthropic;
pub mod openai;

use async_trait::async_trait;
use axum::{extract::State, routing::post, Json, Router};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::core::config::LlmConfig;
use crate::core::shared::{ApiError, ApiResponse, ApiResult, AppState};
use crate::core::tenant::TeamContext;
use crate::leads::find_lead;
use crate::sms::remix::{self, compress, RemixSettings, Tier, SMS_BUDGET};
use crate::sms::templates::{self, lead_vars, render, segments, SegmentInfo};
use anthropic::AnthropicClient;
use openai::OpenAiClient;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("network error: {0}")]
    Network(String),
    #[error("{provider} error {status}: {message}")]
    Api {
        provider: &'static str,
        status: u16,
        message: String,
    },
    #[error("{0} returned no text")]
    Empty(&'static str),
    #[error("parse error: {0}")]
    Parse(String),
}

impl From<LlmError> for ApiError {
    fn from(err: LlmError) -> Self {
        Self::Upstream(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            system: None,
            messages: Vec::new(),
            max_tokens: 512,
            temperature: 0.7,
        }
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError>;
}

pub fn generator_from_config(config: &LlmConfig) -> Option<Arc<dyn TextGenerator>> {
    if let Some(key) = &config.openai_key {
        return Some(Arc::new(OpenAiClient::new(
            key.clone(),
            config.openai_model.clone(),
            config.openai_url.clone(),
        )));
    }
    config.anthropic_key.as_ref().map(|key| {
        Arc::new(AnthropicClient::new(key.clone(), config.anthropic_model.clone()))
            as Arc<dyn TextGenerator>
    })
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

pub(crate) async fn read_body(
    provider: &'static str,
    response: reqwest::Response,
) -> Result<Value, LlmError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| LlmError::Network(e.to_string()))?;
    if !status.is_success() {
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.error.message)
            .unwrap_or_else(|_| status.to_string());
        return Err(LlmError::Api {
            provider,
            status: status.as_u16(),
            message,
        });
    }
    serde_json::from_str(&body).map_err(|e| LlmError::Parse(e.to_string()))
}

fn tone_words(settings: &RemixSettings) -> String {
    let level = |v: u8, low: &str, mid: &str, high: &str| match remix::tier(v) {
        Tier::Low => low.to_string(),
        Tier::Medium | Tier::High => mid.to_string(),
        Tier::Max => high.to_string(),
    };
    [
        level(settings.humor, "serious", "lightly warm", "playful"),
        level(settings.directness, "soft", "clear", "blunt"),
        level(settings.authority, "humble", "confident", "expert"),
        level(settings.urgency, "relaxed", "timely", "urgent"),
    ]
    .join(", ")
}

fn sms_system_prompt(settings: &RemixSettings) -> String {
    format!(
        "You write one outbound business SMS. Tone: {}. Stay under {SMS_BUDGET} characters, \
         no emojis, no links, no hashtags. Reply with the message text only.",
        tone_words(settings)
    )
}

/// Keeps AI output inside the SMS budget and strips wrapping quotes.
pub fn finish_sms(raw: &str) -> String {
    let text = raw.trim().trim_matches(|c| c == '"' || c == '\u{201c}' || c == '\u{201d}');
    compress(text, SMS_BUDGET)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CopySource {
    Ai,
    Local,
}

#[derive(Debug, Serialize)]
pub struct SmsCopy {
    pub message: String,
    pub characters: usize,
    pub segments: SegmentInfo,
    pub source: CopySource,
}

impl SmsCopy {
    fn new(message: String, source: CopySource) -> Self {
        Self {
            characters: message.chars().count(),
            segments: segments(&message),
            message,
            source,
        }
    }
}

/// Asks the generator for SMS copy. Any provider failure falls back to the
/// local remix of `fallback`.
async fn sms_copy(
    generator: Option<&dyn TextGenerator>,
    request: GenerationRequest,
    fallback: &str,
    settings: &RemixSettings,
) -> SmsCopy {
    if let Some(generator) = generator {
        match generator.generate(&request).await {
            Ok(text) => {
                let message = finish_sms(&text);
                if !message.is_empty() {
                    return SmsCopy::new(message, CopySource::Ai);
                }
            }
            Err(e) => warn!("{} rewrite failed, using local remix: {e}", generator.name()),
        }
    }
    let message = remix::remix(fallback, settings, &mut rand::thread_rng());
    SmsCopy::new(message, CopySource::Local)
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub system: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub reply: String,
    pub provider: &'static str,
}

pub async fn chat(
    State(state): State<Arc<AppState>>,
    _ctx: TeamContext,
    Json(req): Json<ChatRequest>,
) -> ApiResult<ChatResponse> {
    let generator = state.llm.as_deref().ok_or(ApiError::NotConfigured("LLM"))?;
    if req.messages.is_empty() {
        return Err(ApiError::bad_request("messages must not be empty"));
    }
    if req.messages.last().map(|m| m.role) != Some(Role::User) {
        return Err(ApiError::bad_request("the last message must come from the user"));
    }

    let reply = generator
        .generate(&GenerationRequest {
            system: req.system,
            messages: req.messages,
            max_tokens: req.max_tokens.unwrap_or(512).clamp(1, 4096),
            temperature: req.temperature.unwrap_or(0.7).clamp(0.0, 2.0),
        })
        .await?;
    Ok(ApiResponse::ok(ChatResponse {
        reply,
        provider: generator.name(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct RemixRequest {
    pub message: String,
    #[serde(default)]
    pub settings: RemixSettings,
}

pub async fn remix_sms(
    State(state): State<Arc<AppState>>,
    _ctx: TeamContext,
    Json(req): Json<RemixRequest>,
) -> ApiResult<SmsCopy> {
    let message = req.message.trim();
    if message.is_empty() {
        return Err(ApiError::bad_request("message is required"));
    }
    let settings = req.settings.clamped();
    let request = GenerationRequest {
        system: Some(sms_system_prompt(&settings)),
        messages: vec![ChatMessage::user(format!("Rewrite this SMS:\n{message}"))],
        max_tokens: 200,
        ..Default::default()
    };
    debug!("Remixing {} characters", message.chars().count());
    Ok(ApiResponse::ok(
        sms_copy(state.llm.as_deref(), request, message, &settings).await,
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct GenerateRequest {
    pub lead_id: Option<Uuid>,
    /// Template vars when there is no stored lead.
    #[serde(default)]
    pub vars: HashMap<String, String>,
    pub template_id: Option<String>,
    pub goal: Option<String>,
    #[serde(default)]
    pub settings: RemixSettings,
}

const DEFAULT_OPENER: &str = "opener_direct";

pub async fn generate_message(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Json(req): Json<GenerateRequest>,
) -> ApiResult<SmsCopy> {
    let mut vars = req.vars;
    if let Some(lead_id) = req.lead_id {
        let mut conn = state.conn.get()?;
        let lead = find_lead(&mut conn, ctx.team_id, lead_id)?;
        vars.extend(lead_vars(&lead));
    }

    let template_id = req.template_id.as_deref().unwrap_or(DEFAULT_OPENER);
    let template = templates::template(template_id)
        .ok_or_else(|| ApiError::bad_request(format!("unknown template {template_id}")))?;
    let fallback = render(template.body, &vars);

    let settings = req.settings.clamped();
    let mut facts: Vec<String> = vars
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| format!("{k}: {v}"))
        .collect();
    facts.sort();
    let goal = req
        .goal
        .unwrap_or_else(|| "open a conversation about selling or growing their business".to_string());
    let request = GenerationRequest {
        system: Some(sms_system_prompt(&settings)),
        messages: vec![ChatMessage::user(format!(
            "Write a first-touch SMS to this business owner. Goal: {goal}.\n{}\nExample:\n{fallback}",
            facts.join("\n")
        ))],
        max_tokens: 200,
        ..Default::default()
    };

    Ok(ApiResponse::ok(
        sms_copy(state.llm.as_deref(), request, &fallback, &settings).await,
    ))
}

pub fn configure_llm_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/ai/chat", post(chat))
        .route("/api/ai/sms/remix", post(remix_sms))
        .route("/api/ai/messages/generate", post(generate_message))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Answers every request with the same text, or fails when `reply` is
    /// `None`.
    pub struct FixedGenerator {
        pub reply: Option<String>,
    }

    #[async_trait]
    impl TextGenerator for FixedGenerator {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn generate(&self, _request: &GenerationRequest) -> Result<String, LlmError> {
            self.reply.clone().ok_or(LlmError::Empty("fixed"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FixedGenerator;
    use super::*;

    fn request() -> GenerationRequest {
        GenerationRequest {
            messages: vec![ChatMessage::user("Rewrite")],
            ..Default::default()
        }
    }

    #[test]
    fn prefers_openai_when_both_are_configured() {
        let config = LlmConfig {
            openai_key: Some("sk".into()),
            anthropic_key: Some("ak".into()),
            ..Default::default()
        };
        assert_eq!(generator_from_config(&config).unwrap().name(), "openai");

        let config = LlmConfig {
            anthropic_key: Some("ak".into()),
            ..Default::default()
        };
        assert_eq!(generator_from_config(&config).unwrap().name(), "anthropic");
        assert!(generator_from_config(&LlmConfig::default()).is_none());
    }

    #[test]
    fn ai_output_is_unquoted_and_budgeted() {
        let long = format!("\"{}\"", "Quick question about your shop. ".repeat(10));
        let out = finish_sms(&long);
        assert!(out.chars().count() <= SMS_BUDGET);
        assert!(!out.starts_with('"'));
    }

    #[test]
    fn tone_follows_the_dials() {
        let blunt = RemixSettings {
            directness: 95,
            ..Default::default()
        };
        assert!(tone_words(&blunt).contains("blunt"));
        assert!(sms_system_prompt(&blunt).contains("160"));
    }

    #[tokio::test]
    async fn uses_ai_copy_when_available() {
        let generator = FixedGenerator {
            reply: Some("Maria, open to a quick chat about Ruiz Roofing?".into()),
        };
        let copy = sms_copy(Some(&generator as &dyn TextGenerator), request(), "fallback text", &RemixSettings::default()).await;
        assert_eq!(copy.source, CopySource::Ai);
        assert_eq!(copy.message, "Maria, open to a quick chat about Ruiz Roofing?");
    }

    #[tokio::test]
    async fn falls_back_to_local_remix() {
        let failing = FixedGenerator { reply: None };
        let copy = sms_copy(
            Some(&failing as &dyn TextGenerator),
            request(),
            "Maria, would you consider an offer for Ruiz Roofing?",
            &RemixSettings::default(),
        )
        .await;
        assert_eq!(copy.source, CopySource::Local);
        assert!(copy.characters <= SMS_BUDGET);

        let none = sms_copy(None, request(), "Hello there Maria.", &RemixSettings::default()).await;
        assert_eq!(none.source, CopySource::Local);
    }
}
