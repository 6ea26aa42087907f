use hmac::{Hmac, Mac};
use log::{debug, error};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use uuid::Uuid;

use crate::core::config::StripeConfig;
use crate::core::shared::ApiError;

const STRIPE_API_URL: &str = "https://api.stripe.com/v1";

/// Seconds a signed webhook stays acceptable.
pub const WEBHOOK_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum StripeError {
    #[error("Stripe API error: {0}")]
    Api(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid webhook: {0}")]
    InvalidWebhook(String),
    #[error("parse error: {0}")]
    Parse(String),
}

impl From<StripeError> for ApiError {
    fn from(err: StripeError) -> Self {
        match err {
            StripeError::InvalidWebhook(_) => Self::BadRequest(err.to_string()),
            other => Self::Upstream(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeCustomer {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeSubscription {
    pub id: String,
    pub customer: String,
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    pub items: SubscriptionItems,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl StripeSubscription {
    pub fn price_id(&self) -> Option<&str> {
        self.items.data.first().map(|item| item.price.id.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionItems {
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionItem {
    pub id: String,
    pub price: StripePrice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripePrice {
    pub id: String,
    pub unit_amount: Option<i64>,
    #[serde(default)]
    pub currency: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Canceled,
    Incomplete,
    IncompleteExpired,
    PastDue,
    Paused,
    Trialing,
    Unpaid,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Canceled => "canceled",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::PastDue => "past_due",
            Self::Paused => "paused",
            Self::Trialing => "trialing",
            Self::Unpaid => "unpaid",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeInvoice {
    pub id: String,
    pub customer: String,
    pub subscription: Option<String>,
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default)]
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub id: String,
    pub customer: Option<String>,
    #[serde(rename = "type")]
    pub method_type: String,
    pub card: Option<Card>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub brand: String,
    pub last4: String,
    pub exp_month: u32,
    pub exp_year: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
    pub customer: Option<String>,
    pub subscription: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CheckoutParams {
    pub customer_id: String,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
    pub team_id: Uuid,
    pub plan_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookData,
    #[serde(default)]
    pub created: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookData {
    pub object: serde_json::Value,
}

#[derive(Debug, Clone)]
pub enum WebhookKind {
    CheckoutCompleted(CheckoutSession),
    SubscriptionChanged(StripeSubscription),
    SubscriptionDeleted(StripeSubscription),
    InvoicePaid(StripeInvoice),
    InvoicePaymentFailed(StripeInvoice),
    Ignored(String),
}

#[derive(Deserialize)]
struct List<T> {
    data: Vec<T>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

type Form = Vec<(String, String)>;

fn field(key: &str, value: impl Into<String>) -> (String, String) {
    (key.to_string(), value.into())
}

#[derive(Debug, Clone)]
pub struct StripeClient {
    api_key: String,
    webhook_secret: Option<String>,
    client: reqwest::Client,
    base_url: String,
}

impl StripeClient {
    pub fn new(config: &StripeConfig) -> Self {
        Self::with_base_url(config, STRIPE_API_URL)
    }

    pub fn with_base_url(config: &StripeConfig, base_url: &str) -> Self {
        Self {
            api_key: config.secret_key.clone(),
            webhook_secret: config.webhook_secret.clone(),
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn webhook_secret(&self) -> Option<&str> {
        self.webhook_secret.as_deref()
    }

    pub async fn create_customer(
        &self,
        email: Option<&str>,
        name: Option<&str>,
        team_id: Uuid,
    ) -> Result<StripeCustomer, StripeError> {
        let mut form: Form = vec![field("metadata[team_id]", team_id.to_string())];
        if let Some(email) = email {
            form.push(field("email", email));
        }
        if let Some(name) = name {
            form.push(field("name", name));
        }

        let request = self.client.post(format!("{}/customers", self.base_url)).form(&form);
        self.send(request).await
    }

    pub async fn get_customer(&self, customer_id: &str) -> Result<StripeCustomer, StripeError> {
        let request = self
            .client
            .get(format!("{}/customers/{}", self.base_url, customer_id));
        self.send(request).await
    }

    pub async fn create_checkout_session(
        &self,
        params: CheckoutParams,
    ) -> Result<CheckoutSession, StripeError> {
        let team_id = params.team_id.to_string();
        let form: Form = vec![
            field("customer", params.customer_id),
            field("mode", "subscription"),
            field("success_url", params.success_url),
            field("cancel_url", params.cancel_url),
            field("line_items[0][price]", params.price_id),
            field("line_items[0][quantity]", "1"),
            field("metadata[team_id]", team_id.clone()),
            field("metadata[plan_id]", params.plan_id.clone()),
            field("subscription_data[metadata][team_id]", team_id),
            field("subscription_data[metadata][plan_id]", params.plan_id),
        ];

        let request = self
            .client
            .post(format!("{}/checkout/sessions", self.base_url))
            .form(&form);
        self.send(request).await
    }

    pub async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<StripeSubscription, StripeError> {
        let request = self
            .client
            .get(format!("{}/subscriptions/{}", self.base_url, subscription_id));
        self.send(request).await
    }

    /// Swaps the price on the first subscription item, prorating the change.
    pub async fn update_subscription(
        &self,
        subscription_id: &str,
        new_price_id: &str,
        plan_id: &str,
    ) -> Result<StripeSubscription, StripeError> {
        let subscription = self.get_subscription(subscription_id).await?;
        let item_id = subscription
            .items
            .data
            .first()
            .map(|item| item.id.clone())
            .ok_or_else(|| StripeError::Api("subscription has no items".to_string()))?;

        let form: Form = vec![
            field("items[0][id]", item_id),
            field("items[0][price]", new_price_id),
            field("proration_behavior", "create_prorations"),
            field("metadata[plan_id]", plan_id),
        ];

        let request = self
            .client
            .post(format!("{}/subscriptions/{}", self.base_url, subscription_id))
            .form(&form);
        self.send(request).await
    }

    pub async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
    ) -> Result<StripeSubscription, StripeError> {
        let url = format!("{}/subscriptions/{}", self.base_url, subscription_id);
        let request = if at_period_end {
            self.client
                .post(&url)
                .form(&[("cancel_at_period_end", "true")])
        } else {
            self.client.delete(&url)
        };
        self.send(request).await
    }

    pub async fn list_payment_methods(
        &self,
        customer_id: &str,
    ) -> Result<Vec<PaymentMethod>, StripeError> {
        let request = self
            .client
            .get(format!("{}/payment_methods", self.base_url))
            .query(&[("customer", customer_id), ("type", "card")]);
        let list: List<PaymentMethod> = self.send(request).await?;
        Ok(list.data)
    }

    pub async fn detach_payment_method(
        &self,
        payment_method_id: &str,
    ) -> Result<PaymentMethod, StripeError> {
        let request = self.client.post(format!(
            "{}/payment_methods/{}/detach",
            self.base_url, payment_method_id
        ));
        self.send(request).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, StripeError> {
        let response = request
            .basic_auth(&self.api_key, Option::<&str>::None)
            .send()
            .await
            .map_err(|e| StripeError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StripeError::Network(e.to_string()))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("HTTP {status}: {body}"));
            error!("Stripe request failed: {message}");
            return Err(StripeError::Api(message));
        }

        serde_json::from_str(&body).map_err(|e| StripeError::Parse(e.to_string()))
    }
}

/// Checks a `Stripe-Signature` header (`t=<ts>,v1=<hex>[,v1=...]`) against
/// the raw payload and returns the parsed event.
pub fn verify_webhook(
    secret: &str,
    payload: &str,
    header: &str,
    now: i64,
) -> Result<WebhookEvent, StripeError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = Some(v),
            Some(("v1", v)) => signatures.push(v),
            _ => {}
        }
    }

    let timestamp =
        timestamp.ok_or_else(|| StripeError::InvalidWebhook("missing timestamp".to_string()))?;
    if signatures.is_empty() {
        return Err(StripeError::InvalidWebhook("missing signature".to_string()));
    }

    let signed_payload = format!("{timestamp}.{payload}");
    let matched = signatures.iter().any(|sig| {
        let Ok(expected) = hex::decode(sig) else {
            return false;
        };
        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(signed_payload.as_bytes());
        mac.verify_slice(&expected).is_ok()
    });
    if !matched {
        return Err(StripeError::InvalidWebhook("signature mismatch".to_string()));
    }

    let ts: i64 = timestamp
        .parse()
        .map_err(|_| StripeError::InvalidWebhook("invalid timestamp".to_string()))?;
    if (now - ts).abs() > WEBHOOK_TOLERANCE_SECS {
        return Err(StripeError::InvalidWebhook("timestamp outside tolerance".to_string()));
    }

    serde_json::from_str(payload).map_err(|e| StripeError::Parse(e.to_string()))
}

pub fn classify_event(event: &WebhookEvent) -> Result<WebhookKind, StripeError> {
    fn object<T: DeserializeOwned>(event: &WebhookEvent) -> Result<T, StripeError> {
        serde_json::from_value(event.data.object.clone())
            .map_err(|e| StripeError::Parse(e.to_string()))
    }

    Ok(match event.event_type.as_str() {
        "checkout.session.completed" => WebhookKind::CheckoutCompleted(object(event)?),
        "customer.subscription.created" | "customer.subscription.updated" => {
            WebhookKind::SubscriptionChanged(object(event)?)
        }
        "customer.subscription.deleted" => WebhookKind::SubscriptionDeleted(object(event)?),
        "invoice.paid" => WebhookKind::InvoicePaid(object(event)?),
        "invoice.payment_failed" => WebhookKind::InvoicePaymentFailed(object(event)?),
        other => {
            debug!("Unhandled Stripe webhook event: {other}");
            WebhookKind::Ignored(other.to_string())
        }
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn sign(secret: &str, payload: &str, timestamp: i64) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.{payload}").as_bytes());
        format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    pub fn config() -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test_123".to_string(),
            webhook_secret: Some("whsec_test".to_string()),
            prices: [
                ("starter".to_string(), "price_starter".to_string()),
                ("pro".to_string(), "price_pro".to_string()),
            ]
            .into_iter()
            .collect(),
            success_url: "https://app.test/billing/success".to_string(),
            cancel_url: "https://app.test/billing".to_string(),
        }
    }
}
