//! Subscription billing on Stripe: the plan catalogue, checkout, plan
//! changes, cancellation, payment methods, and the webhook that keeps the
//! `subscriptions` table in step with Stripe.

pub mod stripe;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::core::config::StripeConfig;
use crate::core::shared::schema::subscriptions;
use crate::core::shared::{ApiError, ApiResponse, ApiResult, AppState};
use crate::core::tenant::TeamContext;
use stripe::{
    classify_event, verify_webhook, CheckoutParams, PaymentMethod, StripeClient,
    StripeSubscription, WebhookKind,
};

pub const DEFAULT_PLAN: &str = "starter";
const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PlanLimits {
    pub leads: u32,
    pub sms_per_month: u32,
    pub skip_traces: u32,
    pub users: u32,
    pub power_dialer: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub id: &'static str,
    pub name: &'static str,
    pub price_monthly_cents: i64,
    pub limits: PlanLimits,
    /// Stripe price, when one is configured for this plan.
    pub price_id: Option<String>,
}

const PLANS: [(&str, &str, i64, PlanLimits); 3] = [
    (
        "starter",
        "Starter",
        9_900,
        PlanLimits {
            leads: 5_000,
            sms_per_month: 1_000,
            skip_traces: 100,
            users: 3,
            power_dialer: true,
        },
    ),
    (
        "pro",
        "Pro",
        29_900,
        PlanLimits {
            leads: 25_000,
            sms_per_month: 10_000,
            skip_traces: 1_000,
            users: 10,
            power_dialer: true,
        },
    ),
    (
        "agency",
        "Agency",
        59_900,
        PlanLimits {
            leads: 100_000,
            sms_per_month: 50_000,
            skip_traces: 5_000,
            users: 50,
            power_dialer: true,
        },
    ),
];

/// Plans in ascending price order, joined with the configured Stripe prices.
pub fn plan_catalogue(config: Option<&StripeConfig>) -> Vec<Plan> {
    PLANS
        .iter()
        .map(|(id, name, cents, limits)| Plan {
            id: *id,
            name: *name,
            price_monthly_cents: *cents,
            limits: limits.clone(),
            price_id: config.and_then(|c| c.prices.get(*id).cloned()),
        })
        .collect()
}

pub fn plan_for_price(prices: &HashMap<String, String>, price_id: &str) -> Option<String> {
    prices
        .iter()
        .find(|(_, p)| p.as_str() == price_id)
        .map(|(plan, _)| plan.clone())
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = subscriptions)]
pub struct Subscription {
    pub id: Uuid,
    pub team_id: Uuid,
    pub plan_id: String,
    pub status: String,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields a Stripe event or API response reports about a subscription.
/// `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionChange {
    pub team_id: Option<Uuid>,
    pub plan_id: Option<String>,
    pub status: Option<String>,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub period_end: Option<DateTime<Utc>>,
}

impl SubscriptionChange {
    pub fn from_subscription(sub: &StripeSubscription, prices: &HashMap<String, String>) -> Self {
        Self {
            team_id: sub.metadata.get("team_id").and_then(|t| t.parse().ok()),
            plan_id: sub
                .price_id()
                .and_then(|p| plan_for_price(prices, p))
                .or_else(|| sub.metadata.get("plan_id").cloned()),
            status: Some(sub.status.as_str().to_string()),
            customer_id: Some(sub.customer.clone()),
            subscription_id: Some(sub.id.clone()),
            period_end: sub
                .current_period_end
                .and_then(|ts| DateTime::from_timestamp(ts, 0)),
        }
    }

    /// What a webhook event means for the subscription row, if anything.
    pub fn from_webhook(kind: &WebhookKind, prices: &HashMap<String, String>) -> Option<Self> {
        match kind {
            WebhookKind::CheckoutCompleted(session) => Some(Self {
                team_id: session.metadata.get("team_id").and_then(|t| t.parse().ok()),
                plan_id: session.metadata.get("plan_id").cloned(),
                status: Some("active".to_string()),
                customer_id: session.customer.clone(),
                subscription_id: session.subscription.clone(),
                period_end: None,
            }),
            WebhookKind::SubscriptionChanged(sub) => Some(Self::from_subscription(sub, prices)),
            WebhookKind::SubscriptionDeleted(sub) => Some(Self {
                status: Some("canceled".to_string()),
                ..Self::from_subscription(sub, prices)
            }),
            WebhookKind::InvoicePaymentFailed(invoice) => Some(Self {
                status: Some("past_due".to_string()),
                customer_id: Some(invoice.customer.clone()),
                subscription_id: invoice.subscription.clone(),
                ..Default::default()
            }),
            WebhookKind::InvoicePaid(_) | WebhookKind::Ignored(_) => None,
        }
    }

    /// Folds the change over the stored row. Later writes win field by field.
    pub fn merge(self, existing: Option<Subscription>, team_id: Uuid, now: DateTime<Utc>) -> Subscription {
        let base = existing.unwrap_or_else(|| Subscription {
            id: Uuid::new_v4(),
            team_id,
            plan_id: DEFAULT_PLAN.to_string(),
            status: "incomplete".to_string(),
            stripe_customer_id: None,
            stripe_subscription_id: None,
            current_period_end: None,
            created_at: now,
            updated_at: now,
        });
        Subscription {
            plan_id: self.plan_id.unwrap_or(base.plan_id),
            status: self.status.unwrap_or(base.status),
            stripe_customer_id: self.customer_id.or(base.stripe_customer_id),
            stripe_subscription_id: self.subscription_id.or(base.stripe_subscription_id),
            current_period_end: self.period_end.or(base.current_period_end),
            updated_at: now,
            ..base
        }
    }
}

pub fn find_subscription(conn: &mut PgConnection, team_id: Uuid) -> Result<Option<Subscription>, ApiError> {
    Ok(subscriptions::table
        .filter(subscriptions::team_id.eq(team_id))
        .select(Subscription::as_select())
        .first(conn)
        .optional()?)
}

fn save_subscription(conn: &mut PgConnection, row: &Subscription) -> Result<Subscription, ApiError> {
    Ok(diesel::insert_into(subscriptions::table)
        .values(row)
        .on_conflict(subscriptions::team_id)
        .do_update()
        .set((
            subscriptions::plan_id.eq(&row.plan_id),
            subscriptions::status.eq(&row.status),
            subscriptions::stripe_customer_id.eq(&row.stripe_customer_id),
            subscriptions::stripe_subscription_id.eq(&row.stripe_subscription_id),
            subscriptions::current_period_end.eq(row.current_period_end),
            subscriptions::updated_at.eq(row.updated_at),
        ))
        .returning(Subscription::as_returning())
        .get_result(conn)?)
}

/// Applies a change to the owning team's row. Events that name no team are
/// matched on the Stripe subscription id, then on the customer id.
pub fn apply_change(
    conn: &mut PgConnection,
    change: SubscriptionChange,
) -> Result<Option<Subscription>, ApiError> {
    let existing = match change.team_id {
        Some(team_id) => find_subscription(conn, team_id)?,
        None => {
            let by_sub = match &change.subscription_id {
                Some(sub_id) => subscriptions::table
                    .filter(subscriptions::stripe_subscription_id.eq(sub_id))
                    .select(Subscription::as_select())
                    .first(conn)
                    .optional()?,
                None => None,
            };
            match (by_sub, &change.customer_id) {
                (Some(row), _) => Some(row),
                (None, Some(customer)) => subscriptions::table
                    .filter(subscriptions::stripe_customer_id.eq(customer))
                    .select(Subscription::as_select())
                    .first(conn)
                    .optional()?,
                (None, None) => None,
            }
        }
    };

    let Some(team_id) = change.team_id.or(existing.as_ref().map(|s| s.team_id)) else {
        warn!(
            "Stripe change for unknown subscription {:?} / customer {:?}",
            change.subscription_id, change.customer_id
        );
        return Ok(None);
    };

    let row = change.merge(existing, team_id, Utc::now());
    save_subscription(conn, &row).map(Some)
}

fn stripe_client(state: &AppState) -> Result<&StripeClient, ApiError> {
    state
        .stripe
        .as_deref()
        .ok_or(ApiError::NotConfigured("Stripe"))
}

fn prices(state: &AppState) -> HashMap<String, String> {
    state
        .config
        .stripe
        .as_ref()
        .map(|c| c.prices.clone())
        .unwrap_or_default()
}

fn price_for(state: &AppState, plan_id: &str) -> Result<String, ApiError> {
    if !PLANS.iter().any(|(id, ..)| *id == plan_id) {
        return Err(ApiError::bad_request(format!("unknown plan {plan_id}")));
    }
    prices(state)
        .get(plan_id)
        .cloned()
        .ok_or_else(|| ApiError::bad_request(format!("plan {plan_id} has no Stripe price")))
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub plan_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub success_url: Option<String>,
    pub cancel_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: Option<String>,
    pub customer_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangePlanRequest {
    pub plan_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    #[serde(default = "at_period_end")]
    pub at_period_end: bool,
}

fn at_period_end() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct WebhookReceipt {
    pub received: bool,
    pub event_type: String,
    pub applied: bool,
}

pub async fn list_plans(State(state): State<Arc<AppState>>) -> ApiResponse<Vec<Plan>> {
    ApiResponse::ok(plan_catalogue(state.config.stripe.as_ref()))
}

pub async fn current_subscription(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
) -> ApiResult<Option<Subscription>> {
    let mut conn = state.conn.get()?;
    Ok(ApiResponse::ok(find_subscription(&mut conn, ctx.team_id)?))
}

pub async fn create_checkout(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<CheckoutResponse> {
    let client = stripe_client(&state)?;
    let price_id = price_for(&state, &req.plan_id)?;
    let config = state
        .config
        .stripe
        .as_ref()
        .ok_or(ApiError::NotConfigured("Stripe"))?;

    let existing = {
        let mut conn = state.conn.get()?;
        find_subscription(&mut conn, ctx.team_id)?
    };
    let customer_id = match existing.as_ref().and_then(|s| s.stripe_customer_id.clone()) {
        Some(id) => id,
        None => {
            let customer = client
                .create_customer(req.email.as_deref(), req.name.as_deref(), ctx.team_id)
                .await?;
            info!("Created Stripe customer {} for team {}", customer.id, ctx.team_id);
            customer.id
        }
    };

    {
        let mut conn = state.conn.get()?;
        let change = SubscriptionChange {
            customer_id: Some(customer_id.clone()),
            plan_id: existing.is_none().then(|| req.plan_id.clone()),
            ..Default::default()
        };
        save_subscription(&mut conn, &change.merge(existing, ctx.team_id, Utc::now()))?;
    }

    let session = client
        .create_checkout_session(CheckoutParams {
            customer_id: customer_id.clone(),
            price_id,
            success_url: req.success_url.unwrap_or_else(|| config.success_url.clone()),
            cancel_url: req.cancel_url.unwrap_or_else(|| config.cancel_url.clone()),
            team_id: ctx.team_id,
            plan_id: req.plan_id,
        })
        .await?;

    Ok(ApiResponse::ok(CheckoutResponse {
        session_id: session.id,
        url: session.url,
        customer_id,
    }))
}

fn active_stripe_subscription(state: &AppState, team_id: Uuid) -> Result<String, ApiError> {
    let mut conn = state.conn.get()?;
    find_subscription(&mut conn, team_id)?
        .and_then(|s| s.stripe_subscription_id)
        .ok_or_else(|| ApiError::bad_request("team has no Stripe subscription"))
}

pub async fn change_plan(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Json(req): Json<ChangePlanRequest>,
) -> ApiResult<Subscription> {
    let client = stripe_client(&state)?;
    let price_id = price_for(&state, &req.plan_id)?;
    let sub_id = active_stripe_subscription(&state, ctx.team_id)?;

    let updated = client.update_subscription(&sub_id, &price_id, &req.plan_id).await?;
    let change = SubscriptionChange {
        team_id: Some(ctx.team_id),
        plan_id: Some(req.plan_id.clone()),
        ..SubscriptionChange::from_subscription(&updated, &prices(&state))
    };

    let mut conn = state.conn.get()?;
    let row = apply_change(&mut conn, change)?.ok_or_else(|| ApiError::not_found("subscription"))?;
    info!("Team {} moved to plan {}", ctx.team_id, req.plan_id);
    Ok(ApiResponse::ok(row))
}

pub async fn cancel_subscription(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Json(req): Json<CancelRequest>,
) -> ApiResult<Subscription> {
    let client = stripe_client(&state)?;
    let sub_id = active_stripe_subscription(&state, ctx.team_id)?;

    let canceled = client.cancel_subscription(&sub_id, req.at_period_end).await?;
    let change = SubscriptionChange {
        team_id: Some(ctx.team_id),
        ..SubscriptionChange::from_subscription(&canceled, &prices(&state))
    };

    let mut conn = state.conn.get()?;
    let row = apply_change(&mut conn, change)?.ok_or_else(|| ApiError::not_found("subscription"))?;
    info!(
        "Canceled subscription {sub_id} for team {} (at period end: {})",
        ctx.team_id, req.at_period_end
    );
    Ok(ApiResponse::ok(row))
}

fn team_customer(state: &AppState, team_id: Uuid) -> Result<Option<String>, ApiError> {
    let mut conn = state.conn.get()?;
    Ok(find_subscription(&mut conn, team_id)?.and_then(|s| s.stripe_customer_id))
}

pub async fn list_payment_methods(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
) -> ApiResult<Vec<PaymentMethod>> {
    let client = stripe_client(&state)?;
    let Some(customer) = team_customer(&state, ctx.team_id)? else {
        return Ok(ApiResponse::ok(Vec::new()));
    };
    Ok(ApiResponse::ok(client.list_payment_methods(&customer).await?))
}

pub async fn detach_payment_method(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(id): Path<String>,
) -> ApiResult<PaymentMethod> {
    let client = stripe_client(&state)?;
    let customer = team_customer(&state, ctx.team_id)?
        .ok_or_else(|| ApiError::not_found("payment method"))?;

    // Only the team's own cards may be detached.
    let owned = client.list_payment_methods(&customer).await?;
    if !owned.iter().any(|m| m.id == id) {
        return Err(ApiError::not_found("payment method"));
    }
    Ok(ApiResponse::ok(client.detach_payment_method(&id).await?))
}

pub async fn stripe_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<WebhookReceipt> {
    let secret = state
        .stripe
        .as_deref()
        .and_then(StripeClient::webhook_secret)
        .ok_or(ApiError::NotConfigured("Stripe webhooks"))?;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::bad_request("missing Stripe-Signature header"))?;

    let event = verify_webhook(secret, &body, signature, Utc::now().timestamp())?;
    let kind = classify_event(&event)?;
    if let WebhookKind::InvoicePaid(invoice) = &kind {
        info!(
            "Invoice {} paid: {} {}",
            invoice.id, invoice.amount_paid, invoice.currency
        );
    }

    let applied = match SubscriptionChange::from_webhook(&kind, &prices(&state)) {
        Some(change) => {
            let mut conn = state.conn.get()?;
            apply_change(&mut conn, change)?.is_some()
        }
        None => false,
    };

    Ok(ApiResponse::ok(WebhookReceipt {
        received: true,
        event_type: event.event_type,
        applied,
    }))
}

pub fn configure_billing_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/billing/plans", get(list_plans))
        .route("/api/billing/subscription", get(current_subscription))
        .route("/api/billing/checkout", post(create_checkout))
        .route("/api/billing/subscription/change", post(change_plan))
        .route("/api/billing/subscription/cancel", post(cancel_subscription))
        .route("/api/billing/payment-methods", get(list_payment_methods))
        .route("/api/billing/payment-methods/:id", delete(detach_payment_method))
        .route("/api/webhooks/stripe", post(stripe_webhook))
}

#[cfg(test)]
mod tests {
    use super::stripe::testing::config;
    use super::stripe::{
        CheckoutSession, StripeInvoice, StripePrice, SubscriptionItem, SubscriptionItems,
        SubscriptionStatus,
    };
    use super::*;

    fn subscription(status: SubscriptionStatus, price: &str) -> StripeSubscription {
        StripeSubscription {
            id: "sub_1".into(),
            customer: "cus_1".into(),
            status,
            current_period_end: Some(1_767_225_600),
            cancel_at_period_end: false,
            items: SubscriptionItems {
                data: vec![SubscriptionItem {
                    id: "si_1".into(),
                    price: StripePrice {
                        id: price.into(),
                        unit_amount: Some(29_900),
                        currency: "usd".into(),
                    },
                }],
            },
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn catalogue_joins_configured_prices() {
        let plans = plan_catalogue(Some(&config()));
        assert_eq!(plans.iter().map(|p| p.id).collect::<Vec<_>>(), ["starter", "pro", "agency"]);
        assert_eq!(plans[1].price_id.as_deref(), Some("price_pro"));
        assert_eq!(plans[2].price_id, None);
        assert!(plan_catalogue(None).iter().all(|p| p.price_id.is_none()));
    }

    #[test]
    fn subscription_events_map_price_back_to_plan() {
        let prices = config().prices;
        let kind = WebhookKind::SubscriptionChanged(subscription(SubscriptionStatus::PastDue, "price_pro"));
        let change = SubscriptionChange::from_webhook(&kind, &prices).unwrap();
        assert_eq!(change.plan_id.as_deref(), Some("pro"));
        assert_eq!(change.status.as_deref(), Some("past_due"));
        assert_eq!(change.period_end.unwrap().timestamp(), 1_767_225_600);

        let deleted = WebhookKind::SubscriptionDeleted(subscription(SubscriptionStatus::Active, "price_pro"));
        let change = SubscriptionChange::from_webhook(&deleted, &prices).unwrap();
        assert_eq!(change.status.as_deref(), Some("canceled"));
    }

    #[test]
    fn checkout_completion_carries_team_metadata() {
        let team = Uuid::new_v4();
        let session = CheckoutSession {
            id: "cs_1".into(),
            url: None,
            customer: Some("cus_1".into()),
            subscription: Some("sub_1".into()),
            metadata: [("team_id".to_string(), team.to_string()), ("plan_id".to_string(), "pro".to_string())]
                .into_iter()
                .collect(),
        };
        let change = SubscriptionChange::from_webhook(&WebhookKind::CheckoutCompleted(session), &HashMap::new()).unwrap();
        assert_eq!(change.team_id, Some(team));
        assert_eq!(change.plan_id.as_deref(), Some("pro"));
        assert_eq!(change.status.as_deref(), Some("active"));
    }

    #[test]
    fn paid_invoices_change_nothing() {
        let invoice = StripeInvoice {
            id: "in_1".into(),
            customer: "cus_1".into(),
            subscription: Some("sub_1".into()),
            amount_paid: 9_900,
            currency: "usd".into(),
        };
        assert!(SubscriptionChange::from_webhook(&WebhookKind::InvoicePaid(invoice), &HashMap::new()).is_none());
    }

    #[test]
    fn merge_keeps_unreported_fields() {
        let team = Uuid::new_v4();
        let now = Utc::now();
        let first = SubscriptionChange {
            plan_id: Some("pro".into()),
            status: Some("active".into()),
            customer_id: Some("cus_1".into()),
            subscription_id: Some("sub_1".into()),
            ..Default::default()
        }
        .merge(None, team, now);
        assert_eq!(first.team_id, team);

        let second = SubscriptionChange {
            status: Some("past_due".into()),
            ..Default::default()
        }
        .merge(Some(first.clone()), team, now);
        assert_eq!(second.id, first.id);
        assert_eq!(second.plan_id, "pro");
        assert_eq!(second.status, "past_due");
        assert_eq!(second.stripe_customer_id.as_deref(), Some("cus_1"));
    }

    #[test]
    fn new_rows_start_incomplete_on_the_default_plan() {
        let row = SubscriptionChange::default().merge(None, Uuid::new_v4(), Utc::now());
        assert_eq!(row.plan_id, DEFAULT_PLAN);
        assert_eq!(row.status, "incomplete");
    }
}
