use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use tracing::error;

/// Minimal Stripe client built on reqwest.
pub struct StripeClient {
    http: reqwest::Client,
    secret_key: String,
    api_base: String,
}

/// Inputs for a subscription-mode Checkout Session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionRequest {
    pub price_ref: String,
    pub user_email: String,
    pub client_reference_id: String,
    pub success_url: String,
    pub cancel_url: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub session_id: String,
    pub redirect_url: String,
}

#[derive(Debug, Deserialize)]
pub struct StripeEvent {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub type_: String,
    pub created: Option<i64>,
    pub data: StripeEventData,
}

impl StripeEvent {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created.and_then(from_unix)
    }
}

#[derive(Debug, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

/// Stripe returns either an id or, when expanded, the full object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Expandable<T> {
    Id(String),
    Object(Box<T>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeCustomer {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeCheckoutSession {
    pub id: String,
    pub mode: Option<String>,
    pub status: Option<String>,
    pub payment_status: Option<String>,
    pub customer: Option<Expandable<StripeCustomer>>,
    pub subscription: Option<Expandable<StripeSubscription>>,
    pub client_reference_id: Option<String>,
    pub metadata: Option<HashMap<String, String>>,
}

impl StripeCheckoutSession {
    pub fn customer_id(&self) -> Option<&str> {
        match self.customer.as_ref()? {
            Expandable::Id(id) => Some(id),
            Expandable::Object(customer) => Some(&customer.id),
        }
    }

    pub fn subscription_id(&self) -> Option<&str> {
        match self.subscription.as_ref()? {
            Expandable::Id(id) => Some(id),
            Expandable::Object(subscription) => Some(&subscription.id),
        }
    }

    /// The subscription object, only present when the session was retrieved expanded.
    pub fn subscription(&self) -> Option<&StripeSubscription> {
        match self.subscription.as_ref()? {
            Expandable::Id(_) => None,
            Expandable::Object(subscription) => Some(subscription),
        }
    }

    /// Paid, or completed without payment (trials and 100% coupons).
    pub fn is_payment_completed(&self) -> bool {
        match self.payment_status.as_deref() {
            Some("paid") => true,
            Some("no_payment_required") => self.status.as_deref() == Some("complete"),
            _ => false,
        }
    }

    pub fn payment_status_label(&self) -> String {
        self.payment_status
            .clone()
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[derive(Debug, Deserialize)]
struct StripeErrorEnvelope {
    error: StripeErrorDetails,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetails {
    #[serde(rename = "type")]
    type_: Option<String>,
    code: Option<String>,
    message: Option<String>,
    param: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscription {
    pub id: String,
    pub customer: Option<Expandable<StripeCustomer>>,
    pub status: Option<String>,
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub items: StripeSubscriptionItems,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StripeSubscriptionItems {
    pub data: Vec<StripeSubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscriptionItem {
    pub current_period_end: Option<i64>,
    pub price: Option<StripePrice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripePrice {
    pub id: String,
}

impl StripeSubscription {
    /// Returns the subscription period end, falling back to the first item when the
    /// top-level field is absent (newer API versions moved it onto items).
    pub fn period_end(&self) -> Option<DateTime<Utc>> {
        self.current_period_end
            .or_else(|| {
                self.items
                    .data
                    .first()
                    .and_then(|item| item.current_period_end)
            })
            .and_then(from_unix)
    }

    pub fn price_id(&self) -> Option<&str> {
        self.items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.as_str())
    }

    pub fn customer_id(&self) -> Option<&str> {
        match self.customer.as_ref()? {
            Expandable::Id(id) => Some(id),
            Expandable::Object(customer) => Some(&customer.id),
        }
    }
}

fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
}

impl StripeClient {
    pub fn new(secret_key: String, api_base: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            secret_key,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    async fn ensure_success(
        resp: reqwest::Response,
        context: &str,
    ) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status();
        let request_id = resp
            .headers()
            .get("request-id")
            .or_else(|| resp.headers().get("stripe-request-id"))
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());

        let body = match resp.text().await {
            Ok(text) if !text.is_empty() => text,
            Ok(_) => "<empty response body>".to_string(),
            Err(err) => format!("<failed to read response body: {err}>"),
        };

        let (stripe_error_type, stripe_error_code, stripe_error_param, stripe_error_message) =
            match serde_json::from_str::<StripeErrorEnvelope>(&body) {
                Ok(envelope) => {
                    let details = envelope.error;
                    (details.type_, details.code, details.param, details.message)
                }
                Err(_) => (None, None, None, None),
            };

        error!(
            status = %status,
            stripe_request_id = ?request_id,
            stripe_error_type = ?stripe_error_type,
            stripe_error_code = ?stripe_error_code,
            stripe_error_param = ?stripe_error_param,
            stripe_error_message = ?stripe_error_message,
            response_body = %body,
            context = %context,
            "stripe api request failed"
        );

        anyhow::bail!(
            "Stripe API request failed: {} (status {}, request_id={:?})",
            context,
            status,
            request_id
        );
    }

    /// Creates a subscription-mode Checkout Session.
    pub async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession> {
        // https://stripe.com/docs/api/checkout/sessions/create
        let mut body: Vec<(String, String)> = vec![
            ("mode".to_string(), "subscription".to_string()),
            ("payment_method_types[0]".to_string(), "card".to_string()),
            ("line_items[0][price]".to_string(), request.price_ref.clone()),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
            ("customer_email".to_string(), request.user_email.clone()),
            (
                "client_reference_id".to_string(),
                request.client_reference_id.clone(),
            ),
            ("success_url".to_string(), request.success_url.clone()),
            ("cancel_url".to_string(), request.cancel_url.clone()),
        ];

        for (key, value) in &request.metadata {
            body.push((format!("metadata[{key}]"), value.clone()));
            // Subscription events only carry the subscription's own metadata.
            body.push((format!("subscription_data[metadata][{key}]"), value.clone()));
        }

        let resp = self
            .http
            .post(format!("{}/v1/checkout/sessions", self.api_base))
            .header(AUTHORIZATION, format!("Bearer {}", self.secret_key))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .form(&body)
            .send()
            .await
            .context("failed to reach stripe for checkout session creation")?;
        let resp = Self::ensure_success(resp, "create checkout session").await?;

        #[derive(Deserialize)]
        struct CheckoutResp {
            id: String,
            url: Option<String>,
        }

        let parsed: CheckoutResp = resp.json().await?;
        let redirect_url = parsed.url.ok_or_else(|| {
            anyhow::anyhow!("Stripe Checkout session {} has no redirect URL", parsed.id)
        })?;

        Ok(CheckoutSession {
            session_id: parsed.id,
            redirect_url,
        })
    }

    /// Retrieves a Checkout Session with its subscription expanded.
    pub async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<StripeCheckoutSession> {
        // https://stripe.com/docs/api/checkout/sessions/retrieve
        let resp = self
            .http
            .get(format!(
                "{}/v1/checkout/sessions/{}",
                self.api_base, session_id
            ))
            .header(AUTHORIZATION, format!("Bearer {}", self.secret_key))
            .query(&[("expand[]", "subscription")])
            .send()
            .await
            .with_context(|| format!("failed to reach stripe for session {session_id}"))?;
        let resp = Self::ensure_success(resp, "retrieve checkout session").await?;

        let session: StripeCheckoutSession = resp.json().await?;
        Ok(session)
    }
}

pub fn extract_checkout_session(event: &StripeEvent) -> Result<StripeCheckoutSession> {
    serde_json::from_value(event.data.object.clone())
        .with_context(|| format!("event {:?} does not carry a checkout session", event.id))
}

pub fn extract_subscription(event: &StripeEvent) -> Result<StripeSubscription> {
    serde_json::from_value(event.data.object.clone())
        .with_context(|| format!("event {:?} does not carry a subscription", event.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expanded_session_exposes_subscription_details() {
        let session: StripeCheckoutSession = serde_json::from_value(json!({
            "id": "cs_1",
            "status": "complete",
            "payment_status": "paid",
            "customer": "cus_1",
            "subscription": {
                "id": "sub_abc",
                "customer": "cus_1",
                "status": "active",
                "items": { "data": [
                    { "current_period_end": 1_760_000_000, "price": { "id": "price_pro_m" } }
                ]}
            },
            "metadata": { "user_id": "u1" }
        }))
        .unwrap();

        assert!(session.is_payment_completed());
        assert_eq!(session.customer_id(), Some("cus_1"));
        assert_eq!(session.subscription_id(), Some("sub_abc"));

        let subscription = session.subscription().unwrap();
        assert_eq!(subscription.price_id(), Some("price_pro_m"));
        assert_eq!(
            subscription.period_end(),
            DateTime::<Utc>::from_timestamp(1_760_000_000, 0)
        );
    }

    #[test]
    fn unexpanded_session_still_yields_ids() {
        let session: StripeCheckoutSession = serde_json::from_value(json!({
            "id": "cs_1",
            "status": "open",
            "payment_status": "unpaid",
            "customer": { "id": "cus_9" },
            "subscription": "sub_xyz"
        }))
        .unwrap();

        assert!(!session.is_payment_completed());
        assert_eq!(session.payment_status_label(), "unpaid");
        assert_eq!(session.customer_id(), Some("cus_9"));
        assert_eq!(session.subscription_id(), Some("sub_xyz"));
        assert!(session.subscription().is_none());
    }

    #[test]
    fn trial_without_payment_counts_only_once_complete() {
        let mut session: StripeCheckoutSession = serde_json::from_value(json!({
            "id": "cs_1",
            "status": "open",
            "payment_status": "no_payment_required"
        }))
        .unwrap();
        assert!(!session.is_payment_completed());

        session.status = Some("complete".to_string());
        assert!(session.is_payment_completed());
    }

    #[test]
    fn top_level_period_end_wins_over_items() {
        let subscription: StripeSubscription = serde_json::from_value(json!({
            "id": "sub_abc",
            "current_period_end": 100,
            "items": { "data": [ { "current_period_end": 200 } ] }
        }))
        .unwrap();

        assert_eq!(
            subscription.period_end(),
            DateTime::<Utc>::from_timestamp(100, 0)
        );
        assert_eq!(subscription.price_id(), None);
    }
}
