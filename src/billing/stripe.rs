//! Thin Stripe API client: form-encoded calls against the v1 REST surface
//! plus webhook signature verification. Only the object fields this service
//! consumes are modeled.

use std::collections::HashMap;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

use crate::core::errors::ApiError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum age of a webhook timestamp before it is treated as a replay.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Error)]
pub enum StripeError {
    #[error("Stripe API error: {0}")]
    Api(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid webhook: {0}")]
    SignatureInvalid(String),
    #[error("parse error: {0}")]
    Parse(String),
}

impl From<StripeError> for ApiError {
    fn from(err: StripeError) -> Self {
        match err {
            StripeError::SignatureInvalid(_) => Self::SignatureInvalid,
            StripeError::Api(e) | StripeError::Network(e) => Self::Unavailable(e),
            StripeError::Parse(e) => Self::Database(e),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub customer: String,
    pub status: String,
    pub items: SubscriptionItems,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionItems {
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionItem {
    pub id: String,
    pub price: Price,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Price {
    pub id: String,
}

impl Subscription {
    /// Price id of the first subscription item, if any.
    pub fn price_id(&self) -> Option<&str> {
        self.items.data.first().map(|item| item.price.id.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub customer: String,
    pub amount_paid: i64,
    #[serde(default)]
    pub last_finalization_error: Option<InvoiceError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceError {
    pub message: Option<String>,
}

impl Invoice {
    pub fn failure_reason(&self) -> String {
        self.last_finalization_error
            .as_ref()
            .and_then(|e| e.message.clone())
            .unwrap_or_else(|| "Payment failed".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
    pub customer: Option<String>,
    pub subscription: Option<String>,
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CheckoutSession {
    /// Tenant reference carried through checkout metadata.
    pub fn organization_id(&self) -> Option<Uuid> {
        self.metadata
            .get("organizationId")
            .and_then(|v| Uuid::parse_str(v).ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalSession {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookData,
    pub created: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookData {
    pub object: serde_json::Value,
}

/// Typed view over the event kinds this service reacts to.
#[derive(Debug, Clone)]
pub enum StripeEvent {
    CheckoutCompleted(CheckoutSession),
    SubscriptionUpdated(Subscription),
    SubscriptionDeleted(Subscription),
    InvoicePaymentSucceeded(Invoice),
    InvoicePaymentFailed(Invoice),
    Unknown(String),
}

#[derive(Debug, Clone)]
pub struct CheckoutParams {
    pub customer_id: String,
    pub price_id: String,
    pub organization_id: Uuid,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone)]
pub struct StripeClient {
    api_key: String,
    webhook_secret: String,
    client: reqwest::Client,
    base_url: String,
}

impl StripeClient {
    pub fn new(api_key: String, webhook_secret: String) -> Self {
        Self {
            api_key,
            webhook_secret,
            client: reqwest::Client::new(),
            base_url: "https://api.stripe.com/v1".to_string(),
        }
    }

    #[doc(hidden)]
    pub fn with_base_url(api_key: String, webhook_secret: String, base_url: String) -> Self {
        Self {
            api_key,
            webhook_secret,
            client: reqwest::Client::new(),
            base_url,
        }
    }

    /// Reuse the customer already registered for `email`, or create one
    /// tagged with the organization id.
    pub async fn find_or_create_customer(
        &self,
        email: &str,
        name: Option<&str>,
        organization_id: Uuid,
    ) -> Result<Customer, StripeError> {
        #[derive(Deserialize)]
        struct CustomerList {
            data: Vec<Customer>,
        }

        let response = self
            .client
            .get(format!("{}/customers", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .basic_auth(&self.api_key, Option::<&str>::None)
            .query(&[("email", email), ("limit", "1")])
            .send()
            .await
            .map_err(|e| StripeError::Network(e.to_string()))?;

        let list: CustomerList = self.handle_response(response).await?;
        if let Some(existing) = list.data.into_iter().next() {
            return Ok(existing);
        }

        let mut form: Vec<(String, String)> = vec![("email".to_string(), email.to_string())];
        if let Some(name) = name {
            form.push(("name".to_string(), name.to_string()));
        }
        form.push((
            "metadata[organizationId]".to_string(),
            organization_id.to_string(),
        ));

        let response = self
            .client
            .post(format!("{}/customers", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .basic_auth(&self.api_key, Option::<&str>::None)
            .form(&form)
            .send()
            .await
            .map_err(|e| StripeError::Network(e.to_string()))?;

        self.handle_response(response).await
    }

    pub async fn create_checkout_session(
        &self,
        params: CheckoutParams,
    ) -> Result<CheckoutSession, StripeError> {
        let form: Vec<(String, String)> = vec![
            ("customer".to_string(), params.customer_id),
            ("mode".to_string(), "subscription".to_string()),
            ("payment_method_types[0]".to_string(), "card".to_string()),
            ("line_items[0][price]".to_string(), params.price_id),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
            ("success_url".to_string(), params.success_url),
            ("cancel_url".to_string(), params.cancel_url),
            (
                "metadata[organizationId]".to_string(),
                params.organization_id.to_string(),
            ),
            ("allow_promotion_codes".to_string(), "true".to_string()),
            ("billing_address_collection".to_string(), "auto".to_string()),
        ];

        let response = self
            .client
            .post(format!("{}/checkout/sessions", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .basic_auth(&self.api_key, Option::<&str>::None)
            .form(&form)
            .send()
            .await
            .map_err(|e| StripeError::Network(e.to_string()))?;

        self.handle_response(response).await
    }

    pub async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<PortalSession, StripeError> {
        let form: Vec<(String, String)> = vec![
            ("customer".to_string(), customer_id.to_string()),
            ("return_url".to_string(), return_url.to_string()),
        ];

        let response = self
            .client
            .post(format!("{}/billing_portal/sessions", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .basic_auth(&self.api_key, Option::<&str>::None)
            .form(&form)
            .send()
            .await
            .map_err(|e| StripeError::Network(e.to_string()))?;

        self.handle_response(response).await
    }

    pub async fn get_subscription(&self, subscription_id: &str) -> Result<Subscription, StripeError> {
        let response = self
            .client
            .get(format!("{}/subscriptions/{}", self.base_url, subscription_id))
            .timeout(REQUEST_TIMEOUT)
            .basic_auth(&self.api_key, Option::<&str>::None)
            .send()
            .await
            .map_err(|e| StripeError::Network(e.to_string()))?;

        self.handle_response(response).await
    }

    /// Cancel now, or flag for cancellation at period end.
    pub async fn cancel_subscription(
        &self,
        subscription_id: &str,
        immediately: bool,
    ) -> Result<Subscription, StripeError> {
        let url = format!("{}/subscriptions/{}", self.base_url, subscription_id);
        let request = if immediately {
            self.client.delete(&url)
        } else {
            self.client
                .post(&url)
                .form(&[("cancel_at_period_end", "true")])
        };

        let response = request
            .timeout(REQUEST_TIMEOUT)
            .basic_auth(&self.api_key, Option::<&str>::None)
            .send()
            .await
            .map_err(|e| StripeError::Network(e.to_string()))?;

        self.handle_response(response).await
    }

    /// Move the subscription's single item to a new price, with prorations.
    pub async fn update_subscription(
        &self,
        subscription_id: &str,
        new_price_id: &str,
    ) -> Result<Subscription, StripeError> {
        let subscription = self.get_subscription(subscription_id).await?;
        let item_id = subscription
            .items
            .data
            .first()
            .map(|item| item.id.clone())
            .ok_or_else(|| StripeError::Api("subscription has no items".to_string()))?;

        let form: Vec<(String, String)> = vec![
            ("items[0][id]".to_string(), item_id),
            ("items[0][price]".to_string(), new_price_id.to_string()),
            (
                "proration_behavior".to_string(),
                "create_prorations".to_string(),
            ),
        ];

        let response = self
            .client
            .post(format!("{}/subscriptions/{}", self.base_url, subscription_id))
            .timeout(REQUEST_TIMEOUT)
            .basic_auth(&self.api_key, Option::<&str>::None)
            .form(&form)
            .send()
            .await
            .map_err(|e| StripeError::Network(e.to_string()))?;

        self.handle_response(response).await
    }

    /// Verify the `stripe-signature` header over the raw body. Runs before
    /// any JSON parsing; failure is surfaced immediately, never retried.
    pub fn verify_webhook_signature(
        &self,
        payload: &str,
        signature_header: &str,
    ) -> Result<WebhookEvent, StripeError> {
        verify_signature_at(
            payload,
            signature_header,
            &self.webhook_secret,
            chrono::Utc::now().timestamp(),
        )?;
        serde_json::from_str(payload).map_err(|e| StripeError::Parse(e.to_string()))
    }

    /// Lift a verified envelope into the typed event set.
    pub fn parse_event(&self, event: &WebhookEvent) -> Result<StripeEvent, StripeError> {
        fn object<T: serde::de::DeserializeOwned>(
            event: &WebhookEvent,
        ) -> Result<T, StripeError> {
            serde_json::from_value(event.data.object.clone())
                .map_err(|e| StripeError::Parse(e.to_string()))
        }

        match event.event_type.as_str() {
            "checkout.session.completed" => Ok(StripeEvent::CheckoutCompleted(object(event)?)),
            "customer.subscription.updated" => Ok(StripeEvent::SubscriptionUpdated(object(event)?)),
            "customer.subscription.deleted" => Ok(StripeEvent::SubscriptionDeleted(object(event)?)),
            "invoice.payment_succeeded" => Ok(StripeEvent::InvoicePaymentSucceeded(object(event)?)),
            "invoice.payment_failed" => Ok(StripeEvent::InvoicePaymentFailed(object(event)?)),
            other => Ok(StripeEvent::Unknown(other.to_string())),
        }
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, StripeError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StripeError::Network(e.to_string()))?;

        if !status.is_success() {
            #[derive(Deserialize)]
            struct ApiErrorBody {
                error: ApiErrorDetail,
            }
            #[derive(Deserialize)]
            struct ApiErrorDetail {
                message: String,
            }

            if let Ok(parsed) = serde_json::from_str::<ApiErrorBody>(&body) {
                return Err(StripeError::Api(parsed.error.message));
            }
            return Err(StripeError::Api(format!("HTTP {status}: {body}")));
        }

        serde_json::from_str(&body).map_err(|e| StripeError::Parse(e.to_string()))
    }
}

type HmacSha256 = Hmac<Sha256>;

/// Signature check with an explicit clock, so replay tolerance is testable.
fn verify_signature_at(
    payload: &str,
    signature_header: &str,
    secret: &str,
    now: i64,
) -> Result<(), StripeError> {
    let parts: HashMap<&str, &str> = signature_header
        .split(',')
        .filter_map(|part| {
            let mut split = part.splitn(2, '=');
            Some((split.next()?, split.next()?))
        })
        .collect();

    let timestamp = parts
        .get("t")
        .ok_or_else(|| StripeError::SignatureInvalid("missing timestamp".to_string()))?;
    let received = parts
        .get("v1")
        .ok_or_else(|| StripeError::SignatureInvalid("missing signature".to_string()))?;

    let received_bytes = hex::decode(received)
        .map_err(|_| StripeError::SignatureInvalid("malformed signature".to_string()))?;

    let signed_payload = format!("{timestamp}.{payload}");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| StripeError::SignatureInvalid("invalid webhook secret".to_string()))?;
    mac.update(signed_payload.as_bytes());

    // Constant-time comparison.
    mac.verify_slice(&received_bytes)
        .map_err(|_| StripeError::SignatureInvalid("signature mismatch".to_string()))?;

    let timestamp: i64 = timestamp
        .parse()
        .map_err(|_| StripeError::SignatureInvalid("invalid timestamp".to_string()))?;
    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(StripeError::SignatureInvalid("timestamp too old".to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &str = "whsec_test_secret";

    fn sign(payload: &str, timestamp: i64, secret: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.{payload}").as_bytes());
        let digest = hex::encode(mac.finalize().into_bytes());
        format!("t={timestamp},v1={digest}")
    }

    fn event_json(event_type: &str, object: serde_json::Value) -> String {
        json!({
            "id": "evt_123",
            "type": event_type,
            "created": 1_700_000_000,
            "data": { "object": object },
        })
        .to_string()
    }

    #[test]
    fn valid_signature_verifies() {
        let payload = event_json("invoice.payment_succeeded", json!({}));
        let header = sign(&payload, 1_700_000_000, SECRET);
        assert!(verify_signature_at(&payload, &header, SECRET, 1_700_000_100).is_ok());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let payload = event_json("invoice.payment_succeeded", json!({"amount_paid": 100}));
        let header = sign(&payload, 1_700_000_000, SECRET);
        let tampered = payload.replace("100", "999");
        let err = verify_signature_at(&tampered, &header, SECRET, 1_700_000_100).unwrap_err();
        assert!(matches!(err, StripeError::SignatureInvalid(_)));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let payload = event_json("invoice.payment_succeeded", json!({}));
        let header = sign(&payload, 1_700_000_000, "whsec_other");
        assert!(verify_signature_at(&payload, &header, SECRET, 1_700_000_100).is_err());
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let payload = event_json("invoice.payment_succeeded", json!({}));
        let header = sign(&payload, 1_700_000_000, SECRET);
        let err = verify_signature_at(&payload, &header, SECRET, 1_700_000_000 + 301).unwrap_err();
        assert!(matches!(err, StripeError::SignatureInvalid(_)));
    }

    #[test]
    fn header_without_v1_is_rejected() {
        let err = verify_signature_at("{}", "t=123", SECRET, 123).unwrap_err();
        assert!(matches!(err, StripeError::SignatureInvalid(_)));
    }

    #[test]
    fn verify_parses_envelope_after_signature() {
        let client =
            StripeClient::new("sk_test".to_string(), SECRET.to_string());
        let payload = event_json("customer.subscription.deleted", json!({
            "id": "sub_abc",
            "customer": "cus_1",
            "status": "canceled",
            "items": { "data": [] },
        }));
        let now = chrono::Utc::now().timestamp();
        let header = sign(&payload, now, SECRET);
        let event = client.verify_webhook_signature(&payload, &header).unwrap();
        assert_eq!(event.event_type, "customer.subscription.deleted");
    }

    #[test]
    fn parse_event_maps_known_kinds() {
        let client = StripeClient::new("sk_test".to_string(), SECRET.to_string());

        let envelope: WebhookEvent = serde_json::from_str(&event_json(
            "customer.subscription.updated",
            json!({
                "id": "sub_abc",
                "customer": "cus_1",
                "status": "active",
                "items": { "data": [{ "id": "si_1", "price": { "id": "price_pro" } }] },
            }),
        ))
        .unwrap();

        match client.parse_event(&envelope).unwrap() {
            StripeEvent::SubscriptionUpdated(sub) => {
                assert_eq!(sub.id, "sub_abc");
                assert_eq!(sub.price_id(), Some("price_pro"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parse_event_passes_unknown_kinds_through() {
        let client = StripeClient::new("sk_test".to_string(), SECRET.to_string());
        let envelope: WebhookEvent =
            serde_json::from_str(&event_json("customer.created", json!({}))).unwrap();
        assert!(matches!(
            client.parse_event(&envelope).unwrap(),
            StripeEvent::Unknown(kind) if kind == "customer.created"
        ));
    }

    #[test]
    fn checkout_session_reads_org_metadata() {
        let org_id = Uuid::new_v4();
        let session: CheckoutSession = serde_json::from_value(json!({
            "id": "cs_1",
            "url": null,
            "customer": "cus_1",
            "subscription": "sub_1",
            "amount_total": 2900,
            "metadata": { "organizationId": org_id.to_string() },
        }))
        .unwrap();
        assert_eq!(session.organization_id(), Some(org_id));
    }

    #[test]
    fn invoice_failure_reason_defaults() {
        let invoice: Invoice = serde_json::from_value(json!({
            "id": "in_1",
            "customer": "cus_1",
            "amount_paid": 0,
        }))
        .unwrap();
        assert_eq!(invoice.failure_reason(), "Payment failed");

        let invoice: Invoice = serde_json::from_value(json!({
            "id": "in_1",
            "customer": "cus_1",
            "amount_paid": 0,
            "last_finalization_error": { "message": "card declined" },
        }))
        .unwrap();
        assert_eq!(invoice.failure_reason(), "card declined");
    }

    #[tokio::test]
    async fn find_or_create_reuses_existing_customer() {
        let mut server = mockito::Server::new_async().await;
        let list = server
            .mock("GET", "/customers")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(json!({ "data": [{ "id": "cus_existing", "email": "a@b.c" }] }).to_string())
            .create_async()
            .await;

        let client = StripeClient::with_base_url(
            "sk_test".to_string(),
            SECRET.to_string(),
            server.url(),
        );
        let customer = client
            .find_or_create_customer("a@b.c", None, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(customer.id, "cus_existing");
        list.assert_async().await;
    }

    #[tokio::test]
    async fn api_errors_surface_the_stripe_message() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/billing_portal/sessions")
            .with_status(400)
            .with_body(json!({ "error": { "message": "No such customer" } }).to_string())
            .create_async()
            .await;

        let client = StripeClient::with_base_url(
            "sk_test".to_string(),
            SECRET.to_string(),
            server.url(),
        );
        let err = client
            .create_portal_session("cus_missing", "https://app.test/billing")
            .await
            .unwrap_err();
        assert!(matches!(err, StripeError::Api(msg) if msg == "No such customer"));
    }
}
