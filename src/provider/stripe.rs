//! Stripe adapter.
//!
//! Payments ride the PaymentIntent API with amounts in the smallest currency
//! unit. Webhooks are the one provider channel with real authentication: a
//! `stripe-signature` header carrying a timestamp and an HMAC-SHA256 digest
//! over `"{timestamp}.{raw_body}"`. The raw body bytes must reach
//! [`verify_callback`] untouched; any re-serialization breaks the digest.

use async_trait::async_trait;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;

use crate::config::StripeConfig;
use crate::provider::{
    CALL_TIMEOUT, CallbackEvent, CallbackKind, CreateIntent, CreateOutcome, PaymentProvider,
    ProviderError, RefundOutcome, RemoteState, StatusOutcome, snippet,
};
use crate::types::{Channel, Currency};

type HmacSha256 = Hmac<Sha256>;

pub struct StripeProvider {
    http: reqwest::Client,
    config: StripeConfig,
}

#[derive(Debug, Deserialize)]
struct PaymentIntent {
    id: String,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct RefundObject {
    id: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct Event {
    #[serde(rename = "type")]
    kind: String,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: Value,
}

/// Convert a decimal amount to the smallest currency unit.
fn minor_units(amount: Decimal) -> Result<i64, ProviderError> {
    (amount * Decimal::from(100))
        .round()
        .to_i64()
        .filter(|cents| *cents >= 0)
        .ok_or_else(|| ProviderError::Malformed {
            channel: Channel::Stripe,
            message: format!("amount {amount} does not fit in minor units"),
        })
}

/// Parse `t=<unix>,v1=<hex>[,v1=<hex>...]` out of the signature header.
fn parse_signature_header(header: &str) -> Result<(String, Vec<String>), ProviderError> {
    let mut timestamp = None;
    let mut digests = Vec::new();
    for element in header.split(',') {
        match element.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value.to_string()),
            Some(("v1", value)) => digests.push(value.to_string()),
            _ => {}
        }
    }
    let timestamp = timestamp
        .ok_or_else(|| ProviderError::InvalidCallback("signature header missing t".to_string()))?;
    if digests.is_empty() {
        return Err(ProviderError::InvalidCallback(
            "signature header missing v1".to_string(),
        ));
    }
    Ok((timestamp, digests))
}

/// Check the header digests against HMAC-SHA256(`"{t}.{raw_body}"`, secret).
fn verify_signature(
    secret: &str,
    timestamp: &str,
    raw_body: &[u8],
    digests: &[String],
) -> Result<(), ProviderError> {
    for candidate in digests {
        let Ok(candidate_bytes) = hex::decode(candidate) else {
            continue;
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| ProviderError::InvalidCallback("unusable webhook secret".to_string()))?;
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(raw_body);
        if mac.verify_slice(&candidate_bytes).is_ok() {
            return Ok(());
        }
    }
    Err(ProviderError::InvalidCallback(
        "signature mismatch".to_string(),
    ))
}

impl StripeProvider {
    pub fn new(http: reqwest::Client, config: StripeConfig) -> Self {
        Self { http, config }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.as_str().trim_end_matches('/'), path)
    }

    async fn read_error(&self, response: reqwest::Response) -> ProviderError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        ProviderError::Remote {
            channel: Channel::Stripe,
            status: Some(status.as_u16()),
            message: snippet(&body),
        }
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    fn channel(&self) -> Channel {
        Channel::Stripe
    }

    #[tracing::instrument(skip_all, fields(payment = %intent.payment_reference))]
    async fn create(&self, intent: &CreateIntent) -> Result<CreateOutcome, ProviderError> {
        let cents = minor_units(intent.amount)?;
        let mut form: Vec<(&str, String)> = vec![
            ("amount", cents.to_string()),
            ("currency", intent.currency.as_str().to_lowercase()),
            ("metadata[payment_reference]", intent.payment_reference.clone()),
            ("automatic_payment_methods[enabled]", "true".to_string()),
        ];
        if let Some(order_id) = &intent.order_id {
            form.push(("metadata[order_id]", order_id.clone()));
        }
        if let Some(email) = &intent.customer_email {
            form.push(("receipt_email", email.clone()));
        }
        if let Some(description) = &intent.description {
            form.push(("description", description.clone()));
        }

        let response = self
            .http
            .post(self.endpoint("/v1/payment_intents"))
            .bearer_auth(&self.config.secret_key)
            .form(&form)
            .timeout(CALL_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(Channel::Stripe, e))?;

        if !response.status().is_success() {
            return Err(self.read_error(response).await);
        }
        let intent_object: PaymentIntent =
            response.json().await.map_err(|e| ProviderError::Malformed {
                channel: Channel::Stripe,
                message: format!("payment_intent response: {e}"),
            })?;
        Ok(CreateOutcome {
            provider_tx_id: intent_object.id,
            // PaymentIntents have no hosted page; the client secret drives
            // the merchant's embedded checkout.
            redirect_url: None,
            provider_reference: intent_object.client_secret,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn status(&self, provider_tx_id: &str) -> Result<StatusOutcome, ProviderError> {
        let response = self
            .http
            .get(self.endpoint(&format!("/v1/payment_intents/{provider_tx_id}")))
            .bearer_auth(&self.config.secret_key)
            .timeout(CALL_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(Channel::Stripe, e))?;

        if !response.status().is_success() {
            return Err(self.read_error(response).await);
        }
        let intent_object: PaymentIntent =
            response.json().await.map_err(|e| ProviderError::Malformed {
                channel: Channel::Stripe,
                message: format!("payment_intent response: {e}"),
            })?;
        let state = match intent_object.status.as_str() {
            "succeeded" => RemoteState::Completed,
            "canceled" => RemoteState::Cancelled,
            _ => RemoteState::Pending,
        };
        Ok(StatusOutcome {
            state,
            payer: None,
        })
    }

    async fn refund(
        &self,
        provider_tx_id: &str,
        amount: Decimal,
        _currency: Currency,
    ) -> Result<RefundOutcome, ProviderError> {
        let cents = minor_units(amount)?;
        let response = self
            .http
            .post(self.endpoint("/v1/refunds"))
            .bearer_auth(&self.config.secret_key)
            .form(&[
                ("payment_intent", provider_tx_id.to_string()),
                ("amount", cents.to_string()),
            ])
            .timeout(CALL_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(Channel::Stripe, e))?;

        if !response.status().is_success() {
            return Err(self.read_error(response).await);
        }
        let refund: RefundObject = response.json().await.map_err(|e| ProviderError::Malformed {
            channel: Channel::Stripe,
            message: format!("refund response: {e}"),
        })?;
        Ok(RefundOutcome {
            refund_id: refund.id,
            state: refund.status,
        })
    }

    fn verify_callback(
        &self,
        raw_body: &[u8],
        headers: &HeaderMap,
    ) -> Result<Option<CallbackEvent>, ProviderError> {
        let header = headers
            .get("stripe-signature")
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                ProviderError::InvalidCallback("missing stripe-signature header".to_string())
            })?;
        let (timestamp, digests) = parse_signature_header(header)?;
        verify_signature(&self.config.webhook_secret, &timestamp, raw_body, &digests)?;

        let event: Event = serde_json::from_slice(raw_body)
            .map_err(|e| ProviderError::InvalidCallback(format!("event body: {e}")))?;
        let object = &event.data.object;

        let event = match event.kind.as_str() {
            "payment_intent.succeeded" => CallbackEvent {
                provider_tx_id: object_id(object)?,
                kind: CallbackKind::Succeeded {
                    payer: object
                        .get("receipt_email")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                },
            },
            "payment_intent.payment_failed" => CallbackEvent {
                provider_tx_id: object_id(object)?,
                kind: CallbackKind::Failed {
                    reason: object
                        .get("last_payment_error")
                        .and_then(|e| e.get("message"))
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                },
            },
            "payment_intent.canceled" => CallbackEvent {
                provider_tx_id: object_id(object)?,
                kind: CallbackKind::Cancelled,
            },
            "charge.refunded" => {
                let provider_tx_id = object
                    .get("payment_intent")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ProviderError::InvalidCallback(
                            "charge without payment_intent".to_string(),
                        )
                    })?
                    .to_string();
                let cents = object
                    .get("amount_refunded")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| {
                        ProviderError::InvalidCallback("charge without amount_refunded".to_string())
                    })?;
                CallbackEvent {
                    provider_tx_id,
                    kind: CallbackKind::Refunded {
                        total_refunded: Decimal::new(cents, 2),
                    },
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

fn object_id(object: &Value) -> Result<String, ProviderError> {
    object
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| ProviderError::InvalidCallback("event object without id".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SECRET: &str = "whsec_test_secret";

    fn provider_with(api_base: &str) -> StripeProvider {
        StripeProvider::new(
            reqwest::Client::new(),
            StripeConfig {
                secret_key: "sk_test_key".to_string(),
                webhook_secret: SECRET.to_string(),
                api_base: api_base.parse().unwrap(),
            },
        )
    }

    fn sign(body: &str, timestamp: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_headers(body: &str, timestamp: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "stripe-signature",
            format!("t={},v1={}", timestamp, sign(body, timestamp))
                .parse()
                .unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn create_converts_the_amount_to_minor_units() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payment_intents"))
            .and(header("authorization", "Bearer sk_test_key"))
            .and(body_string_contains("amount=1050"))
            .and(body_string_contains("currency=usd"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "pi_123",
                "client_secret": "pi_123_secret_abc",
                "status": "requires_payment_method",
            })))
            .mount(&server)
            .await;

        let provider = provider_with(&server.uri());
        let outcome = provider
            .create(&CreateIntent {
                amount: Decimal::from_str("10.50").unwrap(),
                currency: Currency::Usd,
                payment_reference: "pay_s".to_string(),
                order_id: Some("O2".to_string()),
                customer_email: None,
                customer_phone: None,
                description: None,
            })
            .await
            .expect("create succeeds");
        assert_eq!(outcome.provider_tx_id, "pi_123");
        assert_eq!(outcome.provider_reference.as_deref(), Some("pi_123_secret_abc"));
        assert!(outcome.redirect_url.is_none());
    }

    #[test]
    fn succeeded_event_with_valid_signature_is_accepted() {
        let provider = provider_with("https://api.stripe.test");
        let body = json!({
            "type": "payment_intent.succeeded",
            "data": { "object": { "id": "pi_X", "receipt_email": "a@b.c" } },
        })
        .to_string();
        let headers = signed_headers(&body, "1700000000");
        let event = provider
            .verify_callback(body.as_bytes(), &headers)
            .expect("valid signature")
            .expect("actionable event");
        assert_eq!(event.provider_tx_id, "pi_X");
        assert!(matches!(event.kind, CallbackKind::Succeeded { .. }));
    }

    #[test]
    fn tampered_body_is_rejected() {
        let provider = provider_with("https://api.stripe.test");
        let body = json!({
            "type": "payment_intent.succeeded",
            "data": { "object": { "id": "pi_X" } },
        })
        .to_string();
        let headers = signed_headers(&body, "1700000000");
        let tampered = body.replace("pi_X", "pi_Y");
        let error = provider
            .verify_callback(tampered.as_bytes(), &headers)
            .expect_err("tampered body must fail");
        assert!(matches!(error, ProviderError::InvalidCallback(_)));
    }

    #[test]
    fn missing_signature_header_is_rejected() {
        let provider = provider_with("https://api.stripe.test");
        let error = provider
            .verify_callback(b"{}", &HeaderMap::new())
            .expect_err("no header must fail");
        assert!(matches!(error, ProviderError::InvalidCallback(_)));
    }

    #[test]
    fn payment_failed_extracts_the_decline_reason() {
        let provider = provider_with("https://api.stripe.test");
        let body = json!({
            "type": "payment_intent.payment_failed",
            "data": { "object": {
                "id": "pi_X",
                "last_payment_error": { "message": "card_declined" },
            } },
        })
        .to_string();
        let headers = signed_headers(&body, "1700000001");
        let event = provider
            .verify_callback(body.as_bytes(), &headers)
            .unwrap()
            .unwrap();
        assert!(matches!(
            event.kind,
            CallbackKind::Failed { reason: Some(ref r) } if r == "card_declined"
        ));
    }

    #[test]
    fn charge_refunded_reports_the_total_in_major_units() {
        let provider = provider_with("https://api.stripe.test");
        let body = json!({
            "type": "charge.refunded",
            "data": { "object": {
                "id": "ch_1",
                "payment_intent": "pi_X",
                "amount_refunded": 1234,
            } },
        })
        .to_string();
        let headers = signed_headers(&body, "1700000002");
        let event = provider
            .verify_callback(body.as_bytes(), &headers)
            .unwrap()
            .unwrap();
        assert_eq!(event.provider_tx_id, "pi_X");
        assert!(matches!(
            event.kind,
            CallbackKind::Refunded { total_refunded } if total_refunded == Decimal::from_str("12.34").unwrap()
        ));
    }

    #[test]
    fn unhandled_event_types_are_authentic_but_ignored() {
        let provider = provider_with("https://api.stripe.test");
        let body = json!({
            "type": "customer.created",
            "data": { "object": { "id": "cus_1" } },
        })
        .to_string();
        let headers = signed_headers(&body, "1700000003");
        assert!(
            provider
                .verify_callback(body.as_bytes(), &headers)
                .expect("authentic")
                .is_none()
        );
    }

    #[test]
    fn minor_unit_conversion() {
        assert_eq!(minor_units(Decimal::from_str("10.50").unwrap()).unwrap(), 1050);
        assert_eq!(minor_units(Decimal::from(0)).unwrap(), 0);
        assert!(minor_units(Decimal::from(-1)).is_err());
    }
}
