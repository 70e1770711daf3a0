//! MonCash (Digicel) adapter.
//!
//! MonCash only moves gourdes, so USD payments are expressed in HTG at the
//! fixed estimation before dispatch. The create endpoint answers with a
//! `payment_token` JWT whose payload carries the processor transaction id
//! and reference; the hosted checkout URL embeds the whole token. Callbacks
//! carry no signature; authenticity is structural.

use async_trait::async_trait;
use axum::http::HeaderMap;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Deserializer};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::config::MoncashConfig;
use crate::money;
use crate::provider::token::{OauthEndpoint, TokenCache};
use crate::provider::{
    CALL_TIMEOUT, CallbackEvent, CallbackKind, CreateIntent, CreateOutcome, PaymentProvider,
    ProviderError, RefundOutcome, RemoteState, StatusOutcome, snippet,
};
use crate::types::{Channel, Currency};

pub struct MoncashProvider {
    http: reqwest::Client,
    tokens: Arc<TokenCache>,
    config: MoncashConfig,
}

/// Payload segment of the `payment_token` JWT.
#[derive(Debug, Deserialize)]
struct PaymentTokenClaims {
    #[serde(deserialize_with = "string_or_number")]
    id: String,
    #[serde(rename = "ref")]
    reference: String,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    payment_token: PaymentTokenEnvelope,
}

#[derive(Debug, Deserialize)]
struct PaymentTokenEnvelope {
    token: String,
}

impl MoncashProvider {
    pub fn new(http: reqwest::Client, tokens: Arc<TokenCache>, config: MoncashConfig) -> Self {
        Self {
            http,
            tokens,
            config,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.as_str().trim_end_matches('/'), path)
    }

    fn oauth(&self) -> OauthEndpoint {
        OauthEndpoint {
            token_url: self
                .endpoint("/Api/oauth/token")
                .parse()
                .expect("base url + fixed path is a valid url"),
            client_id: self.config.client_id.clone(),
            client_secret: self.config.client_secret.clone(),
        }
    }

    fn redirect_url(&self, token: &str) -> String {
        format!(
            "{}/Moncash-middleware/Checkout/Payment/Redirect?token={}",
            self.config.gateway_base.as_str().trim_end_matches('/'),
            token
        )
    }
}

/// Decode the payload segment of a JWT without verifying it; the token came
/// to us over TLS from the processor and is only mined for identifiers.
fn decode_payment_token(jwt: &str) -> Result<PaymentTokenClaims, ProviderError> {
    let malformed = |message: String| ProviderError::Malformed {
        channel: Channel::Moncash,
        message,
    };
    let payload = jwt
        .split('.')
        .nth(1)
        .ok_or_else(|| malformed("payment_token is not a JWT".to_string()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| malformed(format!("payment_token payload: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| malformed(format!("payment_token claims: {e}")))
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

#[async_trait]
impl PaymentProvider for MoncashProvider {
    fn channel(&self) -> Channel {
        Channel::Moncash
    }

    #[tracing::instrument(skip_all, fields(payment = %intent.payment_reference))]
    async fn create(&self, intent: &CreateIntent) -> Result<CreateOutcome, ProviderError> {
        let token = self.tokens.bearer_token(Channel::Moncash, &self.oauth()).await?;
        let amount_htg = money::to_htg(intent.amount, intent.currency);
        let order_id = intent
            .order_id
            .clone()
            .unwrap_or_else(|| intent.payment_reference.clone());

        let response = self
            .http
            .post(self.endpoint("/Api/v1/CreatePayment"))
            .bearer_auth(&token)
            .json(&json!({
                "amount": amount_htg.to_f64(),
                "orderId": order_id,
            }))
            .timeout(CALL_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(Channel::Moncash, e))?;

        let status = response.status();
        if !status.is_success() {
            if status == reqwest::StatusCode::UNAUTHORIZED {
                self.tokens.invalidate(Channel::Moncash);
            }
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Remote {
                channel: Channel::Moncash,
                status: Some(status.as_u16()),
                message: snippet(&body),
            });
        }

        let body: CreateResponse = response.json().await.map_err(|e| ProviderError::Malformed {
            channel: Channel::Moncash,
            message: format!("create response: {e}"),
        })?;
        let claims = decode_payment_token(&body.payment_token.token)?;
        Ok(CreateOutcome {
            provider_tx_id: claims.id,
            redirect_url: Some(self.redirect_url(&body.payment_token.token)),
            provider_reference: Some(claims.reference),
        })
    }

    #[tracing::instrument(skip(self))]
    async fn status(&self, provider_tx_id: &str) -> Result<StatusOutcome, ProviderError> {
        let token = self.tokens.bearer_token(Channel::Moncash, &self.oauth()).await?;
        let response = self
            .http
            .post(self.endpoint("/Api/v1/RetrieveTransactionPayment"))
            .bearer_auth(&token)
            .json(&json!({ "transactionId": provider_tx_id }))
            .timeout(CALL_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(Channel::Moncash, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Remote {
                channel: Channel::Moncash,
                status: Some(status.as_u16()),
                message: snippet(&body),
            });
        }

        let body: Value = response.json().await.map_err(|e| ProviderError::Malformed {
            channel: Channel::Moncash,
            message: format!("status response: {e}"),
        })?;
        let payment = body.get("payment").unwrap_or(&Value::Null);
        let message = payment
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let state = match message {
            "successful" => RemoteState::Completed,
            "failed" => RemoteState::Failed,
            _ => RemoteState::Pending,
        };
        Ok(StatusOutcome {
            state,
            payer: payment
                .get("payer")
                .and_then(Value::as_str)
                .map(str::to_owned),
        })
    }

    async fn refund(
        &self,
        _provider_tx_id: &str,
        _amount: Decimal,
        _currency: Currency,
    ) -> Result<RefundOutcome, ProviderError> {
        // MonCash exposes no merchant-initiated refund API.
        Err(ProviderError::Unsupported {
            channel: Channel::Moncash,
            operation: "refund",
        })
    }

    /// MonCash posts unsigned callbacks; authenticity is judged on shape:
    /// `transactionId`, `orderId`, and a numeric `amount` must be present.
    fn verify_callback(
        &self,
        raw_body: &[u8],
        _headers: &HeaderMap,
    ) -> Result<Option<CallbackEvent>, ProviderError> {
        let body: Value = serde_json::from_slice(raw_body)
            .map_err(|e| ProviderError::InvalidCallback(format!("body is not JSON: {e}")))?;

        let provider_tx_id = match body.get("transactionId") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(ProviderError::InvalidCallback(
                    "missing transactionId".to_string(),
                ));
            }
        };
        if body.get("orderId").is_none() {
            return Err(ProviderError::InvalidCallback("missing orderId".to_string()));
        }
        if !body.get("amount").map(Value::is_number).unwrap_or(false) {
            return Err(ProviderError::InvalidCallback(
                "amount missing or not numeric".to_string(),
            ));
        }

        Ok(Some(CallbackEvent {
            provider_tx_id,
            kind: CallbackKind::Succeeded {
                payer: body.get("payer").and_then(Value::as_str).map(str::to_owned),
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(server: &MockServer) -> MoncashProvider {
        let config = MoncashConfig {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            api_base: server.uri().parse().unwrap(),
            gateway_base: server.uri().parse().unwrap(),
        };
        MoncashProvider::new(
            reqwest::Client::new(),
            Arc::new(TokenCache::new(reqwest::Client::new())),
            config,
        )
    }

    /// JWT with payload `{"id": "ABC", "ref": "REF1"}` and junk header/signature.
    fn fake_payment_token() -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256"}"#);
        let payload = URL_SAFE_NO_PAD.encode(br#"{"id":"ABC","ref":"REF1","iat":1700000000}"#);
        format!("{header}.{payload}.sig")
    }

    #[tokio::test]
    async fn create_mines_the_payment_token_and_builds_the_redirect() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/Api/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok",
                "expires_in": 3600,
            })))
            .mount(&server)
            .await;
        let token = fake_payment_token();
        Mock::given(method("POST"))
            .and(path("/Api/v1/CreatePayment"))
            .and(header("authorization", "Bearer tok"))
            .and(body_partial_json(serde_json::json!({ "orderId": "O1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": 202,
                "payment_token": { "token": token, "created": "2024-01-01" },
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let outcome = provider
            .create(&CreateIntent {
                amount: Decimal::from_str("100.00").unwrap(),
                currency: Currency::Htg,
                payment_reference: "pay_x".to_string(),
                order_id: Some("O1".to_string()),
                customer_email: None,
                customer_phone: None,
                description: None,
            })
            .await
            .expect("create succeeds");

        assert_eq!(outcome.provider_tx_id, "ABC");
        assert_eq!(outcome.provider_reference.as_deref(), Some("REF1"));
        let redirect = outcome.redirect_url.expect("redirect present");
        assert!(redirect.contains("/Moncash-middleware/Checkout/Payment/Redirect?token="));
        assert!(redirect.ends_with(&fake_payment_token()));
    }

    #[tokio::test]
    async fn usd_amounts_are_dispatched_in_gourdes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/Api/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok",
                "expires_in": 3600,
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/Api/v1/CreatePayment"))
            .and(body_partial_json(serde_json::json!({ "amount": 1400.0 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "payment_token": { "token": fake_payment_token() },
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        provider
            .create(&CreateIntent {
                amount: Decimal::from(10),
                currency: Currency::Usd,
                payment_reference: "pay_usd".to_string(),
                order_id: None,
                customer_email: None,
                customer_phone: None,
                description: None,
            })
            .await
            .expect("create succeeds");
    }

    #[test]
    fn callback_with_expected_shape_is_accepted() {
        let provider = MoncashProvider::new(
            reqwest::Client::new(),
            Arc::new(TokenCache::new(reqwest::Client::new())),
            MoncashConfig {
                client_id: "c".to_string(),
                client_secret: "s".to_string(),
                api_base: "https://example.test".parse().unwrap(),
                gateway_base: "https://example.test".parse().unwrap(),
            },
        );
        let body = br#"{"transactionId":"ABC","orderId":"O1","amount":100,"payer":"50937000000"}"#;
        let event = provider
            .verify_callback(body, &HeaderMap::new())
            .expect("valid callback")
            .expect("event present");
        assert_eq!(event.provider_tx_id, "ABC");
        assert!(matches!(
            event.kind,
            CallbackKind::Succeeded { payer: Some(ref p) } if p == "50937000000"
        ));
    }

    #[test]
    fn callback_without_transaction_id_is_rejected() {
        let provider = MoncashProvider::new(
            reqwest::Client::new(),
            Arc::new(TokenCache::new(reqwest::Client::new())),
            MoncashConfig {
                client_id: "c".to_string(),
                client_secret: "s".to_string(),
                api_base: "https://example.test".parse().unwrap(),
                gateway_base: "https://example.test".parse().unwrap(),
            },
        );
        let body = br#"{"orderId":"O1","amount":100}"#;
        let error = provider
            .verify_callback(body, &HeaderMap::new())
            .expect_err("must reject");
        assert!(matches!(error, ProviderError::InvalidCallback(_)));
    }

    #[test]
    fn callback_with_non_numeric_amount_is_rejected() {
        let provider = MoncashProvider::new(
            reqwest::Client::new(),
            Arc::new(TokenCache::new(reqwest::Client::new())),
            MoncashConfig {
                client_id: "c".to_string(),
                client_secret: "s".to_string(),
                api_base: "https://example.test".parse().unwrap(),
                gateway_base: "https://example.test".parse().unwrap(),
            },
        );
        let body = br#"{"transactionId":"ABC","orderId":"O1","amount":"100"}"#;
        assert!(provider.verify_callback(body, &HeaderMap::new()).is_err());
    }

    #[test]
    fn numeric_transaction_ids_are_stringified() {
        let claims = decode_payment_token(&{
            let payload = URL_SAFE_NO_PAD.encode(br#"{"id":123456,"ref":"R"}"#);
            format!("h.{payload}.s")
        })
        .expect("decodes");
        assert_eq!(claims.id, "123456");
    }
}
