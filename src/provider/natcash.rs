//! NatCash (Natcom) adapter.
//!
//! NatCash follows the same OAuth2 client-credentials flow as MonCash but
//! expects the gateway's callback URL on every create call and reports state
//! with a coarse `SUCCESS | PENDING | FAILED | CANCELLED` enum. `CANCELLED`
//! is folded into `failed`: the processor treats payer abandonment and
//! decline identically and so do we.

use async_trait::async_trait;
use axum::http::HeaderMap;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::config::NatcashConfig;
use crate::money;
use crate::provider::token::{OauthEndpoint, TokenCache};
use crate::provider::{
    CALL_TIMEOUT, CallbackEvent, CallbackKind, CreateIntent, CreateOutcome, PaymentProvider,
    ProviderError, RefundOutcome, RemoteState, StatusOutcome, snippet,
};
use crate::types::{Channel, Currency};

pub struct NatcashProvider {
    http: reqwest::Client,
    tokens: Arc<TokenCache>,
    config: NatcashConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateResponse {
    transaction_id: String,
    #[serde(default)]
    redirect_url: Option<String>,
    #[serde(default)]
    reference: Option<String>,
}

fn map_remote_status(raw: &str) -> Option<RemoteState> {
    match raw {
        "SUCCESS" => Some(RemoteState::Completed),
        "PENDING" => Some(RemoteState::Pending),
        // The processor does not distinguish payer abandonment from decline.
        "FAILED" | "CANCELLED" => Some(RemoteState::Failed),
        _ => None,
    }
}

impl NatcashProvider {
    pub fn new(http: reqwest::Client, tokens: Arc<TokenCache>, config: NatcashConfig) -> Self {
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
                .endpoint("/oauth/token")
                .parse()
                .expect("base url + fixed path is a valid url"),
            client_id: self.config.client_id.clone(),
            client_secret: self.config.client_secret.clone(),
        }
    }
}

#[async_trait]
impl PaymentProvider for NatcashProvider {
    fn channel(&self) -> Channel {
        Channel::Natcash
    }

    #[tracing::instrument(skip_all, fields(payment = %intent.payment_reference))]
    async fn create(&self, intent: &CreateIntent) -> Result<CreateOutcome, ProviderError> {
        let token = self.tokens.bearer_token(Channel::Natcash, &self.oauth()).await?;
        let amount_htg = money::to_htg(intent.amount, intent.currency);
        let order_id = intent
            .order_id
            .clone()
            .unwrap_or_else(|| intent.payment_reference.clone());

        let response = self
            .http
            .post(self.endpoint("/api/v1/payment/create"))
            .bearer_auth(&token)
            .json(&json!({
                "amount": amount_htg.to_f64(),
                "orderId": order_id,
                "callbackUrl": self.config.callback_url.as_str(),
            }))
            .timeout(CALL_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(Channel::Natcash, e))?;

        let status = response.status();
        if !status.is_success() {
            if status == reqwest::StatusCode::UNAUTHORIZED {
                self.tokens.invalidate(Channel::Natcash);
            }
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Remote {
                channel: Channel::Natcash,
                status: Some(status.as_u16()),
                message: snippet(&body),
            });
        }

        let body: CreateResponse = response.json().await.map_err(|e| ProviderError::Malformed {
            channel: Channel::Natcash,
            message: format!("create response: {e}"),
        })?;
        Ok(CreateOutcome {
            provider_tx_id: body.transaction_id,
            redirect_url: body.redirect_url,
            provider_reference: body.reference,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn status(&self, provider_tx_id: &str) -> Result<StatusOutcome, ProviderError> {
        let token = self.tokens.bearer_token(Channel::Natcash, &self.oauth()).await?;
        let response = self
            .http
            .get(self.endpoint(&format!("/api/v1/payment/{provider_tx_id}")))
            .bearer_auth(&token)
            .timeout(CALL_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(Channel::Natcash, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Remote {
                channel: Channel::Natcash,
                status: Some(status.as_u16()),
                message: snippet(&body),
            });
        }

        let body: Value = response.json().await.map_err(|e| ProviderError::Malformed {
            channel: Channel::Natcash,
            message: format!("status response: {e}"),
        })?;
        let raw = body.get("status").and_then(Value::as_str).unwrap_or_default();
        let state = map_remote_status(raw).ok_or_else(|| ProviderError::Malformed {
            channel: Channel::Natcash,
            message: format!("unknown status {raw:?}"),
        })?;
        Ok(StatusOutcome {
            state,
            payer: body.get("payer").and_then(Value::as_str).map(str::to_owned),
        })
    }

    async fn refund(
        &self,
        _provider_tx_id: &str,
        _amount: Decimal,
        _currency: Currency,
    ) -> Result<RefundOutcome, ProviderError> {
        // NatCash exposes no merchant-initiated refund API.
        Err(ProviderError::Unsupported {
            channel: Channel::Natcash,
            operation: "refund",
        })
    }

    /// NatCash callbacks are unsigned JSON carrying `transactionId` and a
    /// status from the processor enum. An unknown status is rejected; a
    /// `PENDING` status is authentic but not actionable.
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
        let raw_status = body
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::InvalidCallback("missing status".to_string()))?;
        let state = map_remote_status(raw_status).ok_or_else(|| {
            ProviderError::InvalidCallback(format!("unknown status {raw_status:?}"))
        })?;

        let payer = body.get("payer").and_then(Value::as_str).map(str::to_owned);
        let kind = match state {
            RemoteState::Completed => CallbackKind::Succeeded { payer },
            RemoteState::Failed => CallbackKind::Failed {
                reason: Some(raw_status.to_string()),
            },
            RemoteState::Cancelled => CallbackKind::Cancelled,
            RemoteState::Pending => return Ok(None),
        };
        Ok(Some(CallbackEvent {
            provider_tx_id,
            kind,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(server: &MockServer) -> NatcashProvider {
        NatcashProvider::new(
            reqwest::Client::new(),
            Arc::new(TokenCache::new(reqwest::Client::new())),
            NatcashConfig {
                client_id: "client".to_string(),
                client_secret: "secret".to_string(),
                api_base: server.uri().parse().unwrap(),
                callback_url: "https://gateway.test/v1/webhooks/natcash".parse().unwrap(),
            },
        )
    }

    #[tokio::test]
    async fn create_forwards_the_callback_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok",
                "expires_in": 900,
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/payment/create"))
            .and(body_partial_json(json!({
                "callbackUrl": "https://gateway.test/v1/webhooks/natcash",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "transactionId": "NC-1",
                "redirectUrl": "https://pay.natcash.test/NC-1",
                "reference": "R-1",
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let outcome = provider
            .create(&CreateIntent {
                amount: Decimal::from_str("250.00").unwrap(),
                currency: Currency::Htg,
                payment_reference: "pay_n".to_string(),
                order_id: Some("O9".to_string()),
                customer_email: None,
                customer_phone: None,
                description: None,
            })
            .await
            .expect("create succeeds");
        assert_eq!(outcome.provider_tx_id, "NC-1");
        assert_eq!(
            outcome.redirect_url.as_deref(),
            Some("https://pay.natcash.test/NC-1")
        );
    }

    #[test]
    fn status_enum_mapping() {
        assert_eq!(map_remote_status("SUCCESS"), Some(RemoteState::Completed));
        assert_eq!(map_remote_status("PENDING"), Some(RemoteState::Pending));
        assert_eq!(map_remote_status("FAILED"), Some(RemoteState::Failed));
        assert_eq!(map_remote_status("CANCELLED"), Some(RemoteState::Failed));
        assert_eq!(map_remote_status("???"), None);
    }

    #[test]
    fn success_callback_normalizes_to_succeeded() {
        let server_config = NatcashConfig {
            client_id: "c".to_string(),
            client_secret: "s".to_string(),
            api_base: "https://example.test".parse().unwrap(),
            callback_url: "https://gateway.test/cb".parse().unwrap(),
        };
        let provider = NatcashProvider::new(
            reqwest::Client::new(),
            Arc::new(TokenCache::new(reqwest::Client::new())),
            server_config,
        );
        let body = br#"{"transactionId":"NC-2","status":"SUCCESS","payer":"50941112222"}"#;
        let event = provider
            .verify_callback(body, &HeaderMap::new())
            .expect("authentic")
            .expect("actionable");
        assert!(matches!(event.kind, CallbackKind::Succeeded { .. }));

        let pending = br#"{"transactionId":"NC-2","status":"PENDING"}"#;
        assert!(
            provider
                .verify_callback(pending, &HeaderMap::new())
                .expect("authentic")
                .is_none()
        );

        let unknown = br#"{"transactionId":"NC-2","status":"HOLD"}"#;
        assert!(provider.verify_callback(unknown, &HeaderMap::new()).is_err());
    }
}
