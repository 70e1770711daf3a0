//! Outbound merchant notifications.
//!
//! The [`EventBus`] is the only seam between the state machine and delivery:
//! a transition publishes `(payment, event)` to the bus inside its own
//! transaction, the bus fans out to every subscribed webhook config
//! (inserting the audit log row and the delivery job atomically with the
//! transition), and the [`DeliveryWorker`] drains the webhook queue with no
//! knowledge of where events come from.
//!
//! Deliveries are signed the same way Stripe signs ours:
//! `DheCash-Signature: t=<unix_ts>,v1=<hex hmac-sha256("{t}.{body}")>`.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sqlx::PgConnection;
use std::time::Duration;

use crate::queue::runner::{JobError, JobHandler};
use crate::queue::{Job, WEBHOOK_RETRY, WEBHOOKS, enqueue_in_tx};
use crate::store::payment::Payment;
use crate::store::webhook;
use crate::store::Store;
use crate::types::{DeliveryStatus, EventType};
use crate::util::truncate_chars;

type HmacSha256 = Hmac<Sha256>;

/// Fixed identification on every outbound delivery.
pub const WEBHOOK_USER_AGENT: &str = "DheCash-Webhooks/1.0";
/// Outbound POST timeout.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);
/// Stored response bodies are capped to this many characters.
pub const RESPONSE_SNIPPET_CHARS: usize = 500;

/// The envelope merchants receive.
#[derive(Debug, Serialize)]
pub struct Envelope {
    pub api_version: &'static str,
    pub event_type: EventType,
    pub created_at: DateTime<Utc>,
    pub data: EnvelopeData,
}

#[derive(Debug, Serialize)]
pub struct EnvelopeData {
    pub payment_ref: String,
    pub order_id: Option<String>,
    pub channel: crate::types::Channel,
    pub status: crate::types::PaymentStatus,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub currency: crate::types::Currency,
    #[serde(with = "rust_decimal::serde::float")]
    pub fee_amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub net_amount: Decimal,
    pub provider_transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

/// Build the payload snapshot stored on the log row and delivered verbatim.
pub fn build_envelope(payment: &Payment, event: EventType, now: DateTime<Utc>) -> Envelope {
    Envelope {
        api_version: "1.0",
        event_type: event,
        created_at: now,
        data: EnvelopeData {
            payment_ref: payment.reference.clone(),
            order_id: payment.order_id.clone(),
            channel: payment.channel,
            status: payment.status,
            amount: payment.amount,
            currency: payment.currency,
            fee_amount: payment.fee_amount,
            net_amount: payment.net_amount,
            provider_transaction_id: payment.provider_transaction_id.clone(),
            created_at: payment.created_at,
            completed_at: payment.completed_at,
            failed_at: payment.failed_at,
            failure_reason: payment.failure_reason.clone(),
        },
    }
}

/// `t=<ts>,v1=<hex hmac>` over `"{ts}.{body}"` keyed by the config secret.
pub fn signature_header(secret: &str, timestamp: i64, body: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

/// Job payload for one delivery. Carries the log id so concurrent deliveries
/// of the same event never race on a recency lookup.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub log_id: i64,
    pub webhook_config_id: i64,
    pub event_type: String,
}

/// The narrow seam between state transitions and delivery.
#[derive(Clone)]
pub struct EventBus;

impl EventBus {
    /// Fan `(payment, event)` out to every active subscribed config.
    ///
    /// Runs inside the caller's transaction: log rows and delivery jobs
    /// commit atomically with the state change that produced the event.
    #[tracing::instrument(skip_all, fields(payment = %payment.reference, event = %event))]
    pub async fn publish(
        &self,
        conn: &mut PgConnection,
        payment: &Payment,
        event: EventType,
    ) -> sqlx::Result<usize> {
        let configs =
            webhook::active_configs_for_event(&mut *conn, payment.merchant_id, event).await?;
        if configs.is_empty() {
            return Ok(0);
        }
        let envelope = build_envelope(payment, event, Utc::now());
        let payload =
            serde_json::to_value(&envelope).expect("envelope serialization is infallible");
        let fanout = configs.len();
        for config in configs {
            let log = webhook::insert_log(&mut *conn, config.id, payment.id, event, &payload).await?;
            enqueue_in_tx(
                &mut *conn,
                WEBHOOKS,
                &DeliveryJob {
                    log_id: log.id,
                    webhook_config_id: config.id,
                    event_type: event.as_str().to_string(),
                },
                WEBHOOK_RETRY,
            )
            .await?;
        }
        tracing::debug!(fanout, "notifications queued");
        Ok(fanout)
    }
}

/// Drains `notifications.webhooks`: signs, posts, records every attempt.
pub struct DeliveryWorker {
    store: Store,
    http: reqwest::Client,
    /// Used when a config was created without its own secret.
    fallback_secret: Option<String>,
}

impl DeliveryWorker {
    pub fn new(store: Store, http: reqwest::Client, fallback_secret: Option<String>) -> Self {
        Self {
            store,
            http,
            fallback_secret,
        }
    }
}

#[async_trait::async_trait]
impl JobHandler for DeliveryWorker {
    async fn run(&self, job: &Job) -> Result<(), JobError> {
        let delivery: DeliveryJob = serde_json::from_value(job.payload.clone())?;
        let Some(log) = self.store.webhook_log(delivery.log_id).await? else {
            tracing::warn!(log_id = delivery.log_id, "log row vanished, dropping delivery");
            return Ok(());
        };
        if log.status == DeliveryStatus::Delivered {
            return Ok(());
        }
        let Some(config) = self.store.webhook_config(log.webhook_config_id).await? else {
            tracing::warn!(config_id = log.webhook_config_id, "config vanished, dropping delivery");
            self.store.finalize_delivery_failed(log.id).await?;
            return Ok(());
        };

        let body = serde_json::to_string(&log.payload)?;
        let timestamp = Utc::now().timestamp();
        let secret = if config.secret.is_empty() {
            self.fallback_secret.clone().unwrap_or_default()
        } else {
            config.secret.clone()
        };
        let signature = signature_header(&secret, timestamp, &body);

        let result = self
            .http
            .post(&config.url)
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, WEBHOOK_USER_AGENT)
            .header("DheCash-Signature", signature)
            .header("DheCash-Event-Type", log.event_type.clone())
            .header("DheCash-Timestamp", timestamp.to_string())
            .body(body)
            .timeout(DELIVERY_TIMEOUT)
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                let snippet = truncate_chars(&text, RESPONSE_SNIPPET_CHARS);
                let delivered = status.is_success();
                self.store
                    .record_delivery_attempt(
                        log.id,
                        job.attempts,
                        Some(status.as_u16() as i32),
                        Some(&snippet),
                        delivered,
                    )
                    .await?;
                if delivered {
                    tracing::info!(log_id = log.id, url = %config.url, %status, "delivered");
                    Ok(())
                } else {
                    Err(JobError::new(format!("target answered {status}")))
                }
            }
            Err(error) => {
                let message = truncate_chars(&error.to_string(), RESPONSE_SNIPPET_CHARS);
                self.store
                    .record_delivery_attempt(log.id, job.attempts, None, Some(&message), false)
                    .await?;
                Err(JobError::new(format!("transport: {message}")))
            }
        }
    }

    async fn exhausted(&self, job: &Job, _error: &JobError) {
        let Ok(delivery) = serde_json::from_value::<DeliveryJob>(job.payload.clone()) else {
            return;
        };
        if let Err(error) = self.store.finalize_delivery_failed(delivery.log_id).await {
            tracing::error!(log_id = delivery.log_id, %error, "failed to finalize log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Channel, Currency, Environment, PaymentStatus};
    use std::str::FromStr;

    fn sample_payment() -> Payment {
        let now = Utc::now();
        Payment {
            id: 7,
            reference: "pay_abc123".to_string(),
            merchant_id: 1,
            environment: Environment::Test,
            channel: Channel::Moncash,
            status: PaymentStatus::Completed,
            amount: Decimal::from_str("100.00").unwrap(),
            currency: Currency::Htg,
            fee_rate: Decimal::from_str("0.025").unwrap(),
            fee_amount: Decimal::from_str("2.50").unwrap(),
            net_amount: Decimal::from_str("97.50").unwrap(),
            refunded_amount: Decimal::ZERO,
            provider_transaction_id: Some("ABC".to_string()),
            provider_reference: None,
            redirect_url: None,
            idempotency_key: None,
            order_id: Some("O1".to_string()),
            customer_email: None,
            customer_phone: None,
            customer_name: None,
            customer_id: None,
            metadata: None,
            failure_reason: None,
            expires_at: now,
            created_at: now,
            updated_at: now,
            completed_at: Some(now),
            failed_at: None,
        }
    }

    #[test]
    fn envelope_serializes_amounts_as_numbers() {
        let envelope = build_envelope(&sample_payment(), EventType::PaymentSucceeded, Utc::now());
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["api_version"], "1.0");
        assert_eq!(value["event_type"], "payment.succeeded");
        assert!(value["data"]["amount"].is_number());
        assert_eq!(value["data"]["amount"], serde_json::json!(100.0));
        assert_eq!(value["data"]["fee_amount"], serde_json::json!(2.5));
        assert_eq!(value["data"]["net_amount"], serde_json::json!(97.5));
        assert_eq!(value["data"]["payment_ref"], "pay_abc123");
        assert_eq!(value["data"]["channel"], "moncash");
        assert_eq!(value["data"]["provider_transaction_id"], "ABC");
    }

    #[test]
    fn signature_header_round_trips_against_its_own_hmac() {
        let body = r#"{"hello":"world"}"#;
        let header = signature_header("whsec_abc", 1700000000, body);
        let (prefix, digest) = header.split_once(",v1=").unwrap();
        assert_eq!(prefix, "t=1700000000");

        let mut mac = HmacSha256::new_from_slice(b"whsec_abc").unwrap();
        mac.update(b"1700000000");
        mac.update(b".");
        mac.update(body.as_bytes());
        mac.verify_slice(&hex::decode(digest).unwrap())
            .expect("digest matches");
    }

    #[test]
    fn different_secrets_produce_different_signatures() {
        let body = "{}";
        assert_ne!(
            signature_header("secret-a", 1, body),
            signature_header("secret-b", 1, body)
        );
    }
}
