//! HTTP surface of the gateway.
//!
//! Merchant-facing payment endpoints (create / read / list / refund), the
//! provider callback endpoints, and the public checkout read. Handlers stay
//! thin: parse and authenticate, delegate to [`PaymentFlows`] or the
//! [`Reconciler`], and render the stable response DTOs.
//!
//! The callback routes take the body as raw [`Bytes`], never through a JSON
//! extractor, because Stripe's signature covers the exact bytes received.

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Json, Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::AuthedMerchant;
use crate::cache::TtlCache;
use crate::error::{ApiError, ErrorCode};
use crate::lifecycle::{CreateParams, PaymentFlows};
use crate::reconcile::Reconciler;
use crate::store::Store;
use crate::store::payment::{Payment, PaymentFilter};
use crate::types::{Channel, Currency, PaymentStatus};
use crate::util::{decode_cursor, encode_cursor};

/// Cached create responses are replayed verbatim for this long.
pub const IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

/// Shared state handed to every handler.
pub struct AppState {
    pub store: Store,
    pub flows: PaymentFlows,
    pub reconciler: Reconciler,
    /// `idempotency:{key}` → serialized create response.
    pub idempotency: TtlCache<String, String>,
}

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/v1/payments", post(create_payment).get(list_payments))
        .route("/v1/payments/{reference}", get(get_payment))
        .route("/v1/payments/{reference}/refund", post(refund_payment))
        .route("/v1/webhooks/{channel}", post(provider_callback))
        .route("/v1/checkout/{reference}", get(get_checkout))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct CreatePaymentRequest {
    pub amount: Decimal,
    pub currency: Currency,
    pub channel: Channel,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub customer: Option<CustomerInfo>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct CustomerInfo {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    pub amount: Decimal,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub reference: String,
    pub order_id: Option<String>,
    pub channel: Channel,
    pub status: PaymentStatus,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub currency: Currency,
    #[serde(with = "rust_decimal::serde::float")]
    pub fee_rate: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub fee_amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub net_amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub refunded_amount: Decimal,
    pub provider_transaction_id: Option<String>,
    pub redirect_url: Option<String>,
    pub failure_reason: Option<String>,
    pub metadata: Option<Value>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl From<&Payment> for PaymentResponse {
    fn from(payment: &Payment) -> Self {
        Self {
            reference: payment.reference.clone(),
            order_id: payment.order_id.clone(),
            channel: payment.channel,
            status: payment.status,
            amount: payment.amount,
            currency: payment.currency,
            fee_rate: payment.fee_rate,
            fee_amount: payment.fee_amount,
            net_amount: payment.net_amount,
            refunded_amount: payment.refunded_amount,
            provider_transaction_id: payment.provider_transaction_id.clone(),
            redirect_url: payment.redirect_url.clone(),
            failure_reason: payment.failure_reason.clone(),
            metadata: payment.metadata.clone(),
            expires_at: payment.expires_at,
            created_at: payment.created_at,
            completed_at: payment.completed_at,
            failed_at: payment.failed_at,
        }
    }
}

/// Public subset served to the hosted checkout page.
#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub reference: String,
    pub channel: Channel,
    pub status: PaymentStatus,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub currency: Currency,
    pub order_id: Option<String>,
    pub redirect_url: Option<String>,
    pub expires_at: DateTime<Utc>,
}

async fn get_health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": env!("CARGO_PKG_NAME") }))
}

fn json_body_response(status: StatusCode, body: String) -> Response {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("static response parts are valid")
}

/// `POST /v1/payments`: idempotency-checked creation.
#[tracing::instrument(skip_all)]
async fn create_payment(
    State(state): State<Arc<AppState>>,
    merchant: AuthedMerchant,
    headers: HeaderMap,
    payload: Result<Json<CreatePaymentRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(|rejection| ApiError::validation(rejection.body_text()))?;

    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|value| value.to_str().ok())
        .filter(|key| !key.is_empty())
        .map(str::to_owned);
    if let Some(key) = &idempotency_key {
        let cache_key = format!("idempotency:{key}");
        if let Some(cached) = state.idempotency.get(&cache_key) {
            tracing::debug!("replaying cached create response");
            return Ok(json_body_response(StatusCode::CREATED, cached));
        }
    }

    // A free-standing description travels in the metadata bag so workers can
    // hand it to the processor later.
    let metadata = match (request.metadata, request.description) {
        (Some(Value::Object(mut map)), Some(description)) => {
            map.entry("description".to_string())
                .or_insert(Value::String(description));
            Some(Value::Object(map))
        }
        (Some(other), _) => Some(other),
        (None, Some(description)) => Some(json!({ "description": description })),
        (None, None) => None,
    };

    let customer = request.customer.unwrap_or(CustomerInfo {
        email: None,
        phone: None,
        name: None,
    });
    let payment = state
        .flows
        .create_payment(
            merchant.merchant_id,
            merchant.environment,
            CreateParams {
                channel: request.channel,
                amount: request.amount,
                currency: request.currency,
                order_id: request.order_id,
                customer_email: customer.email,
                customer_phone: customer.phone,
                customer_name: customer.name,
                metadata,
                idempotency_key: idempotency_key.clone(),
            },
        )
        .await?;

    let body = serde_json::to_string(&PaymentResponse::from(&payment))
        .map_err(|_| ApiError::internal())?;
    if let Some(key) = idempotency_key {
        state
            .idempotency
            .insert(format!("idempotency:{key}"), body.clone(), IDEMPOTENCY_TTL);
    }
    Ok(json_body_response(StatusCode::CREATED, body))
}

/// `GET /v1/payments/{reference}`: merchant-scoped read.
#[tracing::instrument(skip_all)]
async fn get_payment(
    State(state): State<Arc<AppState>>,
    merchant: AuthedMerchant,
    Path(reference): Path<String>,
) -> Result<Json<PaymentResponse>, ApiError> {
    let payment = state
        .store
        .payment_by_reference(merchant.merchant_id, &reference)
        .await?
        .ok_or_else(ApiError::payment_not_found)?;
    Ok(Json(PaymentResponse::from(&payment)))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    status: Option<PaymentStatus>,
    #[serde(default)]
    channel: Option<Channel>,
    #[serde(default)]
    from: Option<DateTime<Utc>>,
    #[serde(default)]
    to: Option<DateTime<Utc>>,
}

fn clamp_page_size(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

/// `GET /v1/payments`: descending-chronological page with filters.
#[tracing::instrument(skip_all)]
async fn list_payments(
    State(state): State<Arc<AppState>>,
    merchant: AuthedMerchant,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(query) = query.map_err(|rejection| ApiError::validation(rejection.body_text()))?;
    let before_id = match &query.cursor {
        Some(cursor) => Some(
            decode_cursor(cursor).ok_or_else(|| ApiError::validation("malformed cursor"))?,
        ),
        None => None,
    };
    let limit = clamp_page_size(query.limit);

    let mut payments = state
        .store
        .list_payments(
            merchant.merchant_id,
            &PaymentFilter {
                status: query.status,
                channel: query.channel,
                from: query.from,
                to: query.to,
                before_id,
                limit: limit + 1,
            },
        )
        .await?;

    let has_more = payments.len() as i64 > limit;
    payments.truncate(limit as usize);
    let next_cursor = if has_more {
        payments.last().map(|payment| encode_cursor(payment.id))
    } else {
        None
    };
    let data: Vec<PaymentResponse> = payments.iter().map(PaymentResponse::from).collect();
    Ok(Json(json!({
        "data": data,
        "pagination": { "has_more": has_more, "next_cursor": next_cursor },
    })))
}

/// `POST /v1/payments/{reference}/refund`.
#[tracing::instrument(skip_all)]
async fn refund_payment(
    State(state): State<Arc<AppState>>,
    merchant: AuthedMerchant,
    Path(reference): Path<String>,
    payload: Result<Json<RefundRequest>, JsonRejection>,
) -> Result<Json<PaymentResponse>, ApiError> {
    let Json(request) = payload.map_err(|rejection| ApiError::validation(rejection.body_text()))?;
    let payment = state
        .flows
        .refund(
            merchant.merchant_id,
            &reference,
            request.amount,
            request.reason.as_deref(),
        )
        .await?;
    Ok(Json(PaymentResponse::from(&payment)))
}

/// `POST /v1/webhooks/{channel}`: provider callback ingress.
///
/// Body arrives as raw bytes; rate limiting is deliberately absent here.
#[tracing::instrument(skip_all)]
async fn provider_callback(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    headers: HeaderMap,
    raw_body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let channel: Channel = channel
        .parse()
        .map_err(|_| ApiError::new(ErrorCode::ValidationError, "unknown callback channel"))?;
    state
        .reconciler
        .handle_callback(channel, &headers, &raw_body)
        .await?;
    Ok(Json(json!({ "received": true })))
}

/// `GET /v1/checkout/{reference}`: unauthenticated read for the hosted page.
#[tracing::instrument(skip_all)]
async fn get_checkout(
    State(state): State<Arc<AppState>>,
    Path(reference): Path<String>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let payment = state
        .store
        .payment_by_reference_any(&reference)
        .await?
        .ok_or_else(ApiError::payment_not_found)?;
    let window_closed = payment.status == PaymentStatus::Expired
        || (payment.status == PaymentStatus::Pending && payment.expires_at < Utc::now());
    if window_closed {
        return Err(ApiError::new(
            ErrorCode::PaymentExpired,
            "This payment is no longer payable",
        ));
    }
    Ok(Json(CheckoutResponse {
        reference: payment.reference,
        channel: payment.channel,
        status: payment.status,
        amount: payment.amount,
        currency: payment.currency,
        order_id: payment.order_id,
        redirect_url: payment.redirect_url,
        expires_at: payment.expires_at,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_clamped() {
        assert_eq!(clamp_page_size(None), 20);
        assert_eq!(clamp_page_size(Some(0)), 1);
        assert_eq!(clamp_page_size(Some(50)), 50);
        assert_eq!(clamp_page_size(Some(10_000)), 100);
    }

    #[test]
    fn create_request_accepts_numeric_and_string_amounts() {
        let numeric: CreatePaymentRequest = serde_json::from_str(
            r#"{"amount": 100.0, "currency": "HTG", "channel": "moncash", "order_id": "O1"}"#,
        )
        .unwrap();
        assert_eq!(numeric.amount.to_string(), "100");

        let string: CreatePaymentRequest = serde_json::from_str(
            r#"{"amount": "250.75", "currency": "USD", "channel": "stripe"}"#,
        )
        .unwrap();
        assert_eq!(string.amount.to_string(), "250.75");
        assert_eq!(string.channel, Channel::Stripe);
    }

    #[test]
    fn unknown_channel_fails_deserialization() {
        let result: Result<CreatePaymentRequest, _> = serde_json::from_str(
            r#"{"amount": 10, "currency": "USD", "channel": "paypal"}"#,
        );
        assert!(result.is_err());
    }
}
