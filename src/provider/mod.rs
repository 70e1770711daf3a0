//! Provider adapters.
//!
//! Each supported processor implements [`PaymentProvider`], translating the
//! gateway's create/status/refund operations into the processor's own
//! protocol and normalizing inbound callbacks into [`CallbackEvent`]s. The
//! [`ProviderRegistry`] owns one adapter per configured channel; channels
//! without credentials are absent and surface as `NotConfigured`.
//!
//! Adapter failures are deliberately coarse: the queue retries anything an
//! adapter returns, so the taxonomy only distinguishes what the API needs to
//! report (`timeout` / `unavailable` / everything else).

pub mod moncash;
pub mod natcash;
pub mod stripe;
pub mod token;

use async_trait::async_trait;
use axum::http::HeaderMap;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::types::{Channel, Currency};
use token::TokenCache;

/// Timeout applied to every provider API call.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors an adapter can produce. Everything except `Unsupported` is
/// retryable from a queue worker's point of view.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// No credentials were configured for this channel.
    #[error("{0} is not configured")]
    NotConfigured(Channel),
    /// The processor did not answer within the call timeout.
    #[error("{channel} timed out")]
    Timeout { channel: Channel },
    /// The processor answered with a failure.
    #[error("{channel} request failed{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Remote {
        channel: Channel,
        status: Option<u16>,
        message: String,
    },
    /// The processor answered 2xx but the body was not what the protocol
    /// promises.
    #[error("{channel} returned an unusable response: {message}")]
    Malformed { channel: Channel, message: String },
    /// The processor has no remote equivalent of this operation.
    #[error("{channel} does not support {operation}")]
    Unsupported {
        channel: Channel,
        operation: &'static str,
    },
    /// An inbound callback failed authentication or did not parse.
    #[error("callback rejected: {0}")]
    InvalidCallback(String),
}

impl ProviderError {
    /// Classify a reqwest transport error.
    pub fn from_transport(channel: Channel, error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ProviderError::Timeout { channel }
        } else {
            ProviderError::Remote {
                channel,
                status: error.status().map(|s| s.as_u16()),
                message: error.to_string(),
            }
        }
    }
}

/// What the gateway asks a processor to collect.
#[derive(Debug, Clone)]
pub struct CreateIntent {
    pub amount: Decimal,
    pub currency: Currency,
    pub payment_reference: String,
    pub order_id: Option<String>,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub description: Option<String>,
}

/// The processor's answer to a create call.
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    /// The processor's own handle for the payment; callbacks correlate on it.
    pub provider_tx_id: String,
    /// Hosted page the customer is sent to, when the processor has one.
    pub redirect_url: Option<String>,
    /// Secondary processor-issued reference (MonCash `ref`, Stripe client
    /// secret), kept for support tooling.
    pub provider_reference: Option<String>,
}

/// Normalized processor-side payment state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct StatusOutcome {
    pub state: RemoteState,
    pub payer: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RefundOutcome {
    pub refund_id: String,
    pub state: String,
}

/// A callback the adapter has authenticated and normalized.
#[derive(Debug, Clone)]
pub struct CallbackEvent {
    pub provider_tx_id: String,
    pub kind: CallbackKind,
}

#[derive(Debug, Clone)]
pub enum CallbackKind {
    Succeeded { payer: Option<String> },
    Failed { reason: Option<String> },
    Cancelled,
    /// Cumulative refunded amount reported by the processor, in the
    /// payment's currency.
    Refunded { total_refunded: Decimal },
}

/// One payment processor behind the gateway.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn channel(&self) -> Channel;

    /// Initiate collection of `intent` and return the processor's handle.
    async fn create(&self, intent: &CreateIntent) -> Result<CreateOutcome, ProviderError>;

    /// Query the processor for the current state of a payment.
    async fn status(&self, provider_tx_id: &str) -> Result<StatusOutcome, ProviderError>;

    /// Ask the processor to return money to the payer.
    async fn refund(
        &self,
        provider_tx_id: &str,
        amount: Decimal,
        currency: Currency,
    ) -> Result<RefundOutcome, ProviderError>;

    /// Authenticate a raw callback body and normalize it.
    ///
    /// `Ok(None)` means the callback is authentic but carries no event the
    /// gateway acts on (e.g. an intermediate state). Authentication failures
    /// are [`ProviderError::InvalidCallback`] and must be reported before any
    /// state change.
    fn verify_callback(
        &self,
        raw_body: &[u8],
        headers: &HeaderMap,
    ) -> Result<Option<CallbackEvent>, ProviderError>;
}

/// The set of adapters built from configuration at startup.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: HashMap<Channel, Arc<dyn PaymentProvider>>,
}

impl ProviderRegistry {
    /// Build adapters for every channel whose credentials are configured.
    pub fn from_config(config: &Config, http: reqwest::Client, tokens: Arc<TokenCache>) -> Self {
        let mut providers: HashMap<Channel, Arc<dyn PaymentProvider>> = HashMap::new();
        if let Some(moncash) = &config.moncash {
            providers.insert(
                Channel::Moncash,
                Arc::new(moncash::MoncashProvider::new(
                    http.clone(),
                    tokens.clone(),
                    moncash.clone(),
                )),
            );
        }
        if let Some(natcash) = &config.natcash {
            providers.insert(
                Channel::Natcash,
                Arc::new(natcash::NatcashProvider::new(
                    http.clone(),
                    tokens.clone(),
                    natcash.clone(),
                )),
            );
        }
        if let Some(stripe) = &config.stripe {
            providers.insert(
                Channel::Stripe,
                Arc::new(stripe::StripeProvider::new(http, stripe.clone())),
            );
        }
        for channel in Channel::ALL {
            if providers.contains_key(&channel) {
                tracing::info!(%channel, "provider adapter registered");
            } else {
                tracing::warn!(%channel, "no credentials configured (channel disabled)");
            }
        }
        Self { providers }
    }

    pub fn by_channel(&self, channel: Channel) -> Result<&Arc<dyn PaymentProvider>, ProviderError> {
        self.providers
            .get(&channel)
            .ok_or(ProviderError::NotConfigured(channel))
    }
}

/// Snip a response body down to something loggable.
pub(crate) fn snippet(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &body[..end])
    }
}
