//! Inbound callback reconciliation.
//!
//! One entry point serves all three processors: authenticate the raw body
//! through the channel's adapter, correlate on the provider transaction id,
//! and drive the ordinary state machine transitions. Authenticity failures
//! are the only 4xx; everything after verification answers 200, including
//! events for handles the gateway has never seen, so processors do not
//! retry forever against us.

use axum::http::HeaderMap;

use crate::error::ApiError;
use crate::lifecycle::PaymentFlows;
use crate::provider::{CallbackKind, ProviderError, ProviderRegistry};
use crate::store::Store;
use crate::types::Channel;

#[derive(Clone)]
pub struct Reconciler {
    registry: ProviderRegistry,
    store: Store,
    flows: PaymentFlows,
}

impl Reconciler {
    pub fn new(registry: ProviderRegistry, store: Store, flows: PaymentFlows) -> Self {
        Self {
            registry,
            store,
            flows,
        }
    }

    /// Process one provider callback. Succeeds (HTTP 200) unless the body
    /// fails authentication or the channel is unconfigured.
    #[tracing::instrument(skip_all, fields(%channel))]
    pub async fn handle_callback(
        &self,
        channel: Channel,
        headers: &HeaderMap,
        raw_body: &[u8],
    ) -> Result<(), ApiError> {
        let provider = self.registry.by_channel(channel)?;
        let event = provider
            .verify_callback(raw_body, headers)
            .map_err(|error| match error {
                ProviderError::InvalidCallback(message) => {
                    tracing::warn!(%message, "callback rejected");
                    ApiError::validation(message)
                }
                other => other.into(),
            })?;
        let Some(event) = event else {
            tracing::debug!("authentic callback with nothing to apply");
            return Ok(());
        };

        let payment = self
            .store
            .payment_by_provider_tx(channel, &event.provider_tx_id)
            .await?;
        let Some(payment) = payment else {
            // Known trade-off: answering 200 for unknown handles stops the
            // processor from retrying an event we will never match.
            tracing::warn!(
                provider_tx = %event.provider_tx_id,
                "callback for unknown provider transaction"
            );
            return Ok(());
        };

        match event.kind {
            CallbackKind::Succeeded { payer } => {
                self.flows.complete_payment(payment.id, payer).await?;
            }
            CallbackKind::Failed { reason } => {
                let reason = reason.unwrap_or_else(|| "reported failed by processor".to_string());
                self.flows.fail_payment(payment.id, &reason).await?;
            }
            CallbackKind::Cancelled => {
                self.flows.cancel_payment(payment.id).await?;
            }
            CallbackKind::Refunded { total_refunded } => {
                self.flows
                    .apply_remote_refund(payment.id, total_refunded)
                    .await?;
            }
        }
        Ok(())
    }
}
