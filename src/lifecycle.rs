//! Payment lifecycle: creation, dispatch, transitions, refunds, sweeps.
//!
//! Every transition follows the same shape: re-read the row under a lock,
//! no-op if the payment is already at (or past) the target, reject edges the
//! graph does not contain, and commit the status change atomically with its
//! dependent writes (ledger row, customer upsert, outbound notifications).
//! That idempotence is what makes at-least-once job delivery and replayed
//! provider callbacks safe.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::{ApiError, ErrorCode};
use crate::money;
use crate::notify::EventBus;
use crate::provider::{CreateIntent, ProviderError, ProviderRegistry, RemoteState};
use crate::queue::runner::{JobError, JobHandler};
use crate::queue::{Job, JobQueue, PAYMENT_RETRY, enqueue_in_tx};
use crate::reference;
use crate::store::payment::{self, NewPayment, Payment};
use crate::store::{Store, customer, ledger};
use crate::types::{Channel, Currency, EventType, Environment, LedgerKind, PaymentStatus};

/// Payments not dispatched within this window expire.
pub const EXPIRY_MINUTES: i64 = 30;

/// What the create endpoint hands to the flows layer.
#[derive(Debug, Clone)]
pub struct CreateParams {
    pub channel: Channel,
    pub amount: Decimal,
    pub currency: Currency,
    pub order_id: Option<String>,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub customer_name: Option<String>,
    pub metadata: Option<Value>,
    pub idempotency_key: Option<String>,
}

/// Result of applying one transition.
#[derive(Debug)]
pub enum TransitionOutcome {
    Applied(Payment),
    /// The payment was already at (or past) the target, or the edge does not
    /// exist from the observed state. Either way the caller reports success.
    NoOp(PaymentStatus),
}

/// Dispatch job payload: everything else is re-read from the payment row so
/// redeliveries always observe current state.
#[derive(Debug, Serialize, Deserialize)]
pub struct DispatchJob {
    pub payment_reference: String,
}

/// Validate the money side of a create request.
fn validate_amount(amount: Decimal, currency: Currency, channel: Channel) -> Result<(), ApiError> {
    if amount <= Decimal::ZERO {
        return Err(ApiError::validation("amount must be positive"));
    }
    if amount.scale() > 2 {
        return Err(ApiError::validation("amount precision is limited to 2 decimal places"));
    }
    let minimum = money::channel_minimum(channel, currency);
    if amount < minimum {
        return Err(ApiError::validation(format!(
            "amount is below the {channel} minimum of {minimum} {currency}"
        )));
    }
    Ok(())
}

/// Status a refund leaves the payment in.
fn refund_target(new_total: Decimal, gross: Decimal) -> PaymentStatus {
    if new_total == gross {
        PaymentStatus::Refunded
    } else {
        PaymentStatus::PartiallyRefunded
    }
}

/// Orchestrates every state change a payment can go through.
#[derive(Clone)]
pub struct PaymentFlows {
    store: Store,
    queue: JobQueue,
    registry: ProviderRegistry,
    bus: EventBus,
}

impl PaymentFlows {
    pub fn new(store: Store, queue: JobQueue, registry: ProviderRegistry, bus: EventBus) -> Self {
        Self {
            store,
            queue,
            registry,
            bus,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Validate, insert in `pending`, and enqueue dispatch, all in one transaction.
    #[tracing::instrument(skip_all, fields(merchant = merchant_id, channel = %params.channel))]
    pub async fn create_payment(
        &self,
        merchant_id: i64,
        environment: Environment,
        params: CreateParams,
    ) -> Result<Payment, ApiError> {
        // Fail fast before anything is written: a channel without
        // credentials can never dispatch.
        self.registry.by_channel(params.channel)?;
        validate_amount(params.amount, params.currency, params.channel)?;

        let fee_rate = money::fee_rate(params.channel);
        let fee_amount = money::fee_amount(params.amount, fee_rate);
        let new = NewPayment {
            reference: reference::payment_reference(),
            merchant_id,
            environment,
            channel: params.channel,
            amount: params.amount,
            currency: params.currency,
            fee_rate,
            fee_amount,
            net_amount: params.amount - fee_amount,
            idempotency_key: params.idempotency_key,
            order_id: params.order_id,
            customer_email: params.customer_email,
            customer_phone: params.customer_phone,
            customer_name: params.customer_name,
            metadata: params.metadata,
            expires_at: Utc::now() + ChronoDuration::minutes(EXPIRY_MINUTES),
        };

        let mut tx = self.store.begin().await?;
        let payment = payment::insert(&mut tx, &new).await?;
        enqueue_in_tx(
            &mut tx,
            params.channel.queue_name(),
            &DispatchJob {
                payment_reference: payment.reference.clone(),
            },
            PAYMENT_RETRY,
        )
        .await?;
        tx.commit().await?;

        tracing::info!(reference = %payment.reference, "payment created");
        Ok(payment)
    }

    /// Worker half of creation: call the provider and move to `processing`.
    pub async fn dispatch(&self, payment_reference: &str) -> Result<(), JobError> {
        let Some(payment) = self.store.payment_by_reference_any(payment_reference).await? else {
            tracing::warn!(reference = payment_reference, "dispatch for unknown payment");
            return Ok(());
        };
        if payment.status != PaymentStatus::Pending {
            // Redelivered job; the earlier run already got through.
            return Ok(());
        }

        let provider = self.registry.by_channel(payment.channel)?;
        let intent = CreateIntent {
            amount: payment.amount,
            currency: payment.currency,
            payment_reference: payment.reference.clone(),
            order_id: payment.order_id.clone(),
            customer_email: payment.customer_email.clone(),
            customer_phone: payment.customer_phone.clone(),
            description: payment
                .metadata
                .as_ref()
                .and_then(|m| m.get("description"))
                .and_then(Value::as_str)
                .map(str::to_owned),
        };
        let outcome = provider.create(&intent).await?;

        let updated = self
            .store
            .mark_processing(
                payment.id,
                &outcome.provider_tx_id,
                outcome.redirect_url.as_deref(),
                outcome.provider_reference.as_deref(),
            )
            .await?;
        match updated {
            Some(_) => {
                tracing::info!(
                    reference = %payment.reference,
                    provider_tx = %outcome.provider_tx_id,
                    "payment dispatched"
                );
            }
            None => {
                tracing::warn!(reference = %payment.reference, "payment left pending state mid-dispatch");
            }
        }
        Ok(())
    }

    /// `processing → completed`, with the credit ledger row, customer
    /// roll-up, and merchant notifications in the same transaction.
    #[tracing::instrument(skip(self))]
    pub async fn complete_payment(
        &self,
        payment_id: i64,
        payer: Option<String>,
    ) -> Result<TransitionOutcome, sqlx::Error> {
        let mut tx = self.store.begin().await?;
        let current = payment::lock(&mut tx, payment_id).await?;
        if current.status.is_settled() {
            return Ok(TransitionOutcome::NoOp(current.status));
        }
        if !current.status.can_transition_to(PaymentStatus::Completed) {
            tracing::warn!(
                reference = %current.reference,
                status = %current.status,
                "ignoring completion for payment not in processing"
            );
            return Ok(TransitionOutcome::NoOp(current.status));
        }

        let now = Utc::now();
        let customer_email = current.customer_email.as_deref();
        let customer_phone = current.customer_phone.as_deref().or(payer.as_deref());
        let customer_id = if customer_email.is_some() || customer_phone.is_some() {
            Some(
                customer::upsert_on_completion(
                    &mut tx,
                    current.merchant_id,
                    current.environment,
                    customer_email,
                    customer_phone,
                    current.customer_name.as_deref(),
                    current.amount,
                    now,
                )
                .await?,
            )
        } else {
            None
        };

        let updated = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET status = 'completed',
                net_amount = amount - fee_amount,
                completed_at = $2,
                customer_id = COALESCE($3, customer_id),
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(payment_id)
        .bind(now)
        .bind(customer_id)
        .fetch_one(&mut *tx)
        .await?;

        ledger::insert(
            &mut tx,
            updated.id,
            updated.merchant_id,
            LedgerKind::Credit,
            updated.amount,
            updated.currency,
            None,
        )
        .await?;
        self.bus
            .publish(&mut tx, &updated, EventType::PaymentSucceeded)
            .await?;
        tx.commit().await?;

        tracing::info!(reference = %updated.reference, "payment completed");
        Ok(TransitionOutcome::Applied(updated))
    }

    /// `pending|processing → failed` with a human-readable reason.
    #[tracing::instrument(skip(self, reason))]
    pub async fn fail_payment(
        &self,
        payment_id: i64,
        reason: &str,
    ) -> Result<TransitionOutcome, sqlx::Error> {
        let mut tx = self.store.begin().await?;
        let current = payment::lock(&mut tx, payment_id).await?;
        if current.status == PaymentStatus::Failed {
            return Ok(TransitionOutcome::NoOp(current.status));
        }
        if !current.status.can_transition_to(PaymentStatus::Failed) {
            tracing::warn!(
                reference = %current.reference,
                status = %current.status,
                "ignoring failure for payment in terminal or settled state"
            );
            return Ok(TransitionOutcome::NoOp(current.status));
        }

        let updated = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET status = 'failed', failure_reason = $2, failed_at = now(), updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(payment_id)
        .bind(reason)
        .fetch_one(&mut *tx)
        .await?;
        self.bus
            .publish(&mut tx, &updated, EventType::PaymentFailed)
            .await?;
        tx.commit().await?;

        tracing::info!(reference = %updated.reference, reason, "payment failed");
        Ok(TransitionOutcome::Applied(updated))
    }

    /// `processing → cancelled`.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_payment(&self, payment_id: i64) -> Result<TransitionOutcome, sqlx::Error> {
        let mut tx = self.store.begin().await?;
        let current = payment::lock(&mut tx, payment_id).await?;
        if current.status == PaymentStatus::Cancelled {
            return Ok(TransitionOutcome::NoOp(current.status));
        }
        if !current.status.can_transition_to(PaymentStatus::Cancelled) {
            tracing::warn!(
                reference = %current.reference,
                status = %current.status,
                "ignoring cancellation for payment not in processing"
            );
            return Ok(TransitionOutcome::NoOp(current.status));
        }

        let updated = sqlx::query_as::<_, Payment>(
            "UPDATE payments SET status = 'cancelled', updated_at = now() WHERE id = $1 RETURNING *",
        )
        .bind(payment_id)
        .fetch_one(&mut *tx)
        .await?;
        self.bus
            .publish(&mut tx, &updated, EventType::PaymentCancelled)
            .await?;
        tx.commit().await?;

        tracing::info!(reference = %updated.reference, "payment cancelled");
        Ok(TransitionOutcome::Applied(updated))
    }

    /// Merchant-initiated refund, partial or full.
    ///
    /// The provider call happens before the accounting transaction so no row
    /// lock is held across network I/O; the amounts are then re-checked
    /// under the lock, which is what serializes concurrent refunds.
    #[tracing::instrument(skip(self, reason), fields(merchant = merchant_id))]
    pub async fn refund(
        &self,
        merchant_id: i64,
        payment_reference: &str,
        amount: Decimal,
        reason: Option<&str>,
    ) -> Result<Payment, ApiError> {
        if amount <= Decimal::ZERO {
            return Err(ApiError::validation("refund amount must be positive"));
        }
        if amount.scale() > 2 {
            return Err(ApiError::validation("refund precision is limited to 2 decimal places"));
        }

        let observed = self
            .store
            .payment_by_reference(merchant_id, payment_reference)
            .await?
            .ok_or_else(ApiError::payment_not_found)?;
        if !observed.status.is_refundable() {
            return Err(ApiError::new(
                ErrorCode::RefundNotAllowed,
                format!("payments in state {} cannot be refunded", observed.status),
            ));
        }
        if amount > observed.outstanding() {
            return Err(ApiError::new(
                ErrorCode::RefundExceedsAmount,
                "refund exceeds the outstanding amount",
            ));
        }

        if let Some(provider_tx_id) = observed.provider_transaction_id.as_deref() {
            match self.registry.by_channel(observed.channel) {
                Ok(provider) => match provider
                    .refund(provider_tx_id, amount, observed.currency)
                    .await
                {
                    Ok(outcome) => {
                        tracing::info!(refund_id = %outcome.refund_id, "provider refund issued");
                    }
                    Err(ProviderError::Unsupported { .. }) => {
                        tracing::debug!(channel = %observed.channel, "processor has no refund API, accounting only");
                    }
                    Err(error) => return Err(error.into()),
                },
                Err(ProviderError::NotConfigured(channel)) => {
                    tracing::warn!(%channel, "channel no longer configured, refunding on the books only");
                }
                Err(error) => return Err(error.into()),
            }
        }

        let mut tx = self.store.begin().await?;
        let current = payment::lock(&mut tx, observed.id).await?;
        if !current.status.is_refundable() {
            return Err(ApiError::new(
                ErrorCode::RefundNotAllowed,
                format!("payments in state {} cannot be refunded", current.status),
            ));
        }
        if amount > current.outstanding() {
            return Err(ApiError::new(
                ErrorCode::RefundExceedsAmount,
                "refund exceeds the outstanding amount",
            ));
        }

        let new_total = current.refunded_amount + amount;
        let target = refund_target(new_total, current.amount);
        ledger::insert(
            &mut tx,
            current.id,
            current.merchant_id,
            LedgerKind::Refund,
            amount,
            current.currency,
            reason,
        )
        .await?;
        let updated = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET refunded_amount = $2, status = $3, updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(current.id)
        .bind(new_total)
        .bind(target)
        .fetch_one(&mut *tx)
        .await?;
        self.bus
            .publish(&mut tx, &updated, EventType::PaymentRefunded)
            .await?;
        tx.commit().await?;

        tracing::info!(
            reference = %updated.reference,
            %amount,
            total_refunded = %updated.refunded_amount,
            "refund recorded"
        );
        Ok(updated)
    }

    /// Refund observed at the processor (e.g. issued from its dashboard).
    /// `total_refunded` is cumulative; replays and partial overlaps reduce
    /// to a delta of zero and no-op.
    #[tracing::instrument(skip(self))]
    pub async fn apply_remote_refund(
        &self,
        payment_id: i64,
        total_refunded: Decimal,
    ) -> Result<TransitionOutcome, sqlx::Error> {
        let mut tx = self.store.begin().await?;
        let current = payment::lock(&mut tx, payment_id).await?;
        if !current.status.is_settled() {
            tracing::warn!(
                reference = %current.reference,
                status = %current.status,
                "refund callback for payment that never completed"
            );
            return Ok(TransitionOutcome::NoOp(current.status));
        }

        let target_total = if total_refunded > current.amount {
            tracing::warn!(
                reference = %current.reference,
                %total_refunded,
                "processor reports more refunded than the gross amount, clamping"
            );
            current.amount
        } else {
            total_refunded
        };
        let delta = target_total - current.refunded_amount;
        if delta <= Decimal::ZERO {
            return Ok(TransitionOutcome::NoOp(current.status));
        }

        let target = refund_target(target_total, current.amount);
        ledger::insert(
            &mut tx,
            current.id,
            current.merchant_id,
            LedgerKind::Refund,
            delta,
            current.currency,
            Some("refund reported by processor"),
        )
        .await?;
        let updated = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET refunded_amount = $2, status = $3, updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(current.id)
        .bind(target_total)
        .bind(target)
        .fetch_one(&mut *tx)
        .await?;
        self.bus
            .publish(&mut tx, &updated, EventType::PaymentRefunded)
            .await?;
        tx.commit().await?;
        Ok(TransitionOutcome::Applied(updated))
    }

    /// Close the expiry window on payments that never left `pending`.
    pub async fn expire_pending(&self) -> Result<u64, sqlx::Error> {
        let expired = self.store.expire_pending().await?;
        if expired > 0 {
            tracing::info!(expired, "pending payments expired");
        }
        Ok(expired)
    }

    /// Poll the processor for payments stuck in `processing` and advance
    /// them through the ordinary transitions. Covers lost callbacks.
    pub async fn sync_stale_processing(&self, stale_after: Duration, limit: i64) {
        let cutoff: DateTime<Utc> = Utc::now()
            - ChronoDuration::from_std(stale_after).unwrap_or_else(|_| ChronoDuration::minutes(10));
        let stale = match self.store.stale_processing(cutoff, limit).await {
            Ok(stale) => stale,
            Err(error) => {
                tracing::error!(%error, "could not list stale payments");
                return;
            }
        };
        for payment in stale {
            let Some(provider_tx_id) = payment.provider_transaction_id.as_deref() else {
                continue;
            };
            let provider = match self.registry.by_channel(payment.channel) {
                Ok(provider) => provider,
                Err(_) => continue,
            };
            let outcome = match provider.status(provider_tx_id).await {
                Ok(outcome) => outcome,
                Err(error) => {
                    tracing::warn!(reference = %payment.reference, %error, "status poll failed");
                    continue;
                }
            };
            let result = match outcome.state {
                RemoteState::Completed => self.complete_payment(payment.id, outcome.payer).await,
                RemoteState::Failed => {
                    self.fail_payment(payment.id, "reported failed by processor").await
                }
                RemoteState::Cancelled => self.cancel_payment(payment.id).await,
                RemoteState::Pending => {
                    // Still in flight at the processor; push the poll window out.
                    if let Err(error) = self.store.touch_payment(payment.id).await {
                        tracing::warn!(reference = %payment.reference, %error, "touch failed");
                    }
                    continue;
                }
            };
            if let Err(error) = result {
                tracing::error!(reference = %payment.reference, %error, "status sync transition failed");
            }
        }
    }
}

/// Consumes the per-channel dispatch queues.
pub struct DispatchWorker {
    flows: PaymentFlows,
    queue: JobQueue,
}

impl DispatchWorker {
    pub fn new(flows: PaymentFlows, queue: JobQueue) -> Self {
        Self { flows, queue }
    }
}

#[async_trait::async_trait]
impl JobHandler for DispatchWorker {
    async fn run(&self, job: &Job) -> Result<(), JobError> {
        let dispatch: DispatchJob = serde_json::from_value(job.payload.clone())?;
        self.flows.dispatch(&dispatch.payment_reference).await
    }

    /// Retries are spent: park the job in the DLQ and fail the payment with
    /// a reason a human can act on.
    async fn exhausted(&self, job: &Job, error: &JobError) {
        if let Err(dlq_error) = self.queue.move_to_dlq(job, &error.message).await {
            tracing::error!(job_id = job.id, %dlq_error, "could not move job to DLQ");
        }
        let Ok(dispatch) = serde_json::from_value::<DispatchJob>(job.payload.clone()) else {
            return;
        };
        let payment = match self
            .flows
            .store()
            .payment_by_reference_any(&dispatch.payment_reference)
            .await
        {
            Ok(Some(payment)) => payment,
            Ok(None) => return,
            Err(store_error) => {
                tracing::error!(%store_error, "could not load payment for terminal failure");
                return;
            }
        };
        let reason = format!("payment could not be initiated: {}", error.message);
        if let Err(fail_error) = self.flows.fail_payment(payment.id, &reason).await {
            tracing::error!(reference = %payment.reference, %fail_error, "could not mark payment failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn create_validation_rejects_bad_amounts() {
        assert!(validate_amount(Decimal::ZERO, Currency::Htg, Channel::Moncash).is_err());
        assert!(validate_amount(dec("-5"), Currency::Htg, Channel::Moncash).is_err());
        assert!(validate_amount(dec("100.123"), Currency::Htg, Channel::Moncash).is_err());
        // Below the 10 HTG MonCash floor.
        assert!(validate_amount(dec("5.00"), Currency::Htg, Channel::Moncash).is_err());
        // Below the 0.50 USD Stripe floor.
        assert!(validate_amount(dec("0.25"), Currency::Usd, Channel::Stripe).is_err());
        assert!(validate_amount(dec("100.00"), Currency::Htg, Channel::Moncash).is_ok());
        assert!(validate_amount(dec("10.00"), Currency::Usd, Channel::Stripe).is_ok());
    }

    #[test]
    fn validation_errors_carry_the_validation_code() {
        let error = validate_amount(Decimal::ZERO, Currency::Htg, Channel::Moncash).unwrap_err();
        assert_eq!(error.code, ErrorCode::ValidationError);
    }

    #[test]
    fn refund_target_flips_to_refunded_only_at_full_amount() {
        let gross = dec("100.00");
        assert_eq!(refund_target(dec("40.00"), gross), PaymentStatus::PartiallyRefunded);
        assert_eq!(refund_target(dec("99.99"), gross), PaymentStatus::PartiallyRefunded);
        assert_eq!(refund_target(dec("100.00"), gross), PaymentStatus::Refunded);
    }
}
