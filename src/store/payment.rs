//! Payment rows and queries.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, QueryBuilder};

use crate::store::Store;
use crate::types::{Channel, Currency, Environment, PaymentStatus};

/// The central entity: one payment, owned by exactly one merchant.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Payment {
    pub id: i64,
    pub reference: String,
    pub merchant_id: i64,
    pub environment: Environment,
    pub channel: Channel,
    pub status: PaymentStatus,
    pub amount: Decimal,
    pub currency: Currency,
    pub fee_rate: Decimal,
    pub fee_amount: Decimal,
    pub net_amount: Decimal,
    pub refunded_amount: Decimal,
    pub provider_transaction_id: Option<String>,
    pub provider_reference: Option<String>,
    pub redirect_url: Option<String>,
    pub idempotency_key: Option<String>,
    pub order_id: Option<String>,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub customer_name: Option<String>,
    pub customer_id: Option<i64>,
    pub metadata: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Payment {
    /// Gross minus what has already been refunded.
    pub fn outstanding(&self) -> Decimal {
        self.amount - self.refunded_amount
    }
}

/// Fields required to insert a payment in `pending` state.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub reference: String,
    pub merchant_id: i64,
    pub environment: Environment,
    pub channel: Channel,
    pub amount: Decimal,
    pub currency: Currency,
    pub fee_rate: Decimal,
    pub fee_amount: Decimal,
    pub net_amount: Decimal,
    pub idempotency_key: Option<String>,
    pub order_id: Option<String>,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub customer_name: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub expires_at: DateTime<Utc>,
}

/// Filters for the merchant-facing list endpoint.
#[derive(Debug, Clone, Default)]
pub struct PaymentFilter {
    pub status: Option<PaymentStatus>,
    pub channel: Option<Channel>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Exclusive upper bound on the primary id (decoded pagination cursor).
    pub before_id: Option<i64>,
    pub limit: i64,
}

/// Insert a pending payment inside an open transaction.
pub async fn insert(conn: &mut PgConnection, new: &NewPayment) -> sqlx::Result<Payment> {
    sqlx::query_as::<_, Payment>(
        r#"
        INSERT INTO payments (
            reference, merchant_id, environment, channel, status,
            amount, currency, fee_rate, fee_amount, net_amount,
            idempotency_key, order_id,
            customer_email, customer_phone, customer_name,
            metadata, expires_at
        )
        VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        RETURNING *
        "#,
    )
    .bind(&new.reference)
    .bind(new.merchant_id)
    .bind(new.environment)
    .bind(new.channel)
    .bind(new.amount)
    .bind(new.currency)
    .bind(new.fee_rate)
    .bind(new.fee_amount)
    .bind(new.net_amount)
    .bind(&new.idempotency_key)
    .bind(&new.order_id)
    .bind(&new.customer_email)
    .bind(&new.customer_phone)
    .bind(&new.customer_name)
    .bind(&new.metadata)
    .bind(new.expires_at)
    .fetch_one(conn)
    .await
}

/// Re-read a payment under a row lock; serializes concurrent transitions.
pub async fn lock(conn: &mut PgConnection, payment_id: i64) -> sqlx::Result<Payment> {
    sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1 FOR UPDATE")
        .bind(payment_id)
        .fetch_one(conn)
        .await
}

impl Store {
    /// Merchant-scoped lookup by public reference.
    pub async fn payment_by_reference(
        &self,
        merchant_id: i64,
        reference: &str,
    ) -> sqlx::Result<Option<Payment>> {
        sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE merchant_id = $1 AND reference = $2",
        )
        .bind(merchant_id)
        .bind(reference)
        .fetch_optional(self.pool())
        .await
    }

    /// Unscoped lookup, for worker jobs and the public checkout read.
    pub async fn payment_by_reference_any(&self, reference: &str) -> sqlx::Result<Option<Payment>> {
        sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE reference = $1")
            .bind(reference)
            .fetch_optional(self.pool())
            .await
    }

    /// Correlate an inbound callback with a payment.
    pub async fn payment_by_provider_tx(
        &self,
        channel: Channel,
        provider_tx_id: &str,
    ) -> sqlx::Result<Option<Payment>> {
        sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE channel = $1 AND provider_transaction_id = $2",
        )
        .bind(channel)
        .bind(provider_tx_id)
        .fetch_optional(self.pool())
        .await
    }

    /// Descending-chronological page of a merchant's payments.
    pub async fn list_payments(
        &self,
        merchant_id: i64,
        filter: &PaymentFilter,
    ) -> sqlx::Result<Vec<Payment>> {
        let mut query: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new("SELECT * FROM payments WHERE merchant_id = ");
        query.push_bind(merchant_id);
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status);
        }
        if let Some(channel) = filter.channel {
            query.push(" AND channel = ").push_bind(channel);
        }
        if let Some(from) = filter.from {
            query.push(" AND created_at >= ").push_bind(from);
        }
        if let Some(to) = filter.to {
            query.push(" AND created_at <= ").push_bind(to);
        }
        if let Some(before_id) = filter.before_id {
            query.push(" AND id < ").push_bind(before_id);
        }
        query.push(" ORDER BY id DESC LIMIT ").push_bind(filter.limit);
        query
            .build_query_as::<Payment>()
            .fetch_all(self.pool())
            .await
    }

    /// Record the provider handle and move `pending → processing`.
    ///
    /// The status guard makes redelivered dispatch jobs no-ops.
    pub async fn mark_processing(
        &self,
        payment_id: i64,
        provider_tx_id: &str,
        redirect_url: Option<&str>,
        provider_reference: Option<&str>,
    ) -> sqlx::Result<Option<Payment>> {
        sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET status = 'processing',
                provider_transaction_id = $2,
                redirect_url = $3,
                provider_reference = $4,
                updated_at = now()
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(payment_id)
        .bind(provider_tx_id)
        .bind(redirect_url)
        .bind(provider_reference)
        .fetch_optional(self.pool())
        .await
    }

    /// Terminal sweep for payments whose window closed before dispatch.
    pub async fn expire_pending(&self) -> sqlx::Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET status = 'expired', updated_at = now()
            WHERE status = 'pending' AND expires_at < now()
            "#,
        )
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Bump `updated_at`, pushing the payment out of the stale-poll window.
    pub async fn touch_payment(&self, payment_id: i64) -> sqlx::Result<()> {
        sqlx::query("UPDATE payments SET updated_at = now() WHERE id = $1")
            .bind(payment_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Payments stuck in `processing` since before `cutoff`, oldest first.
    pub async fn stale_processing(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> sqlx::Result<Vec<Payment>> {
        sqlx::query_as::<_, Payment>(
            r#"
            SELECT * FROM payments
            WHERE status = 'processing' AND updated_at < $1
            ORDER BY updated_at
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(self.pool())
        .await
    }
}
