//! Ledger entries: the flat, immutable record of money events.
//!
//! One `credit` row exists iff the payment completed; `refund` rows sum to
//! the payment's `refunded_amount`. Rows are only ever written inside the
//! same transaction as the state change they document.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgConnection;

use crate::reference;
use crate::types::{Currency, LedgerKind};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LedgerEntry {
    pub id: i64,
    pub reference: String,
    pub payment_id: i64,
    pub merchant_id: i64,
    pub kind: LedgerKind,
    pub status: String,
    pub amount: Decimal,
    pub currency: Currency,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Record a money event against a payment. Mints the `txn_*` reference.
pub async fn insert(
    conn: &mut PgConnection,
    payment_id: i64,
    merchant_id: i64,
    kind: LedgerKind,
    amount: Decimal,
    currency: Currency,
    reason: Option<&str>,
) -> sqlx::Result<LedgerEntry> {
    sqlx::query_as::<_, LedgerEntry>(
        r#"
        INSERT INTO transactions (reference, payment_id, merchant_id, kind, status, amount, currency, reason)
        VALUES ($1, $2, $3, $4, 'completed', $5, $6, $7)
        RETURNING *
        "#,
    )
    .bind(reference::transaction_reference())
    .bind(payment_id)
    .bind(merchant_id)
    .bind(kind)
    .bind(amount)
    .bind(currency)
    .bind(reason)
    .fetch_one(conn)
    .await
}
