//! Customer roll-up maintained on payment completion.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgConnection;

use crate::types::Environment;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Customer {
    pub id: i64,
    pub merchant_id: i64,
    pub environment: Environment,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub name: Option<String>,
    pub total_spent: Decimal,
    pub payment_count: i32,
    pub first_payment_at: Option<DateTime<Utc>>,
    pub last_payment_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Upsert the customer a completed payment belongs to and return its id.
///
/// Matching is by email or phone within `(merchant, environment)`. An
/// existing row accumulates `total_spent`/`payment_count` and backfills the
/// name only when it was empty; a fresh row records the first payment time.
pub async fn upsert_on_completion(
    conn: &mut PgConnection,
    merchant_id: i64,
    environment: Environment,
    email: Option<&str>,
    phone: Option<&str>,
    name: Option<&str>,
    gross_amount: Decimal,
    paid_at: DateTime<Utc>,
) -> sqlx::Result<i64> {
    let existing = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT id FROM customers
        WHERE merchant_id = $1 AND environment = $2
          AND (($3::TEXT IS NOT NULL AND email = $3) OR ($4::TEXT IS NOT NULL AND phone = $4))
        ORDER BY id
        LIMIT 1
        FOR UPDATE
        "#,
    )
    .bind(merchant_id)
    .bind(environment)
    .bind(email)
    .bind(phone)
    .fetch_optional(&mut *conn)
    .await?;

    match existing {
        Some(customer_id) => {
            sqlx::query(
                r#"
                UPDATE customers
                SET total_spent = total_spent + $2,
                    payment_count = payment_count + 1,
                    last_payment_at = $3,
                    name = COALESCE(name, $4)
                WHERE id = $1
                "#,
            )
            .bind(customer_id)
            .bind(gross_amount)
            .bind(paid_at)
            .bind(name)
            .execute(conn)
            .await?;
            Ok(customer_id)
        }
        None => {
            sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO customers (
                    merchant_id, environment, email, phone, name,
                    total_spent, payment_count, first_payment_at, last_payment_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, 1, $7, $7)
                RETURNING id
                "#,
            )
            .bind(merchant_id)
            .bind(environment)
            .bind(email)
            .bind(phone)
            .bind(name)
            .bind(gross_amount)
            .bind(paid_at)
            .fetch_one(conn)
            .await
        }
    }
}
