//! Webhook subscriptions and the per-delivery audit log.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use crate::store::Store;
use crate::types::{DeliveryStatus, EventType};

/// One merchant-configured outbound endpoint.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WebhookConfig {
    pub id: i64,
    pub merchant_id: i64,
    pub url: String,
    pub events: Vec<String>,
    pub secret: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// One delivery attempt record, one row per (config, payment, event) fan-out.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WebhookLog {
    pub id: i64,
    pub webhook_config_id: i64,
    pub payment_id: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: DeliveryStatus,
    pub http_status: Option<i32>,
    pub response_body: Option<String>,
    pub attempt_count: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Active configs on `merchant_id` subscribed to `event` (directly or `*`).
pub async fn active_configs_for_event(
    conn: &mut PgConnection,
    merchant_id: i64,
    event: EventType,
) -> sqlx::Result<Vec<WebhookConfig>> {
    let configs = sqlx::query_as::<_, WebhookConfig>(
        "SELECT * FROM webhook_configs WHERE merchant_id = $1 AND is_active",
    )
    .bind(merchant_id)
    .fetch_all(conn)
    .await?;
    Ok(configs
        .into_iter()
        .filter(|config| event.matches_subscription(&config.events))
        .collect())
}

/// Insert a `pending` log row carrying the payload snapshot to deliver.
pub async fn insert_log(
    conn: &mut PgConnection,
    webhook_config_id: i64,
    payment_id: i64,
    event: EventType,
    payload: &serde_json::Value,
) -> sqlx::Result<WebhookLog> {
    sqlx::query_as::<_, WebhookLog>(
        r#"
        INSERT INTO webhook_logs (webhook_config_id, payment_id, event_type, payload)
        VALUES ($1, $2, $3, $4)
        RETURNING *
        "#,
    )
    .bind(webhook_config_id)
    .bind(payment_id)
    .bind(event.as_str())
    .bind(payload)
    .fetch_one(conn)
    .await
}

impl Store {
    pub async fn webhook_log(&self, log_id: i64) -> sqlx::Result<Option<WebhookLog>> {
        sqlx::query_as::<_, WebhookLog>("SELECT * FROM webhook_logs WHERE id = $1")
            .bind(log_id)
            .fetch_optional(self.pool())
            .await
    }

    pub async fn webhook_config(&self, config_id: i64) -> sqlx::Result<Option<WebhookConfig>> {
        sqlx::query_as::<_, WebhookConfig>("SELECT * FROM webhook_configs WHERE id = $1")
            .bind(config_id)
            .fetch_optional(self.pool())
            .await
    }

    /// Record the outcome of one delivery attempt. Marks the row delivered
    /// on success; intermediate failures stay `pending` for the retry.
    pub async fn record_delivery_attempt(
        &self,
        log_id: i64,
        attempt_count: i32,
        http_status: Option<i32>,
        response_body: Option<&str>,
        delivered: bool,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            UPDATE webhook_logs
            SET attempt_count = $2,
                http_status = $3,
                response_body = $4,
                last_attempt_at = now(),
                status = CASE WHEN $5 THEN 'delivered' ELSE status END,
                delivered_at = CASE WHEN $5 THEN now() ELSE delivered_at END
            WHERE id = $1
            "#,
        )
        .bind(log_id)
        .bind(attempt_count)
        .bind(http_status)
        .bind(response_body)
        .bind(delivered)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Final failure: the retry budget is spent and the row is closed out.
    pub async fn finalize_delivery_failed(&self, log_id: i64) -> sqlx::Result<()> {
        sqlx::query("UPDATE webhook_logs SET status = 'failed' WHERE id = $1 AND status <> 'delivered'")
            .bind(log_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
