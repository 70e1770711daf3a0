//! Durable job queue on top of the relational store.
//!
//! Named FIFO-ish queues with at-least-once delivery: a claim marks the row
//! locked and bumps its attempt counter, an ack deletes it, and a worker
//! crash leaves the row to be released by the stalled-job sweep. Retries
//! reschedule with exponential backoff `base · 2^(n−1)`; payment jobs that
//! exhaust their budget are copied to the dead-letter queue with their
//! original payload preserved.

pub mod runner;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use sqlx::PgConnection;
use std::time::Duration;

/// Terminal parking lot for payment jobs whose retries are exhausted.
pub const DLQ: &str = "payments.dlq";
/// Outbound merchant notification queue.
pub const WEBHOOKS: &str = "notifications.webhooks";

/// How long a claimed job may run before the stalled sweep frees it.
pub const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(600);

/// Retry budget and backoff base for one queue.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub backoff_base: Duration,
}

/// Payment dispatch: 3 attempts, retried at 2 s / 4 s / 8 s.
pub const PAYMENT_RETRY: RetryPolicy = RetryPolicy {
    max_attempts: 3,
    backoff_base: Duration::from_millis(2000),
};

/// Webhook delivery: 5 attempts, retried at 5 s / 10 s / 20 s / 40 s / 80 s.
pub const WEBHOOK_RETRY: RetryPolicy = RetryPolicy {
    max_attempts: 5,
    backoff_base: Duration::from_millis(5000),
};

impl RetryPolicy {
    /// Delay before the next try, given how many attempts have been made.
    pub fn delay_after(&self, attempts_made: i32) -> Duration {
        let exponent = attempts_made.max(1) - 1;
        self.backoff_base * 2u32.saturating_pow(exponent as u32)
    }
}

/// One claimed or queued job row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub queue: String,
    pub payload: serde_json::Value,
    /// Attempts made so far, including the one currently claimed.
    pub attempts: i32,
    pub max_attempts: i32,
    pub backoff_base_ms: i64,
    pub run_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms.max(0) as u64),
        }
    }

    pub fn budget_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Enqueue a job inside an open transaction, making it atomic with whatever
/// state change produced it.
pub async fn enqueue_in_tx<T: Serialize>(
    conn: &mut PgConnection,
    queue: &str,
    payload: &T,
    policy: RetryPolicy,
) -> sqlx::Result<i64> {
    sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO jobs (queue, payload, max_attempts, backoff_base_ms)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(queue)
    .bind(serde_json::to_value(payload).expect("job payloads are plain data"))
    .bind(policy.max_attempts)
    .bind(policy.backoff_base.as_millis() as i64)
    .fetch_one(conn)
    .await
}

/// Handle to the job table. Cheap to clone.
#[derive(Clone)]
pub struct JobQueue {
    pool: sqlx::PgPool,
}

impl JobQueue {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn enqueue<T: Serialize>(
        &self,
        queue: &str,
        payload: &T,
        policy: RetryPolicy,
    ) -> sqlx::Result<i64> {
        let mut conn = self.pool.acquire().await?;
        enqueue_in_tx(&mut conn, queue, payload, policy).await
    }

    /// Claim up to `limit` due jobs from `queue`, bumping their attempt
    /// counters. Concurrent workers skip each other's claims.
    pub async fn claim(&self, queue: &str, limit: i64) -> sqlx::Result<Vec<Job>> {
        sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET locked_at = now(), attempts = attempts + 1
            WHERE id IN (
                SELECT id FROM jobs
                WHERE queue = $1 AND locked_at IS NULL AND run_at <= now()
                ORDER BY id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(queue)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    /// Acknowledge a finished job.
    pub async fn complete(&self, job_id: i64) -> sqlx::Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Release a failed job back to the queue after its backoff delay.
    pub async fn retry_later(&self, job: &Job, error: &str) -> sqlx::Result<()> {
        let delay = job.retry_policy().delay_after(job.attempts);
        sqlx::query(
            r#"
            UPDATE jobs
            SET locked_at = NULL,
                run_at = now() + $2 * INTERVAL '1 millisecond',
                last_error = $3
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(delay.as_millis() as i64)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Copy an exhausted job to the dead-letter queue (payload preserved,
    /// failure context attached) and drop the original.
    pub async fn move_to_dlq(&self, job: &Job, error: &str) -> sqlx::Result<()> {
        let mut tx = self.pool.begin().await?;
        let dead_payload = json!({
            "source_queue": job.queue,
            "error": error,
            "attempts": job.attempts,
            "payload": job.payload,
        });
        sqlx::query(
            r#"
            INSERT INTO jobs (queue, payload, max_attempts, backoff_base_ms, locked_at)
            VALUES ($1, $2, 1, 0, now())
            "#,
        )
        .bind(DLQ)
        .bind(&dead_payload)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(job.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Free jobs whose worker died mid-flight so another worker can claim
    /// them. At-least-once delivery comes from exactly this path.
    pub async fn release_stalled(&self, older_than: Duration) -> sqlx::Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET locked_at = NULL
            WHERE queue <> $1
              AND locked_at IS NOT NULL
              AND locked_at < now() - $2 * INTERVAL '1 millisecond'
            "#,
        )
        .bind(DLQ)
        .bind(older_than.as_millis() as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_backoff_schedule_doubles_from_two_seconds() {
        let delays: Vec<u64> = (1..=PAYMENT_RETRY.max_attempts)
            .map(|n| PAYMENT_RETRY.delay_after(n).as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 8]);
    }

    #[test]
    fn webhook_backoff_schedule_doubles_from_five_seconds() {
        let delays: Vec<u64> = (1..=WEBHOOK_RETRY.max_attempts)
            .map(|n| WEBHOOK_RETRY.delay_after(n).as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80]);
        // Cumulative window for a target that never answers 2xx.
        assert_eq!(delays.iter().sum::<u64>(), 155);
    }

    #[test]
    fn budget_exhaustion_counts_the_current_attempt() {
        let mut job = Job {
            id: 1,
            queue: WEBHOOKS.to_string(),
            payload: serde_json::Value::Null,
            attempts: 4,
            max_attempts: 5,
            backoff_base_ms: 5000,
            run_at: Utc::now(),
            locked_at: None,
            last_error: None,
            created_at: Utc::now(),
        };
        assert!(!job.budget_exhausted());
        job.attempts = 5;
        assert!(job.budget_exhausted());
    }
}
