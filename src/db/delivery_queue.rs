use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{DeliveryJob, MessageHeader};

pub struct NewJob<'a> {
    pub tenant_id: Uuid,
    pub message_id: &'a str,
    pub from_address: &'a str,
    pub to_address: &'a str,
    pub subject: &'a str,
    pub body: &'a str,
    pub headers: &'a [MessageHeader],
    pub priority: i32,
    pub max_attempts: i32,
}

pub async fn enqueue(pool: &PgPool, job: &NewJob<'_>) -> Result<DeliveryJob, sqlx::Error> {
    sqlx::query_as::<_, DeliveryJob>(
        "INSERT INTO email_delivery_queue
             (tenant_id, message_id, from_address, to_address, subject, body, headers, priority, max_attempts)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
         RETURNING *",
    )
    .bind(job.tenant_id)
    .bind(job.message_id)
    .bind(job.from_address)
    .bind(job.to_address)
    .bind(job.subject)
    .bind(job.body)
    .bind(Json(job.headers))
    .bind(job.priority)
    .bind(job.max_attempts)
    .fetch_one(pool)
    .await
}

pub async fn find_by_id(
    pool: &PgPool,
    tenant_id: Uuid,
    id: Uuid,
) -> Result<Option<DeliveryJob>, sqlx::Error> {
    sqlx::query_as::<_, DeliveryJob>(
        "SELECT * FROM email_delivery_queue WHERE id = $1 AND tenant_id = $2",
    )
    .bind(id)
    .bind(tenant_id)
    .fetch_optional(pool)
    .await
}

pub async fn list_by_tenant(
    pool: &PgPool,
    tenant_id: Uuid,
    limit: i64,
    offset: i64,
) -> Result<Vec<DeliveryJob>, sqlx::Error> {
    sqlx::query_as::<_, DeliveryJob>(
        "SELECT * FROM email_delivery_queue WHERE tenant_id = $1
         ORDER BY created_at DESC LIMIT $2 OFFSET $3",
    )
    .bind(tenant_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
}

/// Atomically move up to `limit` eligible jobs of one tenant from `pending`
/// to `processing`. Rows locked by another worker are skipped, and the outer
/// status guard keeps a row from being claimed twice. The candidate set is
/// materialized so the LIMIT is applied once, not per outer row.
pub async fn claim_batch(
    pool: &PgPool,
    tenant_id: Uuid,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<DeliveryJob>, sqlx::Error> {
    let mut jobs = sqlx::query_as::<_, DeliveryJob>(
        "WITH claimable AS MATERIALIZED (
             SELECT id FROM email_delivery_queue
             WHERE tenant_id = $1
               AND status = 'pending'
               AND (next_attempt IS NULL OR next_attempt <= $2)
             ORDER BY priority DESC, created_at ASC
             LIMIT $3
             FOR UPDATE SKIP LOCKED
         )
         UPDATE email_delivery_queue q SET status = 'processing', updated_at = $2
         FROM claimable c
         WHERE q.id = c.id
           AND q.tenant_id = $1
           AND q.status = 'pending'
         RETURNING q.*",
    )
    .bind(tenant_id)
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    // RETURNING does not preserve the subquery order.
    jobs.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
    Ok(jobs)
}

pub async fn mark_delivered(
    pool: &PgPool,
    tenant_id: Uuid,
    id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<DeliveryJob>, sqlx::Error> {
    sqlx::query_as::<_, DeliveryJob>(
        "UPDATE email_delivery_queue
         SET status = 'delivered', attempts = attempts + 1, last_attempt = $3,
             next_attempt = NULL, delivered_at = $3, error_message = NULL, updated_at = $3
         WHERE id = $1 AND tenant_id = $2 AND status = 'processing'
         RETURNING *",
    )
    .bind(id)
    .bind(tenant_id)
    .bind(now)
    .fetch_optional(pool)
    .await
}

/// Record a transient failure: back to `pending` with the next eligible time.
pub async fn schedule_retry(
    pool: &PgPool,
    tenant_id: Uuid,
    id: Uuid,
    now: DateTime<Utc>,
    next_attempt: DateTime<Utc>,
    error: &str,
) -> Result<Option<DeliveryJob>, sqlx::Error> {
    sqlx::query_as::<_, DeliveryJob>(
        "UPDATE email_delivery_queue
         SET status = 'pending', attempts = attempts + 1, last_attempt = $3,
             next_attempt = $4, error_message = $5, updated_at = $3
         WHERE id = $1 AND tenant_id = $2 AND status = 'processing'
         RETURNING *",
    )
    .bind(id)
    .bind(tenant_id)
    .bind(now)
    .bind(next_attempt)
    .bind(error)
    .fetch_optional(pool)
    .await
}

/// Terminal failure or bounce after a transport attempt.
pub async fn mark_attempt_terminal(
    pool: &PgPool,
    tenant_id: Uuid,
    id: Uuid,
    status: &str,
    now: DateTime<Utc>,
    error: &str,
) -> Result<Option<DeliveryJob>, sqlx::Error> {
    sqlx::query_as::<_, DeliveryJob>(
        "UPDATE email_delivery_queue
         SET status = $3, attempts = attempts + 1, last_attempt = $4,
             next_attempt = NULL, error_message = $5, updated_at = $4
         WHERE id = $1 AND tenant_id = $2 AND status = 'processing'
         RETURNING *",
    )
    .bind(id)
    .bind(tenant_id)
    .bind(status)
    .bind(now)
    .bind(error)
    .fetch_optional(pool)
    .await
}

/// Non-retryable failure decided before any transport attempt. The attempt
/// counter is left untouched.
pub async fn reject(
    pool: &PgPool,
    tenant_id: Uuid,
    id: Uuid,
    now: DateTime<Utc>,
    error: &str,
) -> Result<Option<DeliveryJob>, sqlx::Error> {
    sqlx::query_as::<_, DeliveryJob>(
        "UPDATE email_delivery_queue
         SET status = 'failed', next_attempt = NULL, error_message = $4, updated_at = $3
         WHERE id = $1 AND tenant_id = $2 AND status = 'processing'
         RETURNING *",
    )
    .bind(id)
    .bind(tenant_id)
    .bind(now)
    .bind(error)
    .fetch_optional(pool)
    .await
}

/// Hand a claimed job back without charging an attempt.
pub async fn release(
    pool: &PgPool,
    tenant_id: Uuid,
    id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE email_delivery_queue SET status = 'pending', updated_at = $3
         WHERE id = $1 AND tenant_id = $2 AND status = 'processing'",
    )
    .bind(id)
    .bind(tenant_id)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Release claims of this tenant left in `processing` since before `cutoff`,
/// e.g. by a worker that died mid-send.
pub async fn release_stale(
    pool: &PgPool,
    tenant_id: Uuid,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE email_delivery_queue SET status = 'pending', updated_at = $3
         WHERE tenant_id = $1 AND status = 'processing' AND updated_at < $2",
    )
    .bind(tenant_id)
    .bind(cutoff)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
