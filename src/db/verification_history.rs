use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{RecordCheck, VerificationAttempt, VerificationStatus};

pub struct NewAttempt<'a> {
    pub tenant_id: Uuid,
    pub domain_id: Uuid,
    pub status: VerificationStatus,
    pub spf: &'a RecordCheck,
    pub dkim: &'a RecordCheck,
    pub dmarc: &'a RecordCheck,
    pub ownership: &'a RecordCheck,
    pub timestamp: DateTime<Utc>,
}

pub async fn append(
    tx: &mut Transaction<'_, Postgres>,
    attempt: &NewAttempt<'_>,
) -> Result<VerificationAttempt, sqlx::Error> {
    sqlx::query_as::<_, VerificationAttempt>(
        "INSERT INTO domain_verification_history
             (domain_id, tenant_id, status, spf_result, dkim_result, dmarc_result,
              ownership_result, timestamp)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         RETURNING *",
    )
    .bind(attempt.domain_id)
    .bind(attempt.tenant_id)
    .bind(attempt.status.as_str())
    .bind(Json(attempt.spf))
    .bind(Json(attempt.dkim))
    .bind(Json(attempt.dmarc))
    .bind(Json(attempt.ownership))
    .bind(attempt.timestamp)
    .fetch_one(&mut **tx)
    .await
}

pub async fn list_by_domain(
    pool: &PgPool,
    tenant_id: Uuid,
    domain_id: Uuid,
    limit: i64,
) -> Result<Vec<VerificationAttempt>, sqlx::Error> {
    sqlx::query_as::<_, VerificationAttempt>(
        "SELECT * FROM domain_verification_history
         WHERE tenant_id = $1 AND domain_id = $2
         ORDER BY timestamp DESC
         LIMIT $3",
    )
    .bind(tenant_id)
    .bind(domain_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}
