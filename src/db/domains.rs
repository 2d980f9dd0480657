use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{Domain, VerificationStatus};

pub async fn create(
    pool: &PgPool,
    tenant_id: Uuid,
    domain_name: &str,
    verification_token: &str,
) -> Result<Domain, sqlx::Error> {
    sqlx::query_as::<_, Domain>(
        "INSERT INTO domains (tenant_id, domain_name, verification_token)
         VALUES ($1, $2, $3) RETURNING *",
    )
    .bind(tenant_id)
    .bind(domain_name)
    .bind(verification_token)
    .fetch_one(pool)
    .await
}

pub async fn find_by_id(
    pool: &PgPool,
    tenant_id: Uuid,
    id: Uuid,
) -> Result<Option<Domain>, sqlx::Error> {
    sqlx::query_as::<_, Domain>("SELECT * FROM domains WHERE id = $1 AND tenant_id = $2")
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(pool)
        .await
}

/// Whether any other tenant currently holds this domain name verified.
pub async fn verified_elsewhere(
    pool: &PgPool,
    tenant_id: Uuid,
    domain_name: &str,
) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (
             SELECT 1 FROM domains
             WHERE domain_name = $1 AND tenant_id <> $2 AND is_verified
         )",
    )
    .bind(domain_name)
    .bind(tenant_id)
    .fetch_one(pool)
    .await
}

pub async fn list_by_tenant(pool: &PgPool, tenant_id: Uuid) -> Result<Vec<Domain>, sqlx::Error> {
    sqlx::query_as::<_, Domain>(
        "SELECT * FROM domains WHERE tenant_id = $1 ORDER BY domain_name",
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await
}

pub async fn list_verified_by_tenant(
    pool: &PgPool,
    tenant_id: Uuid,
) -> Result<Vec<Domain>, sqlx::Error> {
    sqlx::query_as::<_, Domain>(
        "SELECT * FROM domains WHERE tenant_id = $1 AND is_verified ORDER BY domain_name",
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await
}

/// Domains of the tenant not checked since `checked_before`.
pub async fn list_due_for_check(
    pool: &PgPool,
    tenant_id: Uuid,
    checked_before: DateTime<Utc>,
) -> Result<Vec<Domain>, sqlx::Error> {
    sqlx::query_as::<_, Domain>(
        "SELECT * FROM domains
         WHERE tenant_id = $1
           AND (last_checked_at IS NULL OR last_checked_at <= $2)
         ORDER BY last_checked_at NULLS FIRST",
    )
    .bind(tenant_id)
    .bind(checked_before)
    .fetch_all(pool)
    .await
}

pub async fn set_auth_flags(
    pool: &PgPool,
    tenant_id: Uuid,
    id: Uuid,
    spf_enabled: bool,
    dkim_enabled: bool,
    dmarc_enabled: bool,
) -> Result<Option<Domain>, sqlx::Error> {
    sqlx::query_as::<_, Domain>(
        "UPDATE domains
         SET spf_enabled = $3, dkim_enabled = $4, dmarc_enabled = $5, updated_at = now()
         WHERE id = $1 AND tenant_id = $2
         RETURNING *",
    )
    .bind(id)
    .bind(tenant_id)
    .bind(spf_enabled)
    .bind(dkim_enabled)
    .bind(dmarc_enabled)
    .fetch_optional(pool)
    .await
}

/// Lock the domain row for the rest of the transaction. Serializes key
/// rotation per domain.
pub async fn lock(tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<Option<Domain>, sqlx::Error> {
    sqlx::query_as::<_, Domain>("SELECT * FROM domains WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
}

pub struct VerificationUpdate<'a> {
    pub status: VerificationStatus,
    pub dmarc_policy: Option<&'a str>,
    pub checked_at: DateTime<Utc>,
}

/// Apply one check result. The verified flag and the failure streak are
/// derived from the row being updated, so concurrent checks of the same
/// domain serialize on the row lock and none of them is lost. `pending`
/// leaves both untouched.
pub async fn record_verification(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: Uuid,
    id: Uuid,
    update: &VerificationUpdate<'_>,
) -> Result<Domain, sqlx::Error> {
    sqlx::query_as::<_, Domain>(
        "UPDATE domains
         SET verification_status = $3,
             is_verified = CASE WHEN $3 = 'pending' THEN is_verified ELSE $3 = 'verified' END,
             verified_at = CASE WHEN $3 = 'verified' AND NOT is_verified THEN $5 ELSE verified_at END,
             consecutive_failures = CASE $3
                 WHEN 'verified' THEN 0
                 WHEN 'pending' THEN consecutive_failures
                 ELSE consecutive_failures + 1
             END,
             dmarc_policy = COALESCE($4, dmarc_policy),
             last_checked_at = $5,
             updated_at = $5
         WHERE id = $1 AND tenant_id = $2
         RETURNING *",
    )
    .bind(id)
    .bind(tenant_id)
    .bind(update.status.as_str())
    .bind(update.dmarc_policy)
    .bind(update.checked_at)
    .fetch_one(&mut **tx)
    .await
}
