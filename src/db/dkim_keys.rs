use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::DkimKeyPair;

pub async fn insert(
    pool: &PgPool,
    domain_id: Uuid,
    selector: &str,
    private_key_enc: &[u8],
    public_key: &str,
) -> Result<DkimKeyPair, sqlx::Error> {
    sqlx::query_as::<_, DkimKeyPair>(
        "INSERT INTO dkim_keys (domain_id, selector, private_key_enc, public_key)
         VALUES ($1, $2, $3, $4) RETURNING *",
    )
    .bind(domain_id)
    .bind(selector)
    .bind(private_key_enc)
    .bind(public_key)
    .fetch_one(pool)
    .await
}

pub async fn find_active(pool: &PgPool, domain_id: Uuid) -> Result<Option<DkimKeyPair>, sqlx::Error> {
    sqlx::query_as::<_, DkimKeyPair>(
        "SELECT * FROM dkim_keys WHERE domain_id = $1 AND is_active",
    )
    .bind(domain_id)
    .fetch_optional(pool)
    .await
}

pub async fn find_by_selector(
    pool: &PgPool,
    domain_id: Uuid,
    selector: &str,
) -> Result<Option<DkimKeyPair>, sqlx::Error> {
    sqlx::query_as::<_, DkimKeyPair>(
        "SELECT * FROM dkim_keys WHERE domain_id = $1 AND selector = $2",
    )
    .bind(domain_id)
    .bind(selector)
    .fetch_optional(pool)
    .await
}

pub async fn list_by_domain(pool: &PgPool, domain_id: Uuid) -> Result<Vec<DkimKeyPair>, sqlx::Error> {
    sqlx::query_as::<_, DkimKeyPair>(
        "SELECT * FROM dkim_keys WHERE domain_id = $1 ORDER BY created_at",
    )
    .bind(domain_id)
    .fetch_all(pool)
    .await
}

/// Active keys for every verified domain of a tenant.
pub async fn list_active_for_tenant(
    pool: &PgPool,
    tenant_id: Uuid,
) -> Result<Vec<DkimKeyPair>, sqlx::Error> {
    sqlx::query_as::<_, DkimKeyPair>(
        "SELECT k.* FROM dkim_keys k
         JOIN domains d ON d.id = k.domain_id
         WHERE d.tenant_id = $1 AND d.is_verified AND k.is_active",
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await
}

/// Deactivate the domain's active key unless it is `selector`, stamping it
/// for retirement. Returns the number of keys deactivated.
pub async fn deactivate_others(
    tx: &mut Transaction<'_, Postgres>,
    domain_id: Uuid,
    selector: &str,
    now: DateTime<Utc>,
    retire_after: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE dkim_keys
         SET is_active = FALSE, rotated_at = $3, retire_after = $4
         WHERE domain_id = $1 AND is_active AND selector <> $2",
    )
    .bind(domain_id)
    .bind(selector)
    .bind(now)
    .bind(retire_after)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected())
}

pub async fn mark_active(
    tx: &mut Transaction<'_, Postgres>,
    domain_id: Uuid,
    selector: &str,
) -> Result<Option<DkimKeyPair>, sqlx::Error> {
    sqlx::query_as::<_, DkimKeyPair>(
        "UPDATE dkim_keys
         SET is_active = TRUE, rotated_at = NULL, retire_after = NULL
         WHERE domain_id = $1 AND selector = $2
         RETURNING *",
    )
    .bind(domain_id)
    .bind(selector)
    .fetch_optional(&mut **tx)
    .await
}

/// Delete inactive keys whose grace window has passed.
pub async fn delete_retired(pool: &PgPool, now: DateTime<Utc>) -> Result<Vec<Uuid>, sqlx::Error> {
    sqlx::query_scalar::<_, Uuid>(
        "DELETE FROM dkim_keys
         WHERE NOT is_active AND retire_after IS NOT NULL AND retire_after <= $1
         RETURNING id",
    )
    .bind(now)
    .fetch_all(pool)
    .await
}
