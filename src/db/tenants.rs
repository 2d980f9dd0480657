use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Tenant;

pub async fn create(
    pool: &PgPool,
    name: &str,
    slug: &str,
    plan: &str,
) -> Result<Tenant, sqlx::Error> {
    sqlx::query_as::<_, Tenant>(
        "INSERT INTO tenants (name, slug, plan) VALUES ($1, $2, $3) RETURNING *",
    )
    .bind(name)
    .bind(slug)
    .bind(plan)
    .fetch_one(pool)
    .await
}

pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Tenant>, sqlx::Error> {
    sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn list_active_ids(pool: &PgPool) -> Result<Vec<Uuid>, sqlx::Error> {
    sqlx::query_scalar::<_, Uuid>("SELECT id FROM tenants WHERE is_active ORDER BY created_at, id")
        .fetch_all(pool)
        .await
}

pub async fn set_active(pool: &PgPool, id: Uuid, is_active: bool) -> Result<Option<Tenant>, sqlx::Error> {
    sqlx::query_as::<_, Tenant>(
        "UPDATE tenants SET is_active = $2, updated_at = now() WHERE id = $1 RETURNING *",
    )
    .bind(id)
    .bind(is_active)
    .fetch_optional(pool)
    .await
}

pub async fn set_plan(pool: &PgPool, id: Uuid, plan: &str) -> Result<Option<Tenant>, sqlx::Error> {
    sqlx::query_as::<_, Tenant>(
        "UPDATE tenants SET plan = $2, updated_at = now() WHERE id = $1 RETURNING *",
    )
    .bind(id)
    .bind(plan)
    .fetch_optional(pool)
    .await
}
