use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::{PlanLimits, TenantConfig};
use crate::db;
use crate::error::{EngineError, EngineResult};
use crate::models::{DkimKeyPair, Domain};

#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant_id: Uuid,
    pub is_active: bool,
    pub plan: String,
    pub limits: PlanLimits,
    pub verified_domains: Vec<Domain>,
    pub dkim_configurations: Vec<DkimKeyPair>,
    loaded_at: Instant,
}

impl TenantContext {
    pub fn verified_domain(&self, name: &str) -> Option<&Domain> {
        self.verified_domains
            .iter()
            .find(|d| d.domain_name.eq_ignore_ascii_case(name))
    }

    pub fn active_key(&self, domain_id: Uuid) -> Option<&DkimKeyPair> {
        self.dkim_configurations
            .iter()
            .find(|k| k.domain_id == domain_id && k.is_active)
    }

    /// A domain this tenant may send from: verified and holding an active key.
    pub fn sending_domain(&self, name: &str) -> Option<(&Domain, &DkimKeyPair)> {
        let domain = self.verified_domain(name)?;
        let key = self.active_key(domain.id)?;
        Some((domain, key))
    }
}

pub struct TenantContextProvider {
    pool: PgPool,
    config: TenantConfig,
    cache: DashMap<Uuid, Arc<TenantContext>>,
}

impl TenantContextProvider {
    pub fn new(pool: PgPool, config: TenantConfig) -> Self {
        Self {
            pool,
            config,
            cache: DashMap::new(),
        }
    }

    pub async fn get_context(&self, tenant_id: Uuid) -> EngineResult<Arc<TenantContext>> {
        if let Some(cached) = self.cached(tenant_id) {
            return Ok(cached);
        }

        let context = Arc::new(self.load(tenant_id).await?);
        self.cache.insert(tenant_id, Arc::clone(&context));
        Ok(context)
    }

    pub async fn get_all_active_tenant_ids(&self) -> EngineResult<Vec<Uuid>> {
        Ok(db::tenants::list_active_ids(&self.pool).await?)
    }

    pub fn invalidate(&self, tenant_id: Uuid) {
        if self.cache.remove(&tenant_id).is_some() {
            tracing::debug!(tenant_id = %tenant_id, "Tenant context invalidated");
        }
    }

    pub fn invalidate_all(&self) {
        self.cache.clear();
    }

    fn cached(&self, tenant_id: Uuid) -> Option<Arc<TenantContext>> {
        let entry = self.cache.get(&tenant_id)?;
        let context = Arc::clone(entry.value());
        drop(entry);

        if context.tenant_id != tenant_id {
            tracing::error!(
                key = %tenant_id,
                found = %context.tenant_id,
                "Tenant cache entry does not match its key, evicting"
            );
            self.cache.remove(&tenant_id);
            return None;
        }
        if context.loaded_at.elapsed() >= self.config.cache_ttl {
            self.cache.remove(&tenant_id);
            return None;
        }
        Some(context)
    }

    async fn load(&self, tenant_id: Uuid) -> EngineResult<TenantContext> {
        let tenant = db::tenants::find_by_id(&self.pool, tenant_id)
            .await?
            .ok_or(EngineError::TenantNotFound(tenant_id))?;

        let verified_domains = db::domains::list_verified_by_tenant(&self.pool, tenant.id).await?;
        let dkim_configurations = db::dkim_keys::list_active_for_tenant(&self.pool, tenant.id).await?;

        Ok(TenantContext {
            tenant_id: tenant.id,
            is_active: tenant.is_active,
            limits: self.config.limits_for(&tenant.plan),
            plan: tenant.plan,
            verified_domains,
            dkim_configurations,
            loaded_at: Instant::now(),
        })
    }

    #[cfg(test)]
    fn insert_for_test(&self, key: Uuid, context: TenantContext) {
        self.cache.insert(key, Arc::new(context));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;

    fn domain(tenant_id: Uuid, name: &str) -> Domain {
        let now = Utc::now();
        Domain {
            id: Uuid::new_v4(),
            tenant_id,
            domain_name: name.to_string(),
            is_verified: true,
            verification_token: "t".to_string(),
            dkim_enabled: true,
            spf_enabled: true,
            dmarc_enabled: true,
            dmarc_policy: None,
            verification_status: "verified".to_string(),
            consecutive_failures: 0,
            last_checked_at: None,
            verified_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    fn key(domain_id: Uuid) -> DkimKeyPair {
        DkimKeyPair {
            id: Uuid::new_v4(),
            domain_id,
            selector: "cr1".to_string(),
            private_key_enc: Vec::new(),
            public_key: "MIIB".to_string(),
            is_active: true,
            created_at: Utc::now(),
            rotated_at: None,
            retire_after: None,
        }
    }

    fn context(tenant_id: Uuid, domains: Vec<Domain>, keys: Vec<DkimKeyPair>) -> TenantContext {
        TenantContext {
            tenant_id,
            is_active: true,
            plan: "free".to_string(),
            limits: TenantConfig::default().default_plan,
            verified_domains: domains,
            dkim_configurations: keys,
            loaded_at: Instant::now(),
        }
    }

    fn provider(cache_ttl: Duration) -> TenantContextProvider {
        // Never connects: these tests only exercise the cache.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        TenantContextProvider::new(
            pool,
            TenantConfig {
                cache_ttl,
                ..TenantConfig::default()
            },
        )
    }

    #[test]
    fn sending_domain_requires_an_active_key() {
        let tenant = Uuid::new_v4();
        let signed = domain(tenant, "signed.example");
        let unsigned = domain(tenant, "unsigned.example");
        let ctx = context(tenant, vec![signed.clone(), unsigned], vec![key(signed.id)]);

        assert!(ctx.sending_domain("SIGNED.example").is_some());
        assert!(ctx.sending_domain("unsigned.example").is_none());
        assert!(ctx.sending_domain("other.example").is_none());
    }

    #[tokio::test]
    async fn mismatched_cache_entry_is_never_served() {
        let provider = provider(Duration::from_secs(300));
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        provider.insert_for_test(a, context(b, Vec::new(), Vec::new()));

        assert!(provider.cached(a).is_none());
        assert!(provider.cache.get(&a).is_none());
    }

    #[tokio::test]
    async fn expired_entries_are_dropped() {
        let provider = provider(Duration::ZERO);
        let tenant = Uuid::new_v4();
        provider.insert_for_test(tenant, context(tenant, Vec::new(), Vec::new()));
        assert!(provider.cached(tenant).is_none());

        let provider = self::provider(Duration::from_secs(300));
        provider.insert_for_test(tenant, context(tenant, Vec::new(), Vec::new()));
        assert!(provider.cached(tenant).is_some());
        provider.invalidate(tenant);
        assert!(provider.cached(tenant).is_none());
    }
}
