use std::num::NonZeroU32;
use std::sync::Arc;

use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use uuid::Uuid;

use crate::config::PlanLimits;

/// Per-tenant outbound send limiter. Each tenant gets its own bucket sized
/// from its plan; the bucket is rebuilt when the plan's limits change.
pub struct TenantRateLimiter {
    /// tenant_id -> (limits the bucket was built with, bucket)
    entries: DashMap<Uuid, (PlanLimits, Arc<DefaultDirectRateLimiter>)>,
}

impl Default for TenantRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl TenantRateLimiter {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Take one send permit for the tenant. Returns false when the tenant
    /// has used up its per-minute allowance.
    pub fn try_acquire(&self, tenant_id: Uuid, limits: PlanLimits) -> bool {
        self.limiter(tenant_id, limits).check().is_ok()
    }

    pub fn forget(&self, tenant_id: Uuid) {
        self.entries.remove(&tenant_id);
    }

    fn limiter(&self, tenant_id: Uuid, limits: PlanLimits) -> Arc<DefaultDirectRateLimiter> {
        if let Some(entry) = self.entries.get(&tenant_id) {
            let (built_with, limiter) = entry.value();
            if *built_with == limits {
                return Arc::clone(limiter);
            }
        }

        let per_minute = NonZeroU32::new(limits.messages_per_minute).unwrap_or(NonZeroU32::MIN);
        let limiter = Arc::new(RateLimiter::direct(Quota::per_minute(per_minute)));
        self.entries
            .insert(tenant_id, (limits, Arc::clone(&limiter)));
        limiter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(messages_per_minute: u32) -> PlanLimits {
        PlanLimits {
            messages_per_minute,
            concurrency: 1,
        }
    }

    #[test]
    fn allowance_is_per_tenant() {
        let limiter = TenantRateLimiter::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(limiter.try_acquire(a, limits(2)));
        assert!(limiter.try_acquire(a, limits(2)));
        assert!(!limiter.try_acquire(a, limits(2)));

        assert!(limiter.try_acquire(b, limits(2)));
    }

    #[test]
    fn plan_change_rebuilds_the_bucket() {
        let limiter = TenantRateLimiter::new();
        let tenant = Uuid::new_v4();

        assert!(limiter.try_acquire(tenant, limits(1)));
        assert!(!limiter.try_acquire(tenant, limits(1)));
        assert!(limiter.try_acquire(tenant, limits(10)));
    }
}
