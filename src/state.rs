use std::sync::Arc;

use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::Config;
use crate::dkim::DkimKeyManager;
use crate::dns::TxtResolver;
use crate::models::{DeliveryStatus, VerificationStatus};
use crate::rate_limit::TenantRateLimiter;
use crate::tenant::TenantContextProvider;
use crate::transport::MailTransport;
use crate::verification::VerificationEngine;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub tenants: Arc<TenantContextProvider>,
    pub dkim: Arc<DkimKeyManager>,
    pub verification: VerificationEngine,
    pub transport: Arc<dyn MailTransport>,
    pub rate_limiter: TenantRateLimiter,
    pub events: broadcast::Sender<EngineEvent>,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: Config,
        resolver: Arc<dyn TxtResolver>,
        transport: Arc<dyn MailTransport>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let tenants = Arc::new(TenantContextProvider::new(pool.clone(), config.tenants.clone()));
        let dkim = Arc::new(DkimKeyManager::new(
            pool.clone(),
            Arc::clone(&resolver),
            config.encryption_key.clone(),
            config.dkim.clone(),
        ));
        let verification = VerificationEngine::new(
            pool.clone(),
            resolver,
            config.verification.clone(),
            Arc::clone(&tenants),
            events.clone(),
        );

        Self {
            pool,
            config,
            tenants,
            dkim,
            verification,
            transport,
            rate_limiter: TenantRateLimiter::new(),
            events,
        }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}

const EVENT_CAPACITY: usize = 1024;

/// Structured notifications for the alerting layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    DeliveryTransition {
        tenant_id: Uuid,
        job_id: Uuid,
        status: DeliveryStatus,
        attempts: i32,
        error: Option<String>,
    },
    VerificationCompleted {
        tenant_id: Uuid,
        domain_id: Uuid,
        status: VerificationStatus,
    },
    VerificationAlert {
        tenant_id: Uuid,
        domain_id: Uuid,
        domain: String,
        consecutive_failures: i32,
    },
    /// A polling cycle was skipped because of a system-class failure.
    CycleSkipped { scope: String, error: String },
}
