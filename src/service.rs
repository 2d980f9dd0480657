use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use lettre::message::Mailbox;
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::db::delivery_queue::NewJob;
use crate::delivery::{mailbox_domain, parse_mailbox};
use crate::delivery::worker::{self, CycleSummary};
use crate::dkim::selector_for;
use crate::dns::TxtResolver;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    DeliveryJob, DkimKeyPair, Domain, MessageHeader, NewMessage, Tenant, VerificationAttempt,
    VerificationStatus,
};
use crate::scheduler::Scheduler;
use crate::state::{AppState, EngineEvent, SharedState};
use crate::transport::MailTransport;
use crate::verification::records::{self, normalize_domain};
use crate::verification::{DnsRecord, SweepSummary, VerificationReport};

/// A freshly registered domain and the records its owner must publish.
#[derive(Debug, Clone, Serialize)]
pub struct DomainSetup {
    pub domain: Domain,
    pub selector: String,
    pub records: Vec<DnsRecord>,
}

/// A pending key rotation: publish `record`, then confirm `selector`.
#[derive(Debug, Clone, Serialize)]
pub struct RotationTicket {
    pub domain_id: Uuid,
    pub selector: String,
    pub record: DnsRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainStatus {
    pub domain_id: Uuid,
    pub domain_name: String,
    pub is_verified: bool,
    pub status: VerificationStatus,
    pub verified_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub consecutive_failures: i32,
    pub active_selector: Option<String>,
    /// Per-record results of the most recent check, if any.
    pub last_attempt: Option<VerificationAttempt>,
}

pub struct Engine {
    state: SharedState,
    scheduler: Mutex<Option<Scheduler>>,
}

impl Engine {
    pub fn init(
        pool: PgPool,
        config: Config,
        resolver: Arc<dyn TxtResolver>,
        transport: Arc<dyn MailTransport>,
    ) -> Self {
        Self {
            state: Arc::new(AppState::new(pool, config, resolver, transport)),
            scheduler: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Start the polling loops. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut scheduler = self.scheduler.lock().unwrap_or_else(|e| e.into_inner());
        if scheduler.is_none() {
            *scheduler = Some(Scheduler::start(Arc::clone(&self.state)));
        }
    }

    pub async fn shutdown(&self) {
        let scheduler = self
            .scheduler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.state.events.subscribe()
    }

    /// One delivery polling cycle across all active tenants.
    pub async fn run_delivery_cycle(&self, now: DateTime<Utc>) -> EngineResult<CycleSummary> {
        worker::run_cycle(&self.state, now).await
    }

    pub async fn run_tenant_delivery_cycle(
        &self,
        tenant_id: Uuid,
        now: DateTime<Utc>,
    ) -> EngineResult<CycleSummary> {
        worker::run_tenant_cycle(&self.state, tenant_id, now).await
    }

    /// One verification sweep, followed by purging keys past retirement.
    pub async fn run_verification_sweep(&self, now: DateTime<Utc>) -> EngineResult<SweepSummary> {
        let summary = self.state.verification.run_sweep(now).await?;
        self.state.dkim.purge_retired(now).await?;
        Ok(summary)
    }

    // --- tenants ---

    pub async fn create_tenant(&self, name: &str, slug: &str, plan: &str) -> EngineResult<Tenant> {
        db::tenants::create(&self.state.pool, name, slug, plan)
            .await
            .map_err(|e| conflict_on_unique(e, format!("Tenant slug '{slug}' is taken")))
    }

    pub async fn set_tenant_active(&self, tenant_id: Uuid, is_active: bool) -> EngineResult<Tenant> {
        let tenant = db::tenants::set_active(&self.state.pool, tenant_id, is_active)
            .await?
            .ok_or(EngineError::TenantNotFound(tenant_id))?;
        self.state.tenants.invalidate(tenant_id);
        tracing::info!(tenant_id = %tenant_id, is_active, "Tenant active flag changed");
        Ok(tenant)
    }

    pub async fn set_tenant_plan(&self, tenant_id: Uuid, plan: &str) -> EngineResult<Tenant> {
        let tenant = db::tenants::set_plan(&self.state.pool, tenant_id, plan)
            .await?
            .ok_or(EngineError::TenantNotFound(tenant_id))?;
        self.state.tenants.invalidate(tenant_id);
        self.state.rate_limiter.forget(tenant_id);
        tracing::info!(tenant_id = %tenant_id, plan, "Tenant plan changed");
        Ok(tenant)
    }

    // --- domains ---

    /// Register a sending domain, mint and activate its first DKIM key, and
    /// return the DNS records to publish.
    pub async fn register_domain(&self, tenant_id: Uuid, name: &str) -> EngineResult<DomainSetup> {
        self.state.tenants.get_context(tenant_id).await?;
        let name = normalize_domain(name)
            .ok_or_else(|| EngineError::BadRequest(format!("Invalid domain name '{name}'")))?;

        let pool = &self.state.pool;
        if db::domains::verified_elsewhere(pool, tenant_id, &name).await? {
            return Err(EngineError::Conflict(format!(
                "Domain {name} is verified by another tenant"
            )));
        }

        let token = hex::encode(rand::random::<[u8; 16]>());
        let domain = db::domains::create(pool, tenant_id, &name, &token)
            .await
            .map_err(|e| conflict_on_unique(e, format!("Domain {name} is already registered")))?;

        let selector = selector_for(
            &self.state.config.dkim.selector_prefix,
            Utc::now(),
            rand::random(),
        );
        let pair = self.state.dkim.generate_key_pair(&domain, &selector).await?;
        self.state.dkim.activate(domain.id, &pair.selector).await?;

        let records = self
            .state
            .verification
            .required_records(&domain, &pair.selector, &pair.public_key);
        tracing::info!(tenant_id = %tenant_id, domain = %name, "Domain registered");

        Ok(DomainSetup {
            domain,
            selector: pair.selector,
            records,
        })
    }

    pub async fn list_domains(&self, tenant_id: Uuid) -> EngineResult<Vec<Domain>> {
        Ok(db::domains::list_by_tenant(&self.state.pool, tenant_id).await?)
    }

    /// Toggle which authentication records a domain is checked and signed for.
    pub async fn set_domain_authentication(
        &self,
        tenant_id: Uuid,
        domain_id: Uuid,
        spf_enabled: bool,
        dkim_enabled: bool,
        dmarc_enabled: bool,
    ) -> EngineResult<Domain> {
        let domain = db::domains::set_auth_flags(
            &self.state.pool,
            tenant_id,
            domain_id,
            spf_enabled,
            dkim_enabled,
            dmarc_enabled,
        )
        .await?
        .ok_or_else(|| EngineError::NotFound("Domain not found".to_string()))?;
        self.state.tenants.invalidate(tenant_id);
        Ok(domain)
    }

    pub async fn verify_domain_now(
        &self,
        tenant_id: Uuid,
        domain_id: Uuid,
    ) -> EngineResult<VerificationReport> {
        let domain = self.domain(tenant_id, domain_id).await?;
        self.state
            .verification
            .verify_and_update_domain(&domain, Utc::now())
            .await
    }

    pub async fn get_domain_status(&self, tenant_id: Uuid, domain_id: Uuid) -> EngineResult<DomainStatus> {
        let domain = self.domain(tenant_id, domain_id).await?;
        let pool = &self.state.pool;
        let active = db::dkim_keys::find_active(pool, domain.id).await?;
        let last_attempt = db::verification_history::list_by_domain(pool, tenant_id, domain.id, 1)
            .await?
            .into_iter()
            .next();

        Ok(DomainStatus {
            domain_id: domain.id,
            status: domain.status(),
            domain_name: domain.domain_name,
            is_verified: domain.is_verified,
            verified_at: domain.verified_at,
            last_checked_at: domain.last_checked_at,
            consecutive_failures: domain.consecutive_failures,
            active_selector: active.map(|k| k.selector),
            last_attempt,
        })
    }

    pub async fn list_verification_history(
        &self,
        tenant_id: Uuid,
        domain_id: Uuid,
        limit: i64,
    ) -> EngineResult<Vec<VerificationAttempt>> {
        let domain = self.domain(tenant_id, domain_id).await?;
        Ok(db::verification_history::list_by_domain(&self.state.pool, tenant_id, domain.id, limit).await?)
    }

    // --- dkim ---

    /// Mint a new key for the domain. The current key keeps signing until
    /// the rotation is confirmed.
    pub async fn rotate_dkim_key(&self, tenant_id: Uuid, domain_id: Uuid) -> EngineResult<RotationTicket> {
        let domain = self.domain(tenant_id, domain_id).await?;
        let pair = self.state.dkim.begin_rotation(&domain).await?;

        Ok(RotationTicket {
            domain_id: domain.id,
            record: DnsRecord {
                kind: "dkim",
                name: records::dkim_record_name(&pair.selector, &domain.domain_name),
                value: records::dkim_record(&pair.public_key),
            },
            selector: pair.selector,
        })
    }

    /// Activate a rotated key once its record resolves.
    pub async fn confirm_dkim_rotation(
        &self,
        tenant_id: Uuid,
        domain_id: Uuid,
        selector: &str,
    ) -> EngineResult<DkimKeyPair> {
        let domain = self.domain(tenant_id, domain_id).await?;
        let pair = self.state.dkim.complete_rotation(&domain, selector).await?;
        self.state.tenants.invalidate(tenant_id);
        Ok(pair)
    }

    pub async fn list_dkim_keys(&self, tenant_id: Uuid, domain_id: Uuid) -> EngineResult<Vec<DkimKeyPair>> {
        let domain = self.domain(tenant_id, domain_id).await?;
        Ok(db::dkim_keys::list_by_domain(&self.state.pool, domain.id).await?)
    }

    // --- delivery ---

    pub async fn enqueue_delivery(&self, tenant_id: Uuid, message: NewMessage) -> EngineResult<Uuid> {
        let context = self.state.tenants.get_context(tenant_id).await?;
        if !context.is_active {
            return Err(EngineError::TenantSuspended(tenant_id));
        }

        let sender = validate_message(&message)?;
        let sender_domain = mailbox_domain(&sender);
        if self.state.config.delivery.require_verified_sender
            && context.sending_domain(&sender_domain).is_none()
        {
            return Err(EngineError::BadRequest(format!(
                "Sender domain {sender_domain} is not verified with an active DKIM key"
            )));
        }

        let message_id = message
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().simple().to_string());
        let job = db::delivery_queue::enqueue(
            &self.state.pool,
            &NewJob {
                tenant_id,
                message_id: &message_id,
                from_address: message.from_address.trim(),
                to_address: message.to_address.trim(),
                subject: &message.subject,
                body: &message.body,
                headers: &message.headers,
                priority: message.priority,
                max_attempts: self.state.config.delivery.max_attempts,
            },
        )
        .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            job_id = %job.id,
            priority = job.priority,
            "Delivery enqueued"
        );
        Ok(job.id)
    }

    pub async fn get_delivery_status(&self, tenant_id: Uuid, job_id: Uuid) -> EngineResult<DeliveryJob> {
        db::delivery_queue::find_by_id(&self.state.pool, tenant_id, job_id)
            .await?
            .ok_or_else(|| EngineError::NotFound("Delivery job not found".to_string()))
    }

    pub async fn list_deliveries(
        &self,
        tenant_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> EngineResult<Vec<DeliveryJob>> {
        Ok(db::delivery_queue::list_by_tenant(&self.state.pool, tenant_id, limit, offset).await?)
    }

    async fn domain(&self, tenant_id: Uuid, domain_id: Uuid) -> EngineResult<Domain> {
        db::domains::find_by_id(&self.state.pool, tenant_id, domain_id)
            .await?
            .ok_or_else(|| EngineError::NotFound("Domain not found".to_string()))
    }
}

fn conflict_on_unique(err: sqlx::Error, message: String) -> EngineError {
    match err {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            EngineError::Conflict(message)
        }
        _ => EngineError::Database(err),
    }
}

fn has_line_break(s: &str) -> bool {
    s.contains(['\r', '\n'])
}

/// Structural checks on a submitted message; the sender domain is checked
/// separately against the tenant's context.
/// Check a message before it is queued and return its parsed sender.
pub fn validate_message(message: &NewMessage) -> EngineResult<Mailbox> {
    let bad = |msg: &str| Err(EngineError::BadRequest(msg.to_string()));

    let Some(sender) = parse_mailbox(&message.from_address) else {
        return bad("Invalid sender address");
    };
    if parse_mailbox(&message.to_address).is_none() {
        return bad("Invalid recipient address");
    }
    if message.subject.trim().is_empty() {
        return bad("Subject is required");
    }
    if has_line_break(&message.subject) {
        return bad("Subject must be a single line");
    }
    if let Some(id) = &message.message_id {
        if id.trim().is_empty() || has_line_break(id) || id.contains(char::is_whitespace) {
            return bad("Invalid message id");
        }
    }
    for MessageHeader { name, value } in &message.headers {
        let valid_name = !name.is_empty()
            && name.len() <= 76
            && name.bytes().all(|b| b.is_ascii_graphic() && b != b':');
        if !valid_name {
            return Err(EngineError::BadRequest(format!("Invalid header name '{name}'")));
        }
        if has_line_break(value) {
            return Err(EngineError::BadRequest(format!(
                "Header '{name}' must not contain line breaks"
            )));
        }
    }
    Ok(sender)
}
