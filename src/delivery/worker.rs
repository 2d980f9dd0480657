use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream;
use futures_util::{FutureExt, StreamExt};
use tokio::task::JoinSet;
use uuid::Uuid;

use super::message::OutboundMessage;
use super::retry::RetryPolicy;
use super::{mailbox_domain, parse_mailbox};
use crate::db;
use crate::error::{EngineError, EngineResult};
use crate::models::{DeliveryJob, DeliveryStatus};
use crate::state::{EngineEvent, SharedState};
use crate::tenant::TenantContext;
use crate::transport::{OutboundEnvelope, TransportOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Delivered,
    Retrying,
    Failed,
    Bounced,
    /// Failed before reaching the transport; no attempt charged.
    Rejected,
    /// Handed back to the queue by the rate limiter.
    Deferred,
    /// The job left `processing` under us; nothing was written.
    Lost,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    pub tenants: usize,
    pub claimed: usize,
    pub delivered: usize,
    pub retrying: usize,
    pub failed: usize,
    pub bounced: usize,
    pub rejected: usize,
    pub deferred: usize,
    pub released_stale: u64,
    pub skipped_tenants: usize,
}

impl CycleSummary {
    fn record(&mut self, outcome: JobOutcome) {
        self.claimed += 1;
        match outcome {
            JobOutcome::Delivered => self.delivered += 1,
            JobOutcome::Retrying => self.retrying += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::Bounced => self.bounced += 1,
            JobOutcome::Rejected => self.rejected += 1,
            JobOutcome::Deferred => self.deferred += 1,
            JobOutcome::Lost => {}
        }
    }

    fn merge(&mut self, other: CycleSummary) {
        self.tenants += other.tenants;
        self.claimed += other.claimed;
        self.delivered += other.delivered;
        self.retrying += other.retrying;
        self.failed += other.failed;
        self.bounced += other.bounced;
        self.rejected += other.rejected;
        self.deferred += other.deferred;
        self.released_stale += other.released_stale;
        self.skipped_tenants += other.skipped_tenants;
    }
}

/// Run every active tenant's batch concurrently. A failing tenant is logged
/// and skipped; only failing to enumerate tenants aborts the cycle.
pub async fn run_cycle(state: &SharedState, now: DateTime<Utc>) -> EngineResult<CycleSummary> {
    let tenant_ids = state.tenants.get_all_active_tenant_ids().await?;

    let mut set = JoinSet::new();
    for tenant_id in tenant_ids {
        let state = Arc::clone(state);
        set.spawn(async move { (tenant_id, run_tenant_cycle(&state, tenant_id, now).await) });
    }

    let mut summary = CycleSummary::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(tenant_summary))) => summary.merge(tenant_summary),
            Ok((tenant_id, Err(e))) => {
                summary.skipped_tenants += 1;
                tracing::error!(tenant_id = %tenant_id, "Delivery cycle skipped for tenant: {e}");
                state.emit(EngineEvent::CycleSkipped {
                    scope: format!("delivery:{tenant_id}"),
                    error: e.to_string(),
                });
            }
            Err(e) => {
                summary.skipped_tenants += 1;
                tracing::error!("Delivery task panicked: {e}");
            }
        }
    }

    if summary.claimed > 0 || summary.released_stale > 0 {
        tracing::info!(
            tenants = summary.tenants,
            claimed = summary.claimed,
            delivered = summary.delivered,
            retrying = summary.retrying,
            failed = summary.failed + summary.rejected,
            bounced = summary.bounced,
            deferred = summary.deferred,
            "Delivery cycle finished"
        );
    }
    Ok(summary)
}

/// One tenant's share of a cycle. Every query below is scoped to `tenant_id`.
pub async fn run_tenant_cycle(
    state: &SharedState,
    tenant_id: Uuid,
    now: DateTime<Utc>,
) -> EngineResult<CycleSummary> {
    let mut summary = CycleSummary {
        tenants: 1,
        ..CycleSummary::default()
    };

    let stale_after = chrono::Duration::from_std(state.config.delivery.stale_claim_after)
        .map_err(|e| EngineError::Internal(format!("Invalid stale claim window: {e}")))?;
    summary.released_stale =
        db::delivery_queue::release_stale(&state.pool, tenant_id, now - stale_after, now).await?;
    if summary.released_stale > 0 {
        tracing::warn!(
            tenant_id = %tenant_id,
            released = summary.released_stale,
            "Released stale delivery claims"
        );
    }

    let context = state.tenants.get_context(tenant_id).await?;
    if !context.is_active {
        return Ok(summary);
    }

    let jobs = db::delivery_queue::claim_batch(
        &state.pool,
        tenant_id,
        now,
        state.config.delivery.batch_size,
    )
    .await?;
    if jobs.is_empty() {
        return Ok(summary);
    }

    let results: Vec<EngineResult<JobOutcome>> = stream::iter(jobs)
        .map(|job| process_job(state, &context, job, now).boxed())
        .buffered(context.limits.concurrency.max(1))
        .collect()
        .await;

    let mut first_error = None;
    for result in results {
        match result {
            Ok(outcome) => summary.record(outcome),
            Err(e) => {
                tracing::error!(tenant_id = %tenant_id, "Delivery write-back failed: {e}");
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) if summary.claimed == 0 => Err(e),
        _ => Ok(summary),
    }
}

async fn process_job(
    state: &SharedState,
    context: &TenantContext,
    job: DeliveryJob,
    now: DateTime<Utc>,
) -> EngineResult<JobOutcome> {
    let Some(from) = parse_mailbox(&job.from_address) else {
        return reject(state, &job, now, "Invalid sender address").await;
    };
    let Some(to) = parse_mailbox(&job.to_address) else {
        return reject(state, &job, now, "Invalid recipient address").await;
    };
    let domain_name = mailbox_domain(&from);

    let Some((domain, _key)) = context.sending_domain(&domain_name) else {
        let error = if context.verified_domain(&domain_name).is_some() {
            format!("Sender domain {domain_name} has no active DKIM key")
        } else {
            format!("Sender domain {domain_name} is not verified for this tenant (domain ownership check failed)")
        };
        return reject(state, &job, now, &error).await;
    };

    if !state.rate_limiter.try_acquire(job.tenant_id, context.limits) {
        db::delivery_queue::release(&state.pool, job.tenant_id, job.id, now).await?;
        tracing::debug!(
            tenant_id = %job.tenant_id,
            job_id = %job.id,
            "Rate limit reached, job returned to queue"
        );
        return Ok(JobOutcome::Deferred);
    }

    let mut message = match OutboundMessage::from_job(&job, &from, &to, &domain.domain_name) {
        Ok(message) => message,
        Err(e) => return reject(state, &job, now, &e).await,
    };
    if domain.dkim_enabled {
        message = match state.dkim.sign(&message, domain).await {
            Ok(signed) => signed,
            Err(e) if e.is_system() => {
                db::delivery_queue::release(&state.pool, job.tenant_id, job.id, now).await?;
                return Err(e);
            }
            Err(e) => return reject(state, &job, now, &format!("DKIM signing failed: {e}")).await,
        };
    }

    let envelope = OutboundEnvelope {
        from: from.email.to_string(),
        to: vec![to.email.to_string()],
    };
    let outcome = match tokio::time::timeout(
        state.config.delivery.send_timeout,
        state.transport.send(&envelope, &message.to_bytes()),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => TransportOutcome::Temporary("SMTP send timed out".to_string()),
    };

    record_outcome(state, &job, outcome, now).await
}

async fn record_outcome(
    state: &SharedState,
    job: &DeliveryJob,
    outcome: TransportOutcome,
    now: DateTime<Utc>,
) -> EngineResult<JobOutcome> {
    let pool = &state.pool;
    let attempts = job.attempts + 1;

    let (updated, result) = match outcome {
        TransportOutcome::Delivered => (
            db::delivery_queue::mark_delivered(pool, job.tenant_id, job.id, now).await?,
            JobOutcome::Delivered,
        ),
        TransportOutcome::Permanent(error) => (
            db::delivery_queue::mark_attempt_terminal(
                pool,
                job.tenant_id,
                job.id,
                DeliveryStatus::Bounced.as_str(),
                now,
                &error,
            )
            .await?,
            JobOutcome::Bounced,
        ),
        TransportOutcome::Temporary(error) if RetryPolicy::is_exhausted(attempts, job.max_attempts) => (
            db::delivery_queue::mark_attempt_terminal(
                pool,
                job.tenant_id,
                job.id,
                DeliveryStatus::Failed.as_str(),
                now,
                &error,
            )
            .await?,
            JobOutcome::Failed,
        ),
        TransportOutcome::Temporary(error) => {
            let policy = RetryPolicy::new(job.max_attempts, state.config.delivery.retry_jitter_secs);
            let next_attempt = policy.next_attempt_at(now, job.attempts);
            (
                db::delivery_queue::schedule_retry(pool, job.tenant_id, job.id, now, next_attempt, &error)
                    .await?,
                JobOutcome::Retrying,
            )
        }
    };

    Ok(announce(state, job, updated, result))
}

async fn reject(
    state: &SharedState,
    job: &DeliveryJob,
    now: DateTime<Utc>,
    error: &str,
) -> EngineResult<JobOutcome> {
    let updated = db::delivery_queue::reject(&state.pool, job.tenant_id, job.id, now, error).await?;
    Ok(announce(state, job, updated, JobOutcome::Rejected))
}

fn announce(
    state: &SharedState,
    job: &DeliveryJob,
    updated: Option<DeliveryJob>,
    outcome: JobOutcome,
) -> JobOutcome {
    let Some(updated) = updated else {
        tracing::warn!(
            tenant_id = %job.tenant_id,
            job_id = %job.id,
            "Job was no longer in processing, result discarded"
        );
        return JobOutcome::Lost;
    };

    let status = updated.status().unwrap_or(DeliveryStatus::Failed);
    match outcome {
        JobOutcome::Delivered | JobOutcome::Retrying => tracing::info!(
            tenant_id = %updated.tenant_id,
            job_id = %updated.id,
            attempts = updated.attempts,
            outcome = status.as_str(),
            next_attempt = ?updated.next_attempt,
            "Delivery attempt recorded"
        ),
        _ => tracing::warn!(
            tenant_id = %updated.tenant_id,
            job_id = %updated.id,
            attempts = updated.attempts,
            outcome = status.as_str(),
            error = updated.error_message.as_deref().unwrap_or_default(),
            "Delivery attempt recorded"
        ),
    }

    state.emit(EngineEvent::DeliveryTransition {
        tenant_id: updated.tenant_id,
        job_id: updated.id,
        status,
        attempts: updated.attempts,
        error: updated.error_message,
    });
    outcome
}
