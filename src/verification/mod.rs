pub mod records;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream;
use futures_util::{FutureExt, StreamExt};
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::VerificationConfig;
use crate::db;
use crate::db::domains::VerificationUpdate;
use crate::db::verification_history::NewAttempt;
use crate::dns::TxtResolver;
use crate::error::{EngineError, EngineResult};
use crate::models::{Domain, RecordCheck, VerificationStatus};
use crate::state::EngineEvent;
use crate::tenant::TenantContextProvider;

pub const OWNERSHIP_CONFLICT: &str = "Domain is already verified by another tenant";

/// Per-record results of one check, before anything is persisted.
#[derive(Debug, Clone, Serialize)]
pub struct DomainCheck {
    pub spf: RecordCheck,
    pub dkim: RecordCheck,
    pub dmarc: RecordCheck,
    /// Tenant-specific proof of control over the zone.
    pub ownership: RecordCheck,
    pub dmarc_policy: Option<String>,
    /// Selector of the active key the DKIM check looked up.
    pub selector: Option<String>,
    pub status: VerificationStatus,
}

impl DomainCheck {
    /// Expected records for every evaluated check that did not pass.
    pub fn fixes(&self, domain_name: &str) -> Vec<DnsRecord> {
        let mut fixes = Vec::new();
        if self.spf.is_failing() {
            fixes.push(DnsRecord {
                kind: "spf",
                name: domain_name.to_string(),
                value: self.spf.expected.clone(),
            });
        }
        if self.dkim.is_failing() {
            if let Some(selector) = &self.selector {
                fixes.push(DnsRecord {
                    kind: "dkim",
                    name: records::dkim_record_name(selector, domain_name),
                    value: self.dkim.expected.clone(),
                });
            }
        }
        if self.dmarc.is_failing() {
            fixes.push(DnsRecord {
                kind: "dmarc",
                name: records::dmarc_record_name(domain_name),
                value: self.dmarc.expected.clone(),
            });
        }
        // The DKIM record doubles as proof when the domain signs.
        let dkim_proves = self.dkim.evaluated && self.selector.is_some();
        if self.ownership.is_failing() && !dkim_proves {
            fixes.push(DnsRecord {
                kind: "ownership",
                name: domain_name.to_string(),
                value: self.ownership.expected.clone(),
            });
        }
        fixes
    }
}

/// A DNS record the tenant has to publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsRecord {
    pub kind: &'static str,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub domain_id: Uuid,
    pub domain_name: String,
    pub status: VerificationStatus,
    pub is_verified: bool,
    pub consecutive_failures: i32,
    pub spf: RecordCheck,
    pub dkim: RecordCheck,
    pub dmarc: RecordCheck,
    pub ownership: RecordCheck,
    pub ownership_conflict: Option<String>,
    /// Records still to be published or corrected.
    pub fixes: Vec<DnsRecord>,
    pub alert_raised: bool,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepSummary {
    pub checked: usize,
    pub verified: usize,
    pub alerts: usize,
    pub errors: usize,
}

/// Combine the record checks into one domain status. Checks switched off
/// for the domain are left out; ownership is always required for
/// `Verified`.
pub fn aggregate_status(
    spf: &RecordCheck,
    dkim: &RecordCheck,
    dmarc: &RecordCheck,
    ownership: &RecordCheck,
) -> VerificationStatus {
    let evaluated: Vec<&RecordCheck> = [spf, dkim, dmarc, ownership]
        .into_iter()
        .filter(|c| c.evaluated)
        .collect();

    if ownership.valid && evaluated.iter().all(|c| c.valid) {
        VerificationStatus::Verified
    } else if evaluated.iter().any(|c| c.valid) {
        VerificationStatus::Partial
    } else if evaluated.iter().any(|c| c.is_failing() && !c.is_inconclusive()) {
        VerificationStatus::Failed
    } else {
        VerificationStatus::Pending
    }
}

pub struct VerificationEngine {
    pool: PgPool,
    resolver: Arc<dyn TxtResolver>,
    config: VerificationConfig,
    tenants: Arc<TenantContextProvider>,
    events: broadcast::Sender<EngineEvent>,
}

impl VerificationEngine {
    pub fn new(
        pool: PgPool,
        resolver: Arc<dyn TxtResolver>,
        config: VerificationConfig,
        tenants: Arc<TenantContextProvider>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            pool,
            resolver,
            config,
            tenants,
            events,
        }
    }

    pub fn spf_record(&self) -> String {
        records::spf_record(&self.config.sending_ips, self.config.spf_include.as_deref())
    }

    /// Every record a domain needs for full verification.
    pub fn required_records(&self, domain: &Domain, selector: &str, public_key: &str) -> Vec<DnsRecord> {
        vec![
            DnsRecord {
                kind: "ownership",
                name: domain.domain_name.clone(),
                value: records::ownership_record(&domain.verification_token),
            },
            DnsRecord {
                kind: "spf",
                name: domain.domain_name.clone(),
                value: self.spf_record(),
            },
            DnsRecord {
                kind: "dkim",
                name: records::dkim_record_name(selector, &domain.domain_name),
                value: records::dkim_record(public_key),
            },
            DnsRecord {
                kind: "dmarc",
                name: records::dmarc_record_name(&domain.domain_name),
                value: records::dmarc_record("quarantine", &self.config.dmarc_rua),
            },
        ]
    }

    /// Resolve and compare the domain's records. DNS failures end up in the
    /// per-record `error`; only database errors are returned. Checks switched
    /// off for the domain are reported as not evaluated.
    pub async fn check_domain(&self, domain: &Domain) -> EngineResult<DomainCheck> {
        let name = domain.domain_name.as_str();
        let key = db::dkim_keys::find_active(&self.pool, domain.id).await?;

        // SPF and the ownership token share the apex lookup.
        let apex = self.resolver.lookup_txt(name);

        let dkim = async {
            match (&key, domain.dkim_enabled) {
                (Some(key), true) => {
                    let answer = self
                        .resolver
                        .lookup_txt(&records::dkim_record_name(&key.selector, name))
                        .await;
                    records::check_dkim(&answer, &key.public_key)
                }
                (Some(key), false) => RecordCheck::not_evaluated(records::dkim_record(&key.public_key)),
                (None, true) => RecordCheck::mismatch("No active DKIM key for this domain", None),
                (None, false) => RecordCheck::not_evaluated("DKIM signing disabled"),
            }
        };

        let dmarc = async {
            let expected = records::dmarc_record("quarantine", &self.config.dmarc_rua);
            if !domain.dmarc_enabled {
                return (RecordCheck::not_evaluated(expected), None);
            }
            let answer = self.resolver.lookup_txt(&records::dmarc_record_name(name)).await;
            records::check_dmarc(&answer, &self.config.dmarc_rua)
        };

        let (apex, dkim, (dmarc, dmarc_policy)) = tokio::join!(apex, dkim, dmarc);

        let spf = if domain.spf_enabled {
            records::check_spf(
                &apex,
                &self.config.sending_ips,
                self.config.spf_include.as_deref(),
            )
        } else {
            RecordCheck::not_evaluated(self.spf_record())
        };
        let ownership = records::check_ownership(&apex, &domain.verification_token, &dkim);
        let status = aggregate_status(&spf, &dkim, &dmarc, &ownership);

        Ok(DomainCheck {
            spf,
            dkim,
            dmarc,
            ownership,
            dmarc_policy,
            selector: key.map(|k| k.selector),
            status,
        })
    }

    /// Check one domain and persist the outcome: domain state plus an
    /// appended history row, in one transaction.
    pub async fn verify_and_update_domain(
        &self,
        domain: &Domain,
        now: DateTime<Utc>,
    ) -> EngineResult<VerificationReport> {
        let check = self.check_domain(domain).await?;

        let (updated, ownership_conflict) = match self.persist(domain, &check, check.status, now).await {
            Ok(updated) => (updated, None),
            Err(EngineError::Database(sqlx::Error::Database(db_err))) if db_err.is_unique_violation() => {
                tracing::warn!(
                    tenant_id = %domain.tenant_id,
                    domain = %domain.domain_name,
                    "Verification passed but the domain is verified by another tenant"
                );
                let updated = self
                    .persist(domain, &check, VerificationStatus::Failed, now)
                    .await?;
                (updated, Some(OWNERSHIP_CONFLICT.to_string()))
            }
            Err(e) => return Err(e),
        };

        if updated.is_verified != domain.is_verified || updated.status() != domain.status() {
            self.tenants.invalidate(domain.tenant_id);
        }

        tracing::info!(
            tenant_id = %domain.tenant_id,
            domain = %domain.domain_name,
            status = updated.status().as_str(),
            spf = check.spf.valid,
            dkim = check.dkim.valid,
            dmarc = check.dmarc.valid,
            ownership = check.ownership.valid,
            "Domain verification checked"
        );
        let _ = self.events.send(EngineEvent::VerificationCompleted {
            tenant_id: domain.tenant_id,
            domain_id: domain.id,
            status: updated.status(),
        });

        let alert_raised = self.should_alert(&updated);
        if alert_raised {
            tracing::error!(
                tenant_id = %updated.tenant_id,
                domain = %updated.domain_name,
                consecutive_failures = updated.consecutive_failures,
                "Previously verified domain keeps failing verification"
            );
            let _ = self.events.send(EngineEvent::VerificationAlert {
                tenant_id: updated.tenant_id,
                domain_id: updated.id,
                domain: updated.domain_name.clone(),
                consecutive_failures: updated.consecutive_failures,
            });
        }

        Ok(VerificationReport {
            domain_id: updated.id,
            fixes: check.fixes(&updated.domain_name),
            domain_name: updated.domain_name,
            status: VerificationStatus::parse(&updated.verification_status),
            is_verified: updated.is_verified,
            consecutive_failures: updated.consecutive_failures,
            spf: check.spf,
            dkim: check.dkim,
            dmarc: check.dmarc,
            ownership: check.ownership,
            ownership_conflict,
            alert_raised,
            checked_at: now,
        })
    }

    /// Re-check every domain of every active tenant that has not been checked
    /// within half a sweep interval, with bounded concurrency.
    pub async fn run_sweep(&self, now: DateTime<Utc>) -> EngineResult<SweepSummary> {
        let half_interval = chrono::Duration::from_std(self.config.sweep_interval / 2)
            .map_err(|e| EngineError::Internal(format!("Invalid sweep interval: {e}")))?;
        let checked_before = now - half_interval;

        let mut due = Vec::new();
        for tenant_id in self.tenants.get_all_active_tenant_ids().await? {
            due.extend(db::domains::list_due_for_check(&self.pool, tenant_id, checked_before).await?);
        }

        let results: Vec<EngineResult<VerificationReport>> = stream::iter(due)
            .map(|domain| async move { self.verify_and_update_domain(&domain, now).await }.boxed())
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut summary = SweepSummary::default();
        for result in results {
            match result {
                Ok(report) => {
                    summary.checked += 1;
                    if report.status == VerificationStatus::Verified {
                        summary.verified += 1;
                    }
                    if report.alert_raised {
                        summary.alerts += 1;
                    }
                }
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!("Domain verification failed: {e}");
                }
            }
        }

        tracing::info!(
            checked = summary.checked,
            verified = summary.verified,
            alerts = summary.alerts,
            errors = summary.errors,
            "Verification sweep finished"
        );
        Ok(summary)
    }

    async fn persist(
        &self,
        domain: &Domain,
        check: &DomainCheck,
        status: VerificationStatus,
        now: DateTime<Utc>,
    ) -> EngineResult<Domain> {
        let mut tx = self.pool.begin().await?;
        let updated = db::domains::record_verification(
            &mut tx,
            domain.tenant_id,
            domain.id,
            &VerificationUpdate {
                status,
                dmarc_policy: check.dmarc_policy.as_deref(),
                checked_at: now,
            },
        )
        .await?;
        db::verification_history::append(
            &mut tx,
            &NewAttempt {
                tenant_id: domain.tenant_id,
                domain_id: domain.id,
                status,
                spf: &check.spf,
                dkim: &check.dkim,
                dmarc: &check.dmarc,
                ownership: &check.ownership,
                timestamp: now,
            },
        )
        .await?;
        tx.commit().await?;
        Ok(updated)
    }

    fn should_alert(&self, domain: &Domain) -> bool {
        domain.verified_at.is_some()
            && matches!(domain.status(), VerificationStatus::Partial | VerificationStatus::Failed)
            && domain.consecutive_failures >= self.config.alert_threshold
    }
}
