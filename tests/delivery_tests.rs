mod common;

use chrono::Duration;

use courier::db::delivery_queue::{claim_batch, release_stale};
use courier::error::EngineError;
use courier::models::{DeliveryStatus, MessageHeader};
use courier::transport::TransportOutcome;

// ── Happy path ──────────────────────────────────────────────────

#[tokio::test]
async fn verified_sender_is_signed_and_delivered() {
    let t = common::spawn_engine().await;
    let tenant = t.create_tenant("acme", "free").await;
    let setup = t.verified_domain(tenant.id, "verified.example").await;

    let job_id = t.enqueue(tenant.id, "no-reply@verified.example", "user@example.com").await;
    let summary = t.engine.run_delivery_cycle(common::now()).await.unwrap();
    assert_eq!(summary.delivered, 1);

    let job = t.job_status(tenant.id, job_id).await;
    assert_eq!(job.status(), Some(DeliveryStatus::Delivered));
    assert_eq!(job.attempts, 1);
    assert!(job.delivered_at.is_some());
    assert!(job.error_message.is_none());

    let sent = t.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].envelope.to, vec!["user@example.com".to_string()]);
    let text = sent[0].text();
    assert!(text.starts_with("DKIM-Signature: v=1; a=rsa-sha256; c=relaxed/relaxed; d=verified.example;"));
    assert!(text.contains(&format!("s={};", setup.selector)));
    assert!(text.contains("\r\nFrom: no-reply@verified.example\r\n"));

    common::cleanup(t).await;
}

#[tokio::test]
async fn unsigned_domain_sends_without_signature() {
    let t = common::spawn_engine().await;
    let tenant = t.create_tenant("acme", "free").await;
    let setup = t.verified_domain(tenant.id, "plain.example").await;
    t.engine
        .set_domain_authentication(tenant.id, setup.domain.id, true, false, true)
        .await
        .unwrap();

    let job_id = t.enqueue(tenant.id, "no-reply@plain.example", "user@example.com").await;
    t.engine.run_delivery_cycle(common::now()).await.unwrap();

    assert_eq!(t.job_status(tenant.id, job_id).await.status(), Some(DeliveryStatus::Delivered));
    assert!(!t.transport.sent()[0].text().contains("DKIM-Signature"));

    common::cleanup(t).await;
}

// ── Domain gate ─────────────────────────────────────────────────

#[tokio::test]
async fn unverified_sender_fails_without_reaching_transport() {
    let t = common::spawn_engine().await;
    let tenant = t.create_tenant("acme", "free").await;
    t.register_domain(tenant.id, "unverified.example").await;

    let job_id = t.enqueue(tenant.id, "no-reply@unverified.example", "user@example.com").await;
    let summary = t.engine.run_delivery_cycle(common::now()).await.unwrap();
    assert_eq!(summary.rejected, 1);

    let job = t.job_status(tenant.id, job_id).await;
    assert_eq!(job.status(), Some(DeliveryStatus::Failed));
    assert_eq!(job.attempts, 0);
    let error = job.error_message.unwrap();
    assert!(error.contains("not verified"), "unexpected error: {error}");
    assert!(error.contains("ownership"), "unexpected error: {error}");
    assert_eq!(t.transport.sent_count(), 0);

    common::cleanup(t).await;
}

#[tokio::test]
async fn another_tenants_domain_cannot_be_used() {
    let t = common::spawn_engine().await;
    let owner = t.create_tenant("owner", "free").await;
    let intruder = t.create_tenant("intruder", "free").await;
    t.verified_domain(owner.id, "owned.example").await;

    let job_id = t.enqueue(intruder.id, "ceo@owned.example", "victim@example.com").await;
    t.engine.run_delivery_cycle(common::now()).await.unwrap();

    let job = t.job_status(intruder.id, job_id).await;
    assert_eq!(job.status(), Some(DeliveryStatus::Failed));
    assert_eq!(job.attempts, 0);
    assert_eq!(t.transport.sent_count(), 0);

    common::cleanup(t).await;
}

#[tokio::test]
async fn domain_that_loses_verification_after_enqueue_is_not_used() {
    let t = common::spawn_engine().await;
    let tenant = t.create_tenant("acme", "free").await;
    let setup = t.verified_domain(tenant.id, "flaky.example").await;

    let job_id = t.enqueue(tenant.id, "no-reply@flaky.example", "user@example.com").await;

    let dkim = setup.records.iter().find(|r| r.kind == "dkim").unwrap();
    t.resolver.remove(&dkim.name);
    let report = t.engine.verify_domain_now(tenant.id, setup.domain.id).await.unwrap();
    assert!(!report.is_verified);

    t.engine.run_delivery_cycle(common::now()).await.unwrap();
    let job = t.job_status(tenant.id, job_id).await;
    assert_eq!(job.status(), Some(DeliveryStatus::Failed));
    assert_eq!(t.transport.sent_count(), 0);

    common::cleanup(t).await;
}

// ── Tenant isolation ────────────────────────────────────────────

#[tokio::test]
async fn claim_cycle_for_one_tenant_leaves_others_untouched() {
    let t = common::spawn_engine().await;
    let a = t.create_tenant("tenant-a", "free").await;
    let b = t.create_tenant("tenant-b", "free").await;
    t.verified_domain(a.id, "a.example").await;
    t.verified_domain(b.id, "b.example").await;

    let a_job = t.enqueue(a.id, "no-reply@a.example", "user@example.com").await;
    let mut b_jobs = Vec::new();
    for _ in 0..3 {
        b_jobs.push(t.enqueue(b.id, "no-reply@b.example", "user@example.com").await);
    }
    let mut before = Vec::new();
    for id in &b_jobs {
        before.push(t.job_status(b.id, *id).await);
    }

    t.engine
        .run_tenant_delivery_cycle(a.id, common::now())
        .await
        .unwrap();

    assert_eq!(t.job_status(a.id, a_job).await.status(), Some(DeliveryStatus::Delivered));
    for (id, old) in b_jobs.iter().zip(before) {
        let current = t.job_status(b.id, *id).await;
        assert_eq!(current.status, old.status);
        assert_eq!(current.attempts, old.attempts);
        assert_eq!(current.updated_at, old.updated_at);
    }
    assert!(t.transport.sent().iter().all(|m| m.envelope.from == "no-reply@a.example"));

    common::cleanup(t).await;
}

#[tokio::test]
async fn jobs_are_invisible_to_other_tenants() {
    let t = common::spawn_engine().await;
    let a = t.create_tenant("tenant-a", "free").await;
    let b = t.create_tenant("tenant-b", "free").await;

    t.register_domain(a.id, "a.example").await;

    let job_id = t.enqueue(a.id, "no-reply@a.example", "user@example.com").await;
    let result = t.engine.get_delivery_status(b.id, job_id).await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
    assert!(t.engine.list_deliveries(b.id, 10, 0).await.unwrap().is_empty());

    let a_domains = t.engine.list_domains(a.id).await.unwrap();
    assert_eq!(a_domains.len(), 1);
    assert_eq!(a_domains[0].domain_name, "a.example");
    assert!(t.engine.list_domains(b.id).await.unwrap().is_empty());

    common::cleanup(t).await;
}

// ── Retries ─────────────────────────────────────────────────────

#[tokio::test]
async fn transient_failures_back_off_exponentially_then_fail() {
    let t = common::spawn_engine().await;
    let tenant = t.create_tenant("acme", "free").await;
    t.verified_domain(tenant.id, "verified.example").await;
    for _ in 0..5 {
        t.transport
            .push_outcome(TransportOutcome::Temporary("421 try again later".to_string()));
    }

    let job_id = t.enqueue(tenant.id, "no-reply@verified.example", "user@example.com").await;
    let mut now = common::now();

    for attempt in 1..5 {
        t.engine.run_delivery_cycle(now).await.unwrap();
        let job = t.job_status(tenant.id, job_id).await;
        assert_eq!(job.status(), Some(DeliveryStatus::Pending));
        assert_eq!(job.attempts, attempt);
        let expected = now + Duration::minutes(1 << (attempt - 1));
        assert_eq!(job.next_attempt, Some(expected));
        assert_eq!(job.error_message.as_deref(), Some("421 try again later"));

        // Not eligible a second before the backoff elapses.
        let early = t.engine.run_delivery_cycle(expected - Duration::seconds(1)).await.unwrap();
        assert_eq!(early.claimed, 0);
        now = expected;
    }

    t.engine.run_delivery_cycle(now).await.unwrap();
    let job = t.job_status(tenant.id, job_id).await;
    assert_eq!(job.status(), Some(DeliveryStatus::Failed));
    assert_eq!(job.attempts, 5);
    assert_eq!(t.transport.sent_count(), 5);

    common::cleanup(t).await;
}

#[tokio::test]
async fn max_attempts_is_configurable() {
    let t = common::spawn_engine_with(|c| c.delivery.max_attempts = 2).await;
    let tenant = t.create_tenant("acme", "free").await;
    t.verified_domain(tenant.id, "verified.example").await;
    t.transport.push_outcome(TransportOutcome::Temporary("timeout".to_string()));
    t.transport.push_outcome(TransportOutcome::Temporary("timeout".to_string()));

    let job_id = t.enqueue(tenant.id, "no-reply@verified.example", "user@example.com").await;
    let now = common::now();
    t.engine.run_delivery_cycle(now).await.unwrap();
    t.engine.run_delivery_cycle(now + Duration::minutes(1)).await.unwrap();

    let job = t.job_status(tenant.id, job_id).await;
    assert_eq!(job.status(), Some(DeliveryStatus::Failed));
    assert_eq!(job.attempts, 2);

    common::cleanup(t).await;
}

#[tokio::test]
async fn permanent_rejection_bounces_on_first_attempt() {
    let t = common::spawn_engine().await;
    let tenant = t.create_tenant("acme", "free").await;
    t.verified_domain(tenant.id, "verified.example").await;
    t.transport
        .push_outcome(TransportOutcome::Permanent("550 no such user".to_string()));

    let job_id = t.enqueue(tenant.id, "no-reply@verified.example", "ghost@example.com").await;
    let summary = t.engine.run_delivery_cycle(common::now()).await.unwrap();
    assert_eq!(summary.bounced, 1);

    let job = t.job_status(tenant.id, job_id).await;
    assert_eq!(job.status(), Some(DeliveryStatus::Bounced));
    assert_eq!(job.attempts, 1);
    assert!(job.next_attempt.is_none());
    assert_eq!(job.error_message.as_deref(), Some("550 no such user"));

    common::cleanup(t).await;
}

// ── Ordering and backpressure ───────────────────────────────────

#[tokio::test]
async fn higher_priority_is_attempted_first() {
    let t = common::spawn_engine().await;
    let tenant = t.create_tenant("acme", "serial").await;
    t.verified_domain(tenant.id, "verified.example").await;

    let mut low = common::message("no-reply@verified.example", "first-in@example.com");
    low.priority = 0;
    let mut high = common::message("no-reply@verified.example", "urgent@example.com");
    high.priority = 10;
    let later = common::message("no-reply@verified.example", "second-in@example.com");

    t.engine.enqueue_delivery(tenant.id, low).await.unwrap();
    t.engine.enqueue_delivery(tenant.id, high).await.unwrap();
    t.engine.enqueue_delivery(tenant.id, later).await.unwrap();

    t.engine.run_delivery_cycle(common::now()).await.unwrap();
    let order: Vec<String> = t
        .transport
        .sent()
        .iter()
        .map(|m| m.envelope.to[0].clone())
        .collect();
    assert_eq!(
        order,
        vec!["urgent@example.com", "first-in@example.com", "second-in@example.com"]
    );

    common::cleanup(t).await;
}

#[tokio::test]
async fn batch_size_caps_claims_per_cycle() {
    let t = common::spawn_engine_with(|c| c.delivery.batch_size = 2).await;
    let tenant = t.create_tenant("acme", "free").await;
    t.verified_domain(tenant.id, "verified.example").await;
    for _ in 0..5 {
        t.enqueue(tenant.id, "no-reply@verified.example", "user@example.com").await;
    }

    let now = common::now();
    assert_eq!(t.engine.run_delivery_cycle(now).await.unwrap().claimed, 2);
    assert_eq!(t.engine.run_delivery_cycle(now).await.unwrap().claimed, 2);
    assert_eq!(t.engine.run_delivery_cycle(now).await.unwrap().claimed, 1);

    common::cleanup(t).await;
}

#[tokio::test]
async fn claim_batch_takes_at_most_limit_in_priority_order() {
    let t = common::spawn_engine().await;
    let tenant = t.create_tenant("acme", "free").await;
    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(t.enqueue(tenant.id, "no-reply@verified.example", "user@example.com").await);
    }
    sqlx::query("UPDATE email_delivery_queue SET priority = 9 WHERE id = $1")
        .bind(ids[4])
        .execute(&t.pool)
        .await
        .unwrap();

    let now = common::now();
    let claimed = claim_batch(&t.pool, tenant.id, now, 2).await.unwrap();
    assert_eq!(claimed.len(), 2);
    assert_eq!(claimed[0].id, ids[4]);
    assert_eq!(claimed[1].id, ids[0]);

    let rest = claim_batch(&t.pool, tenant.id, now, 10).await.unwrap();
    assert_eq!(rest.len(), 3);
    assert!(claim_batch(&t.pool, tenant.id, now, 10).await.unwrap().is_empty());

    common::cleanup(t).await;
}

#[tokio::test]
async fn rate_limited_jobs_return_to_queue_without_an_attempt() {
    let t = common::spawn_engine().await;
    let tenant = t.create_tenant("acme", "tiny").await;
    t.verified_domain(tenant.id, "verified.example").await;

    let mut jobs = Vec::new();
    for _ in 0..3 {
        jobs.push(t.enqueue(tenant.id, "no-reply@verified.example", "user@example.com").await);
    }

    let summary = t.engine.run_delivery_cycle(common::now()).await.unwrap();
    assert_eq!(summary.delivered, 2);
    assert_eq!(summary.deferred, 1);

    let mut pending = 0;
    for id in jobs {
        let job = t.job_status(tenant.id, id).await;
        if job.status() == Some(DeliveryStatus::Pending) {
            pending += 1;
            assert_eq!(job.attempts, 0);
        }
    }
    assert_eq!(pending, 1);

    common::cleanup(t).await;
}

#[tokio::test]
async fn plan_upgrade_lifts_the_rate_limit() {
    let t = common::spawn_engine().await;
    let tenant = t.create_tenant("acme", "tiny").await;
    t.verified_domain(tenant.id, "verified.example").await;
    for _ in 0..3 {
        t.enqueue(tenant.id, "no-reply@verified.example", "user@example.com").await;
    }

    let summary = t.engine.run_delivery_cycle(common::now()).await.unwrap();
    assert_eq!(summary.deferred, 1);

    let upgraded = t.engine.set_tenant_plan(tenant.id, "free").await.unwrap();
    assert_eq!(upgraded.plan, "free");

    let summary = t.engine.run_delivery_cycle(common::now()).await.unwrap();
    assert_eq!(summary.delivered, 1);
    assert_eq!(summary.deferred, 0);

    let jobs = t.engine.list_deliveries(tenant.id, 10, 0).await.unwrap();
    assert_eq!(jobs.len(), 3);
    assert!(jobs.iter().all(|j| j.status() == Some(DeliveryStatus::Delivered)));

    common::cleanup(t).await;
}

#[tokio::test]
async fn stale_claims_are_recovered() {
    let t = common::spawn_engine().await;
    let tenant = t.create_tenant("acme", "free").await;
    t.verified_domain(tenant.id, "verified.example").await;
    let job_id = t.enqueue(tenant.id, "no-reply@verified.example", "user@example.com").await;

    sqlx::query(
        "UPDATE email_delivery_queue SET status = 'processing', updated_at = now() - interval '1 hour'
         WHERE id = $1",
    )
    .bind(job_id)
    .execute(&t.pool)
    .await
    .unwrap();

    let now = common::now();
    let released = release_stale(&t.pool, tenant.id, now - Duration::minutes(15), now)
        .await
        .unwrap();
    assert_eq!(released, 1);
    let job = t.job_status(tenant.id, job_id).await;
    assert_eq!(job.status(), Some(DeliveryStatus::Pending));
    assert_eq!(job.updated_at, now);

    t.engine.run_delivery_cycle(now).await.unwrap();
    assert_eq!(t.job_status(tenant.id, job_id).await.status(), Some(DeliveryStatus::Delivered));

    common::cleanup(t).await;
}

// ── Enqueue validation ──────────────────────────────────────────

#[tokio::test]
async fn suspended_tenant_cannot_enqueue_or_send() {
    let t = common::spawn_engine().await;
    let tenant = t.create_tenant("acme", "free").await;
    t.verified_domain(tenant.id, "verified.example").await;
    let job_id = t.enqueue(tenant.id, "no-reply@verified.example", "user@example.com").await;

    t.engine.set_tenant_active(tenant.id, false).await.unwrap();

    let result = t
        .engine
        .enqueue_delivery(tenant.id, common::message("no-reply@verified.example", "u@example.com"))
        .await;
    assert!(matches!(result, Err(EngineError::TenantSuspended(_))));

    let summary = t.engine.run_delivery_cycle(common::now()).await.unwrap();
    assert_eq!(summary.claimed, 0);
    assert_eq!(t.job_status(tenant.id, job_id).await.status(), Some(DeliveryStatus::Pending));

    common::cleanup(t).await;
}

#[tokio::test]
async fn unknown_tenant_is_reported() {
    let t = common::spawn_engine().await;
    let result = t
        .engine
        .enqueue_delivery(uuid::Uuid::new_v4(), common::message("a@b.example", "c@d.example"))
        .await;
    assert!(matches!(result, Err(EngineError::TenantNotFound(_))));

    common::cleanup(t).await;
}

#[tokio::test]
async fn header_injection_is_refused_at_enqueue() {
    let t = common::spawn_engine().await;
    let tenant = t.create_tenant("acme", "free").await;

    let mut message = common::message("no-reply@verified.example", "user@example.com");
    message.headers.push(MessageHeader {
        name: "X-Note".to_string(),
        value: "hi\r\nBcc: everyone@example.com".to_string(),
    });
    let result = t.engine.enqueue_delivery(tenant.id, message).await;
    assert!(matches!(result, Err(EngineError::BadRequest(_))));

    common::cleanup(t).await;
}

#[tokio::test]
async fn strict_enqueue_refuses_unverified_senders() {
    let t = common::spawn_engine_with(|c| c.delivery.require_verified_sender = true).await;
    let tenant = t.create_tenant("acme", "free").await;
    t.register_domain(tenant.id, "unverified.example").await;

    let result = t
        .engine
        .enqueue_delivery(
            tenant.id,
            common::message("no-reply@unverified.example", "user@example.com"),
        )
        .await;
    assert!(matches!(result, Err(EngineError::BadRequest(_))));

    common::cleanup(t).await;
}
