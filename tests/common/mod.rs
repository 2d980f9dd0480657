#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use courier::config::{
    Config, DeliveryConfig, DkimConfig, PlanLimits, TenantConfig, VerificationConfig,
};
use courier::dns::StaticResolver;
use courier::models::{NewMessage, Tenant};
use courier::service::DomainSetup;
use courier::transport::RecordingTransport;
use courier::Engine;

pub const SENDING_IP: &str = "203.0.113.7";
pub const DMARC_RUA: &str = "dmarc@courier.test";

/// An engine over a dedicated test database, with in-memory DNS and SMTP.
pub struct TestEngine {
    pub engine: Engine,
    pub pool: PgPool,
    pub resolver: Arc<StaticResolver>,
    pub transport: Arc<RecordingTransport>,
    pub db_name: String,
}

impl TestEngine {
    pub async fn create_tenant(&self, slug: &str, plan: &str) -> Tenant {
        self.engine
            .create_tenant(&format!("Tenant {slug}"), slug, plan)
            .await
            .expect("create tenant failed")
    }

    pub async fn register_domain(&self, tenant_id: Uuid, name: &str) -> DomainSetup {
        self.engine
            .register_domain(tenant_id, name)
            .await
            .expect("register domain failed")
    }

    /// Publish every record from the setup instructions. Records sharing a
    /// name, like SPF and the ownership token at the apex, are published
    /// together.
    pub fn publish(&self, setup: &DomainSetup) {
        let mut by_name: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for record in &setup.records {
            by_name.entry(&record.name).or_default().push(record.value.clone());
        }
        for (name, values) in by_name {
            self.resolver.set_txt(name, values);
        }
    }

    /// Register, publish and verify a domain.
    pub async fn verified_domain(&self, tenant_id: Uuid, name: &str) -> DomainSetup {
        let setup = self.register_domain(tenant_id, name).await;
        self.publish(&setup);
        let report = self
            .engine
            .verify_domain_now(tenant_id, setup.domain.id)
            .await
            .expect("verification failed");
        assert!(report.is_verified, "domain {name} did not verify: {report:?}");
        setup
    }

    pub async fn enqueue(&self, tenant_id: Uuid, from: &str, to: &str) -> Uuid {
        self.engine
            .enqueue_delivery(tenant_id, message(from, to))
            .await
            .expect("enqueue failed")
    }

    pub async fn job_status(&self, tenant_id: Uuid, job_id: Uuid) -> courier::models::DeliveryJob {
        self.engine
            .get_delivery_status(tenant_id, job_id)
            .await
            .expect("job lookup failed")
    }

    pub async fn active_key_count(&self, domain_id: Uuid) -> i64 {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM dkim_keys WHERE domain_id = $1 AND is_active",
        )
        .bind(domain_id)
        .fetch_one(&self.pool)
        .await
        .expect("count failed")
    }
}

pub fn message(from: &str, to: &str) -> NewMessage {
    NewMessage {
        from_address: from.to_string(),
        to_address: to.to_string(),
        subject: "Your receipt".to_string(),
        body: "Thanks for your order.\n".to_string(),
        ..NewMessage::default()
    }
}

/// Current time at whole-second precision, so it survives a round trip
/// through Postgres unchanged.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

pub fn test_config(database_url: String) -> Config {
    let mut tenants = TenantConfig::default();
    tenants.plans.insert(
        "serial".to_string(),
        PlanLimits {
            messages_per_minute: 600,
            concurrency: 1,
        },
    );
    tenants.plans.insert(
        "tiny".to_string(),
        PlanLimits {
            messages_per_minute: 2,
            concurrency: 1,
        },
    );

    Config {
        database_url,
        encryption_key: "test-encryption-key-32-chars-ok!".to_string(),
        log_level: "warn".to_string(),
        delivery: DeliveryConfig::default(),
        verification: VerificationConfig {
            sending_ips: vec![format!("{SENDING_IP}/32").parse().unwrap()],
            dmarc_rua: DMARC_RUA.to_string(),
            ..VerificationConfig::default()
        },
        dkim: DkimConfig::default(),
        tenants,
        smtp: None,
    }
}

pub async fn spawn_engine() -> TestEngine {
    spawn_engine_with(|_| {}).await
}

/// Spawn an engine with a fresh temporary database. The scheduler is not
/// started; tests drive cycles explicitly.
pub async fn spawn_engine_with(customize: impl FnOnce(&mut Config)) -> TestEngine {
    let _ = dotenvy::dotenv();

    let base_url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set for tests");

    let db_name = format!("courier_test_{}", Uuid::now_v7().simple());

    let admin_url = base_url
        .rsplit_once('/')
        .map(|(base, _)| format!("{base}/postgres"))
        .unwrap_or_else(|| base_url.clone());

    let admin_pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&admin_url)
        .await
        .expect("Failed to connect to postgres for test DB creation");

    sqlx::query(&format!("CREATE DATABASE \"{db_name}\""))
        .execute(&admin_pool)
        .await
        .expect("Failed to create test database");

    admin_pool.close().await;

    let test_url = base_url
        .rsplit_once('/')
        .map(|(base, _)| format!("{base}/{db_name}"))
        .unwrap_or_else(|| base_url.clone());

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&test_url)
        .await
        .expect("Failed to connect to test database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations on test database");

    let mut config = test_config(test_url);
    customize(&mut config);

    let resolver = Arc::new(StaticResolver::new());
    let transport = Arc::new(RecordingTransport::new());
    let engine = Engine::init(pool.clone(), config, resolver.clone(), transport.clone());

    TestEngine {
        engine,
        pool,
        resolver,
        transport,
        db_name,
    }
}

/// Drop the test database after the test completes.
pub async fn cleanup(test: TestEngine) {
    let db_name = test.db_name.clone();
    test.engine.shutdown().await;
    test.pool.close().await;

    let base_url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set for tests");
    let admin_url = base_url
        .rsplit_once('/')
        .map(|(base, _)| format!("{base}/postgres"))
        .unwrap_or_else(|| base_url.clone());

    let admin_pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&admin_url)
        .await
        .expect("Failed to connect for cleanup");

    let _ = sqlx::query(&format!("DROP DATABASE IF EXISTS \"{db_name}\" WITH (FORCE)"))
        .execute(&admin_pool)
        .await;

    admin_pool.close().await;
}
