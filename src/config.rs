use std::collections::HashMap;
use std::time::Duration;

use ipnet::IpNet;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub encryption_key: String,
    pub log_level: String,
    pub delivery: DeliveryConfig,
    pub verification: VerificationConfig,
    pub dkim: DkimConfig,
    pub tenants: TenantConfig,
    pub smtp: Option<SmtpConfig>,
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub poll_interval: Duration,
    /// Fairness cap: jobs claimed per tenant per polling cycle.
    pub batch_size: i64,
    pub max_attempts: i32,
    pub retry_jitter_secs: u64,
    /// Claims stuck in `processing` for longer than this are released.
    pub stale_claim_after: Duration,
    pub send_timeout: Duration,
    /// Refuse jobs at enqueue time whose sender domain cannot send yet,
    /// instead of failing them at claim time.
    pub require_verified_sender: bool,
}

#[derive(Debug, Clone)]
pub struct VerificationConfig {
    pub sweep_interval: Duration,
    pub concurrency: usize,
    pub alert_threshold: i32,
    pub dns_timeout: Duration,
    /// Addresses the platform sends from; a passing SPF record covers all of them.
    pub sending_ips: Vec<IpNet>,
    pub spf_include: Option<String>,
    pub dmarc_rua: String,
}

#[derive(Debug, Clone)]
pub struct DkimConfig {
    pub key_bits: usize,
    pub selector_prefix: String,
    pub retirement_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct TenantConfig {
    pub cache_ttl: Duration,
    pub plans: HashMap<String, PlanLimits>,
    pub default_plan: PlanLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
    pub messages_per_minute: u32,
    pub concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub tls_mode: String,
}

pub const MIN_DKIM_KEY_BITS: usize = 2048;

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 20,
            max_attempts: 5,
            retry_jitter_secs: 0,
            stale_claim_after: Duration::from_secs(15 * 60),
            send_timeout: Duration::from_secs(30),
            require_verified_sender: false,
        }
    }
}

impl DeliveryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts < 1 {
            return Err("COURIER_MAX_ATTEMPTS must be at least 1".to_string());
        }
        if self.batch_size < 1 {
            return Err("COURIER_BATCH_SIZE must be at least 1".to_string());
        }
        Ok(())
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30 * 60),
            concurrency: 8,
            alert_threshold: 3,
            dns_timeout: Duration::from_secs(5),
            sending_ips: Vec::new(),
            spf_include: None,
            dmarc_rua: "dmarc@localhost".to_string(),
        }
    }
}

impl Default for DkimConfig {
    fn default() -> Self {
        Self {
            key_bits: MIN_DKIM_KEY_BITS,
            selector_prefix: "cr".to_string(),
            retirement_grace: Duration::from_secs(72 * 3600),
        }
    }
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            plans: parse_plan_limits(DEFAULT_PLAN_LIMITS).unwrap_or_default(),
            default_plan: PlanLimits {
                messages_per_minute: 60,
                concurrency: 2,
            },
        }
    }
}

impl TenantConfig {
    pub fn limits_for(&self, plan: &str) -> PlanLimits {
        self.plans.get(plan).copied().unwrap_or(self.default_plan)
    }
}

const DEFAULT_PLAN_LIMITS: &str = "free:60:2,pro:600:8,enterprise:6000:32";

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let database_url = env_required("DATABASE_URL")?;
        let encryption_key = env_required("COURIER_ENCRYPTION_KEY")?;
        let log_level = env_or("COURIER_LOG_LEVEL", "info");

        let delivery = DeliveryConfig {
            poll_interval: Duration::from_secs(env_parse("COURIER_DELIVERY_POLL_SECS", 5)?),
            batch_size: env_parse("COURIER_BATCH_SIZE", 20)?,
            max_attempts: env_parse("COURIER_MAX_ATTEMPTS", 5)?,
            retry_jitter_secs: env_parse("COURIER_RETRY_JITTER_SECS", 0)?,
            stale_claim_after: Duration::from_secs(env_parse("COURIER_STALE_CLAIM_SECS", 900)?),
            send_timeout: Duration::from_secs(env_parse("COURIER_SMTP_TIMEOUT_SECS", 30)?),
            require_verified_sender: env_parse("COURIER_ENQUEUE_REQUIRE_VERIFIED", false)?,
        };
        delivery.validate()?;

        let sending_ips = parse_ip_list(&env_required("COURIER_SENDING_IPS")?)?;

        let verification = VerificationConfig {
            sweep_interval: Duration::from_secs(60 * env_parse("COURIER_VERIFY_INTERVAL_MINS", 30)?),
            concurrency: env_parse("COURIER_VERIFY_CONCURRENCY", 8)?,
            alert_threshold: env_parse("COURIER_ALERT_THRESHOLD", 3)?,
            dns_timeout: Duration::from_secs(env_parse("COURIER_DNS_TIMEOUT_SECS", 5)?),
            sending_ips,
            spf_include: std::env::var("COURIER_SPF_INCLUDE").ok().filter(|s| !s.is_empty()),
            dmarc_rua: env_or("COURIER_DMARC_RUA", "dmarc@localhost"),
        };

        let key_bits: usize = env_parse("COURIER_DKIM_KEY_BITS", MIN_DKIM_KEY_BITS)?;
        if key_bits < MIN_DKIM_KEY_BITS {
            return Err(format!(
                "COURIER_DKIM_KEY_BITS must be at least {MIN_DKIM_KEY_BITS}"
            ));
        }
        let dkim = DkimConfig {
            key_bits,
            selector_prefix: env_or("COURIER_DKIM_SELECTOR_PREFIX", "cr"),
            retirement_grace: Duration::from_secs(
                3600 * env_parse::<u64>("COURIER_DKIM_GRACE_HOURS", 72)?,
            ),
        };

        let tenants = TenantConfig {
            cache_ttl: Duration::from_secs(env_parse("COURIER_TENANT_CACHE_SECS", 300)?),
            plans: parse_plan_limits(&env_or("COURIER_PLAN_LIMITS", DEFAULT_PLAN_LIMITS))?,
            ..TenantConfig::default()
        };

        let smtp = match std::env::var("COURIER_SMTP_HOST").ok() {
            Some(host) => Some(SmtpConfig {
                host,
                port: env_parse("COURIER_SMTP_PORT", 587)?,
                user: std::env::var("COURIER_SMTP_USER").ok(),
                pass: std::env::var("COURIER_SMTP_PASS").ok(),
                tls_mode: env_or("COURIER_SMTP_TLS", "starttls"),
            }),
            None => None,
        };

        Ok(Config {
            database_url,
            encryption_key,
            log_level,
            delivery,
            verification,
            dkim,
            tenants,
            smtp,
        })
    }
}

/// Parses `plan:messages_per_minute:concurrency` entries separated by commas.
pub fn parse_plan_limits(raw: &str) -> Result<HashMap<String, PlanLimits>, String> {
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|entry| {
            let parts: Vec<&str> = entry.trim().split(':').collect();
            let [plan, rate, concurrency] = parts.as_slice() else {
                return Err(format!("Invalid COURIER_PLAN_LIMITS entry '{entry}'"));
            };
            let messages_per_minute: u32 = rate
                .parse()
                .map_err(|e| format!("Invalid rate in plan '{plan}': {e}"))?;
            let concurrency: usize = concurrency
                .parse()
                .map_err(|e| format!("Invalid concurrency in plan '{plan}': {e}"))?;
            if messages_per_minute == 0 || concurrency == 0 {
                return Err(format!("Plan '{plan}' limits must be non-zero"));
            }
            Ok((
                plan.to_string(),
                PlanLimits {
                    messages_per_minute,
                    concurrency,
                },
            ))
        })
        .collect()
}

fn parse_ip_list(raw: &str) -> Result<Vec<IpNet>, String> {
    let ips: Vec<IpNet> = raw
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            let s = s.trim();
            s.parse::<IpNet>()
                .or_else(|_| s.parse::<std::net::IpAddr>().map(IpNet::from))
                .map_err(|e| format!("Invalid COURIER_SENDING_IPS entry '{s}': {e}"))
        })
        .collect::<Result<_, _>>()?;
    if ips.is_empty() {
        return Err("COURIER_SENDING_IPS must list at least one address".to_string());
    }
    Ok(ips)
}

fn env_required(key: &str) -> Result<String, String> {
    std::env::var(key).map_err(|_| format!("Missing required environment variable: {key}"))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|e| format!("Invalid {key}: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_limits_parse() {
        let plans = parse_plan_limits("free:60:2, pro:600:8").unwrap();
        assert_eq!(
            plans["pro"],
            PlanLimits {
                messages_per_minute: 600,
                concurrency: 8
            }
        );
        assert_eq!(plans.len(), 2);
    }

    #[test]
    fn plan_limits_reject_malformed_and_zero() {
        assert!(parse_plan_limits("free:60").is_err());
        assert!(parse_plan_limits("free:0:2").is_err());
        assert!(parse_plan_limits("free:abc:2").is_err());
    }

    #[test]
    fn unknown_plan_falls_back_to_default() {
        let config = TenantConfig::default();
        assert_eq!(config.limits_for("no-such-plan"), config.default_plan);
        assert_eq!(config.limits_for("enterprise").concurrency, 32);
    }

    #[test]
    fn delivery_limits_must_be_positive() {
        assert!(DeliveryConfig::default().validate().is_ok());

        let negative_batch = DeliveryConfig {
            batch_size: -1,
            ..DeliveryConfig::default()
        };
        assert!(negative_batch.validate().is_err());

        let zero_attempts = DeliveryConfig {
            max_attempts: 0,
            ..DeliveryConfig::default()
        };
        assert!(zero_attempts.validate().is_err());
    }

    #[test]
    fn sending_ips_accept_bare_addresses_and_cidrs() {
        let ips = parse_ip_list("203.0.113.7, 198.51.100.0/24").unwrap();
        assert_eq!(ips[0].to_string(), "203.0.113.7/32");
        assert_eq!(ips[1].to_string(), "198.51.100.0/24");
        assert!(parse_ip_list(" , ").is_err());
        assert!(parse_ip_list("not-an-ip").is_err());
    }
}
