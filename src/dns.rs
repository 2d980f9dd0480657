use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::TokioResolver;
use hickory_resolver::config::ResolverOpts;
use hickory_resolver::name_server::TokioConnectionProvider;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    /// NXDOMAIN or no TXT records at the name.
    NoRecords(String),
    Timeout(String),
    LookupFailed(String),
}

impl DnsError {
    /// Inconclusive errors mean "try again", not "record absent".
    pub fn is_inconclusive(&self) -> bool {
        matches!(self, DnsError::Timeout(_) | DnsError::LookupFailed(_))
    }
}

impl std::fmt::Display for DnsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DnsError::NoRecords(name) => write!(f, "No TXT records at {name}"),
            DnsError::Timeout(name) => write!(f, "DNS query timed out for {name}"),
            DnsError::LookupFailed(msg) => write!(f, "DNS lookup failed: {msg}"),
        }
    }
}

impl std::error::Error for DnsError {}

#[async_trait]
pub trait TxtResolver: Send + Sync {
    /// Every TXT record at `name`, each with its character-strings joined.
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DnsError>;
}

pub struct HickoryResolver {
    resolver: TokioResolver,
    timeout: Duration,
}

impl HickoryResolver {
    /// Uses the system resolver configuration.
    pub fn new(timeout: Duration) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())
            .map_err(|e| DnsError::LookupFailed(format!("resolver init: {e}")))?
            .with_options(opts)
            .build();

        Ok(Self { resolver, timeout })
    }
}

#[async_trait]
impl TxtResolver for HickoryResolver {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let fqdn = if name.ends_with('.') {
            name.to_string()
        } else {
            format!("{name}.")
        };

        let lookup = tokio::time::timeout(self.timeout, self.resolver.txt_lookup(fqdn))
            .await
            .map_err(|_| DnsError::Timeout(name.to_string()))?;

        match lookup {
            Ok(lookup) => {
                let records: Vec<String> = lookup
                    .iter()
                    .map(|txt| {
                        txt.txt_data()
                            .iter()
                            .map(|chunk| String::from_utf8_lossy(chunk))
                            .collect::<String>()
                    })
                    .collect();
                if records.is_empty() {
                    Err(DnsError::NoRecords(name.to_string()))
                } else {
                    Ok(records)
                }
            }
            Err(err) if err.is_no_records_found() || err.is_nx_domain() => {
                Err(DnsError::NoRecords(name.to_string()))
            }
            Err(err) => {
                tracing::warn!("TXT lookup failed for {name}: {err}");
                Err(DnsError::LookupFailed(err.to_string()))
            }
        }
    }
}

/// Fixed answers keyed by name, for tests and offline runs.
#[derive(Default)]
pub struct StaticResolver {
    answers: RwLock<HashMap<String, Result<Vec<String>, DnsError>>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_txt(&self, name: &str, records: Vec<String>) {
        self.write().insert(normalize(name), Ok(records));
    }

    pub fn set_error(&self, name: &str, error: DnsError) {
        self.write().insert(normalize(name), Err(error));
    }

    pub fn remove(&self, name: &str) {
        self.write().remove(&normalize(name));
    }

    fn write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Result<Vec<String>, DnsError>>> {
        self.answers.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TxtResolver for StaticResolver {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let answers = self.answers.read().unwrap_or_else(|e| e.into_inner());
        match answers.get(&normalize(name)) {
            Some(answer) => answer.clone(),
            None => Err(DnsError::NoRecords(name.to_string())),
        }
    }
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}
