pub mod canonical;
pub mod signer;

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::rand_core::OsRng;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::{DkimConfig, MIN_DKIM_KEY_BITS};
use crate::delivery::message::OutboundMessage;
use crate::dns::TxtResolver;
use crate::error::{EngineError, EngineResult};
use crate::models::{DkimKeyPair, Domain};
use crate::verification::records;
use crate::{crypto, db};

#[derive(Debug)]
pub enum DkimError {
    WeakKey(usize),
    KeyGeneration(String),
    KeyEncoding(String),
    Signing(String),
}

impl std::fmt::Display for DkimError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DkimError::WeakKey(bits) => write!(
                f,
                "RSA keys must be at least {MIN_DKIM_KEY_BITS} bits, got {bits}"
            ),
            DkimError::KeyGeneration(msg) => write!(f, "Key generation failed: {msg}"),
            DkimError::KeyEncoding(msg) => write!(f, "Key encoding failed: {msg}"),
            DkimError::Signing(msg) => write!(f, "Signing failed: {msg}"),
        }
    }
}

impl std::error::Error for DkimError {}

pub fn generate_rsa_key(bits: usize) -> Result<RsaPrivateKey, DkimError> {
    if bits < MIN_DKIM_KEY_BITS {
        return Err(DkimError::WeakKey(bits));
    }
    RsaPrivateKey::new(&mut OsRng, bits).map_err(|e| DkimError::KeyGeneration(e.to_string()))
}

/// Base64 DER SubjectPublicKeyInfo, as published in the `p=` tag.
pub fn public_key_base64(key: &RsaPrivateKey) -> Result<String, DkimError> {
    let der = RsaPublicKey::from(key)
        .to_public_key_der()
        .map_err(|e| DkimError::KeyEncoding(e.to_string()))?;
    Ok(STANDARD.encode(der.as_bytes()))
}

/// New selector for a domain: configured prefix, UTC timestamp and a nonce
/// so two keys minted in the same second do not collide.
pub fn selector_for(prefix: &str, now: DateTime<Utc>, nonce: u16) -> String {
    format!("{prefix}{}{nonce:04x}", now.format("%Y%m%d%H%M%S"))
}

pub struct DkimKeyManager {
    pool: PgPool,
    resolver: Arc<dyn TxtResolver>,
    encryption_key: String,
    config: DkimConfig,
    /// Decrypted signing keys by key id. Entries are read-only once inserted.
    signers: DashMap<Uuid, Arc<RsaPrivateKey>>,
}

impl DkimKeyManager {
    pub fn new(
        pool: PgPool,
        resolver: Arc<dyn TxtResolver>,
        encryption_key: String,
        config: DkimConfig,
    ) -> Self {
        Self {
            pool,
            resolver,
            encryption_key,
            config,
            signers: DashMap::new(),
        }
    }

    /// Create and store a new key pair, inactive. Existing keys are untouched.
    pub async fn generate_key_pair(
        &self,
        domain: &Domain,
        selector: &str,
    ) -> EngineResult<DkimKeyPair> {
        if !records::is_valid_label(selector) {
            return Err(EngineError::BadRequest(format!("Invalid DKIM selector '{selector}'")));
        }

        let bits = self.config.key_bits;
        let key = tokio::task::spawn_blocking(move || generate_rsa_key(bits))
            .await
            .map_err(|e| EngineError::Internal(format!("Key generation task failed: {e}")))??;

        let public_key = public_key_base64(&key)?;
        let pem = key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| DkimError::KeyEncoding(e.to_string()))?;
        let sealed = crypto::seal_private_key(&pem, &self.encryption_key)
            .map_err(EngineError::Internal)?;

        let pair = db::dkim_keys::insert(&self.pool, domain.id, selector, &sealed, &public_key)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                    EngineError::Conflict(format!(
                        "Selector '{selector}' already exists for {}",
                        domain.domain_name
                    ))
                }
                _ => EngineError::Database(e),
            })?;

        tracing::info!(
            domain = %domain.domain_name,
            selector = %pair.selector,
            "Generated DKIM key pair"
        );
        self.signers.insert(pair.id, Arc::new(key));
        Ok(pair)
    }

    /// Make `selector` the domain's single active key. The previously active
    /// key is deactivated in the same transaction and scheduled for
    /// retirement after the grace window.
    pub async fn activate(&self, domain_id: Uuid, selector: &str) -> EngineResult<DkimKeyPair> {
        let now = Utc::now();
        let grace = chrono::Duration::from_std(self.config.retirement_grace)
            .map_err(|e| EngineError::Internal(format!("Invalid retirement grace: {e}")))?;

        let mut tx = self.pool.begin().await?;

        db::domains::lock(&mut tx, domain_id)
            .await?
            .ok_or_else(|| EngineError::NotFound("Domain not found".to_string()))?;

        let retired =
            db::dkim_keys::deactivate_others(&mut tx, domain_id, selector, now, now + grace)
                .await?;
        let pair = db::dkim_keys::mark_active(&mut tx, domain_id, selector)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("DKIM selector '{selector}' not found")))?;

        tx.commit().await?;

        tracing::info!(
            domain_id = %domain_id,
            selector = %selector,
            retired,
            "Activated DKIM key"
        );
        Ok(pair)
    }

    /// Sign with the domain's active key. Reads key material only.
    pub async fn sign(
        &self,
        message: &OutboundMessage,
        domain: &Domain,
    ) -> EngineResult<OutboundMessage> {
        let pair = db::dkim_keys::find_active(&self.pool, domain.id)
            .await?
            .ok_or_else(|| EngineError::NoActiveKey(domain.domain_name.clone()))?;

        let key = self.signing_key(&pair)?;
        let signed = signer::sign_message(message, &domain.domain_name, &pair.selector, &key)?;
        Ok(signed)
    }

    /// Start a rotation: generate a key under a fresh selector and return it
    /// so its DNS record can be published. The current key stays active.
    pub async fn begin_rotation(&self, domain: &Domain) -> EngineResult<DkimKeyPair> {
        let selector = selector_for(&self.config.selector_prefix, Utc::now(), rand::random());
        self.generate_key_pair(domain, &selector).await
    }

    /// Finish a rotation once the new public key is discoverable in DNS.
    pub async fn complete_rotation(
        &self,
        domain: &Domain,
        selector: &str,
    ) -> EngineResult<DkimKeyPair> {
        let pair = db::dkim_keys::find_by_selector(&self.pool, domain.id, selector)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("DKIM selector '{selector}' not found")))?;
        if pair.is_active {
            return Ok(pair);
        }

        let name = records::dkim_record_name(selector, &domain.domain_name);
        let published = match self.resolver.lookup_txt(&name).await {
            Ok(txt) => txt
                .iter()
                .filter_map(|r| records::dkim_public_key(r))
                .any(|p| p == pair.public_key),
            Err(e) => {
                return Err(EngineError::KeyNotPublished(format!("{name}: {e}")));
            }
        };
        if !published {
            return Err(EngineError::KeyNotPublished(format!(
                "{name} does not carry the new public key"
            )));
        }

        self.activate(domain.id, selector).await
    }

    /// Delete keys whose retirement grace window has passed.
    pub async fn purge_retired(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let removed = db::dkim_keys::delete_retired(&self.pool, now).await?;
        for id in &removed {
            self.signers.remove(id);
        }
        if !removed.is_empty() {
            tracing::info!("Purged {} retired DKIM key(s)", removed.len());
        }
        Ok(removed.len())
    }

    fn signing_key(&self, pair: &DkimKeyPair) -> EngineResult<Arc<RsaPrivateKey>> {
        if let Some(key) = self.signers.get(&pair.id) {
            return Ok(Arc::clone(key.value()));
        }

        let pem = crypto::open_private_key(&pair.private_key_enc, &self.encryption_key)
            .map_err(DkimError::KeyEncoding)?;
        let key = RsaPrivateKey::from_pkcs8_pem(&pem)
            .map_err(|e| DkimError::KeyEncoding(e.to_string()))?;
        let key = Arc::new(key);
        self.signers.insert(pair.id, Arc::clone(&key));
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn weak_keys_are_refused() {
        assert!(matches!(generate_rsa_key(1024), Err(DkimError::WeakKey(1024))));
    }

    #[test]
    fn selector_is_prefix_and_timestamp() {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 8, 5, 9).unwrap();
        assert_eq!(selector_for("cr", at, 0x00ff), "cr2026101908050900ff");
        assert!(records::is_valid_label(&selector_for("cr", at, u16::MAX)));
    }
}
