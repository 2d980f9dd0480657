use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::verification::VerificationStatus;

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Domain {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub domain_name: String,
    pub is_verified: bool,
    pub verification_token: String,
    pub dkim_enabled: bool,
    pub spf_enabled: bool,
    pub dmarc_enabled: bool,
    pub dmarc_policy: Option<String>,
    pub verification_status: String,
    pub consecutive_failures: i32,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Domain {
    pub fn status(&self) -> VerificationStatus {
        VerificationStatus::parse(&self.verification_status)
    }
}
