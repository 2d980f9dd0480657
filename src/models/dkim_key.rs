use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct DkimKeyPair {
    pub id: Uuid,
    pub domain_id: Uuid,
    pub selector: String,
    #[serde(skip_serializing)]
    pub private_key_enc: Vec<u8>,
    /// Base64 SubjectPublicKeyInfo, the `p=` value of the DNS record.
    pub public_key: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
    pub retire_after: Option<DateTime<Utc>>,
}
