use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Pending,
    Verified,
    Partial,
    Failed,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Pending => "pending",
            VerificationStatus::Verified => "verified",
            VerificationStatus::Partial => "partial",
            VerificationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "verified" => VerificationStatus::Verified,
            "partial" => VerificationStatus::Partial,
            "failed" => VerificationStatus::Failed,
            _ => VerificationStatus::Pending,
        }
    }
}

/// Outcome of checking one DNS record. `error` is only set when resolution
/// itself failed, which makes the check inconclusive rather than a mismatch.
/// A check switched off for the domain is not evaluated and never counts as
/// passing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCheck {
    pub valid: bool,
    pub evaluated: bool,
    pub expected: String,
    pub actual: Option<String>,
    pub error: Option<String>,
}

impl RecordCheck {
    pub fn valid(expected: impl Into<String>, actual: Option<String>) -> Self {
        Self {
            valid: true,
            evaluated: true,
            expected: expected.into(),
            actual,
            error: None,
        }
    }

    pub fn mismatch(expected: impl Into<String>, actual: Option<String>) -> Self {
        Self {
            valid: false,
            evaluated: true,
            expected: expected.into(),
            actual,
            error: None,
        }
    }

    pub fn unresolved(expected: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            valid: false,
            evaluated: true,
            expected: expected.into(),
            actual: None,
            error: Some(error.into()),
        }
    }

    pub fn not_evaluated(expected: impl Into<String>) -> Self {
        Self {
            valid: false,
            evaluated: false,
            expected: expected.into(),
            actual: None,
            error: None,
        }
    }

    pub fn is_inconclusive(&self) -> bool {
        self.evaluated && !self.valid && self.error.is_some()
    }

    /// Evaluated and not passing.
    pub fn is_failing(&self) -> bool {
        self.evaluated && !self.valid
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct VerificationAttempt {
    pub id: Uuid,
    pub domain_id: Uuid,
    pub tenant_id: Uuid,
    pub status: String,
    pub spf_result: Json<RecordCheck>,
    pub dkim_result: Json<RecordCheck>,
    pub dmarc_result: Json<RecordCheck>,
    pub ownership_result: Json<RecordCheck>,
    pub timestamp: DateTime<Utc>,
}
