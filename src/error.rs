use uuid::Uuid;

use crate::dkim::DkimError;

#[derive(Debug)]
pub enum EngineError {
    NotFound(String),
    TenantNotFound(Uuid),
    TenantSuspended(Uuid),
    BadRequest(String),
    Conflict(String),
    NoActiveKey(String),
    KeyNotPublished(String),
    Dkim(DkimError),
    Internal(String),
    Database(sqlx::Error),
}

impl EngineError {
    /// System-class failures: the polling cycle is skipped and retried on the
    /// next tick instead of being charged to a job.
    pub fn is_system(&self) -> bool {
        matches!(self, EngineError::Database(_) | EngineError::Internal(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(msg) => write!(f, "Not Found: {msg}"),
            EngineError::TenantNotFound(id) => write!(f, "Tenant not found: {id}"),
            EngineError::TenantSuspended(id) => write!(f, "Tenant is suspended: {id}"),
            EngineError::BadRequest(msg) => write!(f, "Bad Request: {msg}"),
            EngineError::Conflict(msg) => write!(f, "Conflict: {msg}"),
            EngineError::NoActiveKey(domain) => {
                write!(f, "No active DKIM key for domain {domain}")
            }
            EngineError::KeyNotPublished(msg) => write!(f, "DKIM key not published: {msg}"),
            EngineError::Dkim(err) => write!(f, "DKIM Error: {err}"),
            EngineError::Internal(msg) => write!(f, "Internal Error: {msg}"),
            EngineError::Database(err) => write!(f, "Database Error: {err}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Database(err)
    }
}

impl From<DkimError> for EngineError {
    fn from(err: DkimError) -> Self {
        EngineError::Dkim(err)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
