pub mod delivery_job;
pub mod dkim_key;
pub mod domain;
pub mod tenant;
pub mod verification;

pub use delivery_job::{DeliveryJob, DeliveryStatus, MessageHeader, NewMessage};
pub use dkim_key::DkimKeyPair;
pub use domain::Domain;
pub use tenant::Tenant;
pub use verification::{RecordCheck, VerificationAttempt, VerificationStatus};
