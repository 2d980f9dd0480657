pub mod delivery_queue;
pub mod dkim_keys;
pub mod domains;
pub mod tenants;
pub mod verification_history;
