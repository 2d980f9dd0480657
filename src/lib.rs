pub mod config;
pub mod crypto;
pub mod db;
pub mod delivery;
pub mod dkim;
pub mod dns;
pub mod error;
pub mod models;
pub mod rate_limit;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod tenant;
pub mod transport;
pub mod verification;

pub use service::Engine;
