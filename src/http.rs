//! Upstream HTTP integration: list-endpoint client and retry plumbing.

pub mod client;
pub mod retry;

pub use self::client::CertViewClient;
