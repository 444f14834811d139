//! HTTP surface — split into a client-facing dialect API and an
//! admin-key-gated management API, each served on its own port.

pub mod admin;
pub mod admin_auth;
pub mod client;
pub mod client_auth;
pub mod health;
pub mod metrics;
pub mod request_id;
pub mod status;
