//! HTTP endpoints.
//!
//! - `health.rs` — `GET /health`, `GET /status`, `GET /metrics`
//! - `validate.rs` — auth and invite sub-requests for the reverse proxy

pub mod health;
pub mod validate;
