//! Payment-gated reverse proxy for MCP tool servers.
//!
//! Requests to `/proxy/{server_id}/...` run through [`pipeline::Pipeline`]:
//! identity resolution, JSON-RPC inspection, x402 pre-authorization, a
//! rate-limited and retried upstream call, then settlement and analytics.

pub mod clock;
pub mod config;
pub mod cors;
pub mod db;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod routes;
pub mod session;
pub mod state;
pub mod store;

pub use config::ProxyConfig;
pub use db::Database;
pub use error::ProxyError;
pub use pipeline::Pipeline;
pub use state::AppState;
