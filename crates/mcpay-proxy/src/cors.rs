//! CORS configuration for the proxy.

use actix_cors::Cors;
use actix_web::http::header::{self, HeaderName};

/// Build the CORS middleware from allowed origins.
///
/// Browser clients must be able to read the settlement receipt and the cache
/// status, so both are exposed. `*` only reaches here in dev mode; config
/// validation rejects it otherwise.
pub fn build_cors(allowed_origins: &[String]) -> Cors {
    let allowed = allowed_origins.to_vec();
    Cors::default()
        .allowed_origin_fn(move |origin, _req_head| {
            let origin_str = origin.to_str().unwrap_or("");
            allowed.iter().any(|a| a == "*" || a == origin_str)
        })
        .allowed_methods(vec!["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"])
        .allowed_headers(vec![
            header::AUTHORIZATION,
            header::ACCEPT,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-payment"),
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("x-wallet-address"),
            HeaderName::from_static("x-wallet-provider"),
            HeaderName::from_static("x-wallet-type"),
            HeaderName::from_static("mcp-session-id"),
            HeaderName::from_static("mcp-protocol-version"),
        ])
        .expose_headers(vec![
            HeaderName::from_static("x-payment-response"),
            HeaderName::from_static("x-mcpay-cache"),
            HeaderName::from_static("x-request-id"),
            HeaderName::from_static("mcp-session-id"),
        ])
        .max_age(3600)
}
