use actix_web::{HttpResponse, ResponseError};

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Unknown server id in the proxy path
    #[error("server not found: {0}")]
    ServerNotFound(String),
    /// Unknown tool id on the analytics surface
    #[error("tool not found: {0}")]
    ToolNotFound(String),
    /// Path or query rejected before forwarding
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Upstream unreachable or response unusable
    #[error("upstream error: {0}")]
    Upstream(String),
    /// Payment protocol error
    #[error("payment error: {0}")]
    Payment(#[from] mcpay::McpayError),
    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl ResponseError for ProxyError {
    fn error_response(&self) -> HttpResponse {
        match self {
            ProxyError::ServerNotFound(id) => HttpResponse::NotFound().json(serde_json::json!({
                "error": "server_not_found",
                "message": format!("Server '{}' not found", id)
            })),
            ProxyError::ToolNotFound(id) => HttpResponse::NotFound().json(serde_json::json!({
                "error": "tool_not_found",
                "message": format!("Tool '{}' not found", id)
            })),
            ProxyError::BadRequest(msg) => HttpResponse::BadRequest().json(serde_json::json!({
                "error": "bad_request",
                "message": msg
            })),
            ProxyError::Upstream(msg) => {
                tracing::error!("Upstream error: {}", msg);
                HttpResponse::BadGateway().json(serde_json::json!({
                    "error": "upstream_error",
                    "message": "Failed to reach upstream server"
                }))
            }
            ProxyError::Payment(e) => {
                HttpResponse::PaymentRequired().json(serde_json::json!({
                    "error": "payment_failed",
                    "message": e.to_string()
                }))
            }
            ProxyError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                HttpResponse::InternalServerError().json(serde_json::json!({
                    "error": "internal_error",
                    "message": "An internal error occurred"
                }))
            }
            ProxyError::Database(e) => {
                tracing::error!("Database error: {}", e);
                HttpResponse::InternalServerError().json(serde_json::json!({
                    "error": "internal_error",
                    "message": "An internal error occurred"
                }))
            }
        }
    }
}
