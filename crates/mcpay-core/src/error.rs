use thiserror::Error;

/// Errors returned by payment protocol operations.
#[derive(Debug, Error)]
pub enum McpayError {
    #[error("invalid payment header: {0}")]
    InvalidHeader(String),

    #[error("invalid payment: {0}")]
    InvalidPayment(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("facilitator error: {0}")]
    Facilitator(String),

    #[error("signer error: {0}")]
    Signer(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
