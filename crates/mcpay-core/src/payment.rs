use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::McpayError;

/// EIP-3009 style transfer authorization carried by the "exact" scheme on EVM networks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferAuthorization {
    pub from: String,
    pub to: String,
    pub value: String,
    pub valid_after: String,
    pub valid_before: String,
    pub nonce: String,
}

/// Scheme-specific part of the payload. EVM payers send a signature plus the
/// signed authorization; SVM payers send a partially signed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<TransferAuthorization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
}

/// Wire-format payment payload (sent in the `X-PAYMENT` header, base64-encoded JSON).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub x402_version: u32,
    pub scheme: String,
    pub network: String,
    pub payload: ExactPayload,
}

impl PaymentPayload {
    /// The value that identifies this authorization across retries, restarts and
    /// duplicate submissions. Every settlement-affecting write is keyed by it.
    pub fn idempotency_key(&self) -> Option<&str> {
        self.payload
            .signature
            .as_deref()
            .or(self.payload.transaction.as_deref())
            .filter(|s| !s.is_empty())
    }

    /// Payer address, when the scheme exposes it before settlement.
    pub fn payer(&self) -> Option<&str> {
        self.payload.authorization.as_ref().map(|a| a.from.as_str())
    }
}

/// A single entry in the `accepts` array of a 402 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: String,
    /// Human-readable price, converted from the smallest unit via the token decimals.
    pub amount: String,
    /// Price in the token's smallest unit.
    pub max_amount_required: String,
    pub resource: String,
    pub description: String,
    pub mime_type: String,
    pub pay_to: String,
    pub max_timeout_seconds: u64,
    pub asset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// The 402 response body returned when a paid tool is called without a
/// valid authorization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequiredBody {
    pub x402_version: u32,
    pub error: String,
    pub accepts: Vec<PaymentRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
}

/// Decode an `X-PAYMENT` header value into a [`PaymentPayload`].
pub fn decode_payment_header(header_value: &str) -> Result<PaymentPayload, McpayError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(header_value.trim())
        .map_err(|e| McpayError::InvalidHeader(format!("invalid base64: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| McpayError::InvalidHeader(format!("invalid JSON payload: {e}")))
}

/// Encode a [`PaymentPayload`] the way clients put it in `X-PAYMENT`.
pub fn encode_payment_header(payload: &PaymentPayload) -> Result<String, McpayError> {
    let json = serde_json::to_vec(payload)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(json))
}
