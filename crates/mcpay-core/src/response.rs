use base64::Engine;
use serde::{Deserialize, Serialize};

/// Response from the facilitator's `/verify` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
}

/// Response from the facilitator's `/settle` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    /// Transaction hash, if settlement succeeded. `None` on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

impl SettleResponse {
    /// Value of the `X-PAYMENT-RESPONSE` header: base64 JSON receipt.
    pub fn receipt_header(&self) -> String {
        let receipt = serde_json::json!({
            "success": self.success,
            "transaction": self.transaction,
            "network": self.network,
            "payer": self.payer,
        });
        base64::engine::general_purpose::STANDARD.encode(receipt.to_string())
    }
}

/// Outcome of an auto-sign attempt for a managed wallet.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningResult {
    pub success: bool,
    /// Base64 `X-PAYMENT` value, ready to be treated as client-supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_auth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SigningResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            signed_auth: None,
            error: Some(error.into()),
        }
    }
}
