//! Storage and identity collaborators consumed by the pipeline.
//!
//! [`crate::db::Database`] implements every storage trait on SQLite;
//! [`crate::session::HttpSessionValidator`] implements [`SessionValidator`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

/// A registered upstream tool server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: String,
    pub origin_url: String,
    /// Payee for every paid tool on this server.
    pub receiver_address: String,
    pub name: Option<String>,
}

/// A per-(tool, network) price quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingEntry {
    pub network: String,
    pub asset_address: String,
    /// Price in the token's smallest unit.
    pub max_amount_required_raw: String,
    pub token_decimals: u32,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRecord {
    pub id: String,
    pub server_id: String,
    pub name: String,
    pub description: Option<String>,
    /// In catalog order.
    pub pricing: Vec<PricingEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub wallet_address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PaymentStatus::Pending),
            "completed" => Some(PaymentStatus::Completed),
            _ => None,
        }
    }
}

/// One payment attempt, unique per authorization signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub signature: String,
    pub server_id: String,
    pub tool_id: String,
    pub user_id: Option<String>,
    pub amount_raw: String,
    pub token_decimals: u32,
    pub asset: String,
    pub network: String,
    pub payer: Option<String>,
    pub status: PaymentStatus,
    pub transaction_hash: Option<String>,
}

/// One served tool call, for usage analytics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub tool_id: String,
    pub server_id: String,
    pub user_id: Option<String>,
    pub status: u16,
    pub latency_ms: u64,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub arguments: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
}

#[async_trait]
pub trait ServerCatalog: Send + Sync {
    async fn lookup_server_by_id(&self, id: &str) -> Result<Option<ServerRecord>, ProxyError>;

    async fn list_tools(&self, server_id: &str) -> Result<Vec<ToolRecord>, ProxyError>;
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Owner of an active API key, looked up by the key's SHA-256 hex digest.
    async fn validate_api_key(&self, key_hash: &str) -> Result<Option<UserRecord>, ProxyError>;

    async fn primary_wallet(&self, user_id: &str) -> Result<Option<String>, ProxyError>;

    async fn get_or_create_user_by_wallet(
        &self,
        address: &str,
        chain: mcpay::WalletChain,
    ) -> Result<UserRecord, ProxyError>;
}

/// A user resolved from an externally issued session token.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUser {
    pub user_id: String,
}

#[async_trait]
pub trait SessionValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<Option<SessionUser>, ProxyError>;
}

/// Session validation when no session service is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSessions;

#[async_trait]
impl SessionValidator for NoSessions {
    async fn validate(&self, _token: &str) -> Result<Option<SessionUser>, ProxyError> {
        Ok(None)
    }
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn get_by_signature(&self, signature: &str)
        -> Result<Option<PaymentRecord>, ProxyError>;

    /// Insert unless a record with the same signature exists.
    /// Returns whether a row was created.
    async fn create(&self, record: &PaymentRecord) -> Result<bool, ProxyError>;

    /// Set status and transaction of the record keyed by `record.signature`,
    /// inserting it if missing.
    async fn update_status(&self, record: &PaymentRecord) -> Result<(), ProxyError>;
}

#[async_trait]
pub trait UsageRecorder: Send + Sync {
    async fn record(&self, usage: &UsageRecord) -> Result<(), ProxyError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_status_roundtrip() {
        for status in [PaymentStatus::Pending, PaymentStatus::Completed] {
            assert_eq!(PaymentStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(PaymentStatus::parse("refunded"), None);
    }
}
