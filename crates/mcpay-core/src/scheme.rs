//! Collaborator contracts for the value-transfer protocol.
//!
//! The proxy depends on these traits only; [`crate::FacilitatorClient`] and
//! [`crate::RemoteSigner`] are the HTTP implementations wired in production,
//! tests substitute in-memory fakes.

use async_trait::async_trait;

use crate::error::McpayError;
use crate::payment::{PaymentPayload, PaymentRequirements};
use crate::response::{SettleResponse, SigningResult, VerifyResponse};

/// Checks an authorization against the requirement before the upstream is called.
#[async_trait]
pub trait PaymentVerifier: Send + Sync {
    async fn verify(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<VerifyResponse, McpayError>;
}

/// Redeems a previously verified authorization.
#[async_trait]
pub trait PaymentSettler: Send + Sync {
    async fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<SettleResponse, McpayError>;
}

/// Who the proxy asks the signer to sign for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningIdentity {
    pub user_id: String,
    pub wallet_address: Option<String>,
}

/// Signs authorizations on behalf of callers with a managed wallet.
/// Never errors: a failed attempt falls back to the regular 402 challenge.
#[async_trait]
pub trait AutoSigner: Send + Sync {
    async fn attempt_sign(
        &self,
        requirements: &PaymentRequirements,
        identity: &SigningIdentity,
    ) -> SigningResult;
}

/// Signer used when no signing service is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledSigner;

#[async_trait]
impl AutoSigner for DisabledSigner {
    async fn attempt_sign(
        &self,
        _requirements: &PaymentRequirements,
        _identity: &SigningIdentity,
    ) -> SigningResult {
        SigningResult::failed("auto-signing is not configured")
    }
}
