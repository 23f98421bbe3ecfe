//! In-memory collaborators for pipeline unit tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mcpay::{
    AutoSigner, DisabledSigner, ExactPayload, McpayError, PaymentPayload, PaymentRequirements,
    PaymentSettler, PaymentVerifier, SettleResponse, SigningIdentity, SigningResult,
    TransferAuthorization, VerifyResponse,
};

use crate::db::Database;
use crate::error::ProxyError;
use crate::pipeline::Collaborators;
use crate::store::{
    NoSessions, PricingEntry, ServerRecord, SessionUser, SessionValidator, ToolRecord,
};

pub const SERVER_ID: &str = "srv-1";
pub const PAYER: &str = "0x1111111111111111111111111111111111111111";
pub const PAY_TO: &str = "0x2222222222222222222222222222222222222222";

pub fn seeded_db() -> Database {
    seeded_db_with_origin("https://tools.example.com/mcp")
}

/// Server `srv-1` with a paid `search` tool (100 units, 6 decimals, on
/// `base` and `base-sepolia`) and a free `echo` tool.
pub fn seeded_db_with_origin(origin: &str) -> Database {
    let db = Database::new(":memory:").unwrap();
    db.insert_server(&ServerRecord {
        id: SERVER_ID.to_string(),
        origin_url: origin.to_string(),
        receiver_address: PAY_TO.to_string(),
        name: Some("Example tools".to_string()),
    })
    .unwrap();
    let price = |network: &str| PricingEntry {
        network: network.to_string(),
        asset_address: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".to_string(),
        max_amount_required_raw: "100".to_string(),
        token_decimals: 6,
        active: true,
    };
    db.insert_tool(&ToolRecord {
        id: "tool-search".to_string(),
        server_id: SERVER_ID.to_string(),
        name: "search".to_string(),
        description: None,
        pricing: vec![price("base"), price("base-sepolia")],
    })
    .unwrap();
    db.insert_tool(&ToolRecord {
        id: "tool-echo".to_string(),
        server_id: SERVER_ID.to_string(),
        name: "echo".to_string(),
        description: Some("Echo the input".to_string()),
        pricing: Vec::new(),
    })
    .unwrap();
    db
}

pub fn collaborators(db: Database) -> Collaborators {
    let db = Arc::new(db);
    Collaborators {
        catalog: db.clone(),
        identities: db.clone(),
        sessions: Arc::new(NoSessions),
        verifier: Arc::new(FakeVerifier::valid()),
        settler: Arc::new(FakeSettler::succeeding()),
        signer: Arc::new(DisabledSigner),
        payments: db.clone(),
        usage: db,
    }
}

/// Base64 `X-PAYMENT` value carrying `signature`.
pub fn payment_header(signature: &str) -> String {
    mcpay::encode_payment_header(&PaymentPayload {
        x402_version: 1,
        scheme: "exact".to_string(),
        network: "base-sepolia".to_string(),
        payload: ExactPayload {
            signature: Some(signature.to_string()),
            authorization: Some(TransferAuthorization {
                from: PAYER.to_string(),
                to: PAY_TO.to_string(),
                value: "100".to_string(),
                valid_after: "0".to_string(),
                valid_before: "9999999999".to_string(),
                nonce: format!("0x{:0>64}", 1),
            }),
            transaction: None,
        },
    })
    .unwrap()
}

pub struct StaticSessions(HashMap<String, String>);

impl StaticSessions {
    pub fn new(sessions: &[(&str, &str)]) -> Self {
        Self(
            sessions
                .iter()
                .map(|(token, user)| (token.to_string(), user.to_string()))
                .collect(),
        )
    }
}

#[async_trait]
impl SessionValidator for StaticSessions {
    async fn validate(&self, token: &str) -> Result<Option<SessionUser>, ProxyError> {
        Ok(self.0.get(token).map(|user_id| SessionUser {
            user_id: user_id.clone(),
        }))
    }
}

pub struct FakeVerifier {
    /// `None` simulates an unreachable facilitator.
    response: Option<VerifyResponse>,
    calls: AtomicUsize,
}

impl FakeVerifier {
    pub fn valid() -> Self {
        Self {
            response: Some(VerifyResponse {
                is_valid: true,
                invalid_reason: None,
                payer: Some(PAYER.to_string()),
            }),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn invalid(reason: &str) -> Self {
        Self {
            response: Some(VerifyResponse {
                is_valid: false,
                invalid_reason: Some(reason.to_string()),
                payer: None,
            }),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            response: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentVerifier for FakeVerifier {
    async fn verify(
        &self,
        _payload: &PaymentPayload,
        _requirements: &PaymentRequirements,
    ) -> Result<VerifyResponse, McpayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.response
            .clone()
            .ok_or_else(|| McpayError::Facilitator("connection refused".to_string()))
    }
}

pub struct FakeSettler {
    response: SettleResponse,
    calls: AtomicUsize,
}

impl FakeSettler {
    pub fn succeeding() -> Self {
        Self {
            response: SettleResponse {
                success: true,
                error_reason: None,
                payer: Some(PAYER.to_string()),
                transaction: Some("0xtxhash".to_string()),
                network: Some("base-sepolia".to_string()),
            },
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            response: SettleResponse {
                success: false,
                error_reason: Some(reason.to_string()),
                payer: None,
                transaction: None,
                network: None,
            },
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentSettler for FakeSettler {
    async fn settle(
        &self,
        _payload: &PaymentPayload,
        _requirements: &PaymentRequirements,
    ) -> Result<SettleResponse, McpayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.response.clone())
    }
}

pub struct FakeSigner {
    signed_auth: String,
}

impl FakeSigner {
    pub fn signing(signed_auth: String) -> Self {
        Self { signed_auth }
    }
}

#[async_trait]
impl AutoSigner for FakeSigner {
    async fn attempt_sign(
        &self,
        _requirements: &PaymentRequirements,
        _identity: &SigningIdentity,
    ) -> SigningResult {
        SigningResult {
            success: true,
            signed_auth: Some(self.signed_auth.clone()),
            error: None,
        }
    }
}

/// Succeeds after a real delay, counting settlements started and finished.
pub struct SlowSettler {
    delay: std::time::Duration,
    started: AtomicUsize,
    finished: AtomicUsize,
}

impl SlowSettler {
    pub fn new(delay: std::time::Duration) -> Self {
        Self {
            delay,
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentSettler for SlowSettler {
    async fn settle(
        &self,
        _payload: &PaymentPayload,
        _requirements: &PaymentRequirements,
    ) -> Result<SettleResponse, McpayError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(FakeSettler::succeeding().response)
    }
}
