#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use actix_web::web;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mcpay::{ExactPayload, FacilitatorClient, PaymentPayload, TransferAuthorization};
use mcpay_proxy::clock::Clock;
use mcpay_proxy::config::{PipelineConfig, ProxyConfig, RetryConfig};
use mcpay_proxy::pipeline::Collaborators;
use mcpay_proxy::store::{NoSessions, PricingEntry, ServerRecord, ToolRecord};
use mcpay_proxy::{AppState, Database};

pub const SERVER_ID: &str = "srv-1";
pub const PAYER: &str = "0x1111111111111111111111111111111111111111";
pub const PAY_TO: &str = "0x2222222222222222222222222222222222222222";

/// `srv-1` pointing at `origin`, with a paid `search` tool (100 units,
/// 6 decimals on base-sepolia) and a free `echo` tool.
pub fn seeded_db(origin: &str) -> Database {
    let db = Database::new(":memory:").unwrap();
    db.insert_server(&ServerRecord {
        id: SERVER_ID.to_string(),
        origin_url: origin.to_string(),
        receiver_address: PAY_TO.to_string(),
        name: Some("Search tools".to_string()),
    })
    .unwrap();
    db.insert_tool(&ToolRecord {
        id: "tool-search".to_string(),
        server_id: SERVER_ID.to_string(),
        name: "search".to_string(),
        description: Some("Search the web".to_string()),
        pricing: vec![PricingEntry {
            network: "base-sepolia".to_string(),
            asset_address: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".to_string(),
            max_amount_required_raw: "100".to_string(),
            token_decimals: 6,
            active: true,
        }],
    })
    .unwrap();
    db.insert_tool(&ToolRecord {
        id: "tool-echo".to_string(),
        server_id: SERVER_ID.to_string(),
        name: "echo".to_string(),
        description: None,
        pricing: Vec::new(),
    })
    .unwrap();
    db
}

pub fn config(facilitator_url: &str) -> ProxyConfig {
    ProxyConfig {
        port: 0,
        db_path: ":memory:".to_string(),
        facilitator_url: facilitator_url.to_string(),
        hmac_secret: Some(b"test-secret".to_vec()),
        signer_url: None,
        session_verify_url: None,
        allowed_origins: vec!["http://localhost:3000".to_string()],
        rate_limit_rpm: 600,
        metrics_token: None,
        pipeline: PipelineConfig {
            retry: RetryConfig {
                base_delay: Duration::from_millis(10),
                max_jitter: Duration::ZERO,
                ..RetryConfig::default()
            },
            ..PipelineConfig::default()
        },
    }
}

pub fn app_state(config: ProxyConfig, db: Database) -> web::Data<AppState> {
    web::Data::new(AppState::new(config, db).unwrap())
}

/// State whose pipeline runs on `clock` instead of wall time.
pub fn app_state_with_clock(
    config: ProxyConfig,
    db: Database,
    clock: Arc<dyn Clock>,
) -> web::Data<AppState> {
    let db = Arc::new(db);
    let facilitator = Arc::new(FacilitatorClient::new(
        reqwest::Client::new(),
        &config.facilitator_url,
        config.hmac_secret.clone(),
    ));
    let deps = Collaborators {
        catalog: db.clone(),
        identities: db.clone(),
        sessions: Arc::new(NoSessions),
        verifier: facilitator.clone(),
        settler: facilitator,
        signer: Arc::new(mcpay::DisabledSigner),
        payments: db.clone(),
        usage: db.clone(),
    };
    web::Data::new(AppState::with_collaborators(config, db, deps, clock).unwrap())
}

/// Facilitator that accepts every authorization and settles with `0xtxhash`.
pub async fn accepting_facilitator() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/verify"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "isValid": true,
            "payer": PAYER
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/settle"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true,
            "payer": PAYER,
            "transaction": "0xtxhash",
            "network": "base-sepolia"
        })))
        .mount(&server)
        .await;
    server
}

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
                nonce: format!("0x{:0>64}", 7),
            }),
            transaction: None,
        },
    })
    .unwrap()
}

pub fn tools_call(name: &str) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "tools/call",
        "params": {"name": name, "arguments": {"query": "rust"}}
    })
}
