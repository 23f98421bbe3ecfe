use std::sync::Arc;
use std::time::Duration;

use mcpay::{AutoSigner, DisabledSigner, FacilitatorClient, RemoteSigner};

use crate::clock::{Clock, SystemClock};
use crate::config::ProxyConfig;
use crate::db::Database;
use crate::error::ProxyError;
use crate::pipeline::{Collaborators, Pipeline};
use crate::session::HttpSessionValidator;
use crate::store::{NoSessions, SessionValidator};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub db: Arc<Database>,
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    /// Wire the SQLite store and the remote facilitator, signer and session
    /// services into a pipeline.
    pub fn new(config: ProxyConfig, db: Database) -> Result<Self, ProxyError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProxyError::Internal(format!("failed to create HTTP client: {e}")))?;

        let facilitator = Arc::new(FacilitatorClient::new(
            http_client.clone(),
            &config.facilitator_url,
            config.hmac_secret.clone(),
        ));
        let signer: Arc<dyn AutoSigner> = match config.signer_url {
            Some(ref url) => Arc::new(RemoteSigner::new(http_client.clone(), url)),
            None => Arc::new(DisabledSigner),
        };
        let sessions: Arc<dyn SessionValidator> = match config.session_verify_url {
            Some(ref url) => Arc::new(HttpSessionValidator::new(http_client.clone(), url.clone())),
            None => Arc::new(NoSessions),
        };

        let db = Arc::new(db);
        let deps = Collaborators {
            catalog: db.clone(),
            identities: db.clone(),
            sessions,
            verifier: facilitator.clone(),
            settler: facilitator,
            signer,
            payments: db.clone(),
            usage: db.clone(),
        };

        Self::with_collaborators(config, db, deps, Arc::new(SystemClock::new()))
    }

    /// Build state around caller-supplied collaborators and clock.
    pub fn with_collaborators(
        config: ProxyConfig,
        db: Arc<Database>,
        deps: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ProxyError> {
        let pipeline = Pipeline::new(config.pipeline.clone(), deps, clock)?;
        Ok(Self {
            config: Arc::new(config),
            db,
            pipeline: Arc::new(pipeline),
        })
    }
}
