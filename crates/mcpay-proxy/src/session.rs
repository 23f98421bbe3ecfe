use async_trait::async_trait;

use crate::error::ProxyError;
use crate::store::{SessionUser, SessionValidator};

/// Validates session tokens against an external session service.
///
/// The service receives the token as `Authorization: Bearer <token>` on a GET
/// and answers 200 with `{"userId": "..."}` for a live session. 401/403/404
/// mean "no session"; anything else is an error the auth step falls through on.
#[derive(Clone)]
pub struct HttpSessionValidator {
    http: reqwest::Client,
    verify_url: String,
}

impl HttpSessionValidator {
    pub fn new(http: reqwest::Client, verify_url: impl Into<String>) -> Self {
        Self {
            http,
            verify_url: verify_url.into(),
        }
    }
}

#[async_trait]
impl SessionValidator for HttpSessionValidator {
    async fn validate(&self, token: &str) -> Result<Option<SessionUser>, ProxyError> {
        if token.is_empty() {
            return Ok(None);
        }

        let resp = self
            .http
            .get(&self.verify_url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(format!("session service unreachable: {e}")))?;

        let status = resp.status();
        if matches!(status.as_u16(), 401 | 403 | 404) {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ProxyError::Upstream(format!(
                "session service returned {status}"
            )));
        }

        let user: SessionUser = resp
            .json()
            .await
            .map_err(|e| ProxyError::Upstream(format!("invalid session response: {e}")))?;
        if user.user_id.is_empty() {
            return Ok(None);
        }
        Ok(Some(user))
    }
}
