//! Upgrade-time authentication against the shared session store.

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::counter;
use switchboard_core::Principal;
use thiserror::Error;
use tracing::{debug, warn};

use super::cookie::{session_cookie, unsign};
use super::store::{SessionStore, SessionStoreError};
use crate::metrics::WS_AUTH_FAILURES_TOTAL;

/// Why an upgrade request was refused.
#[derive(Debug, Error)]
pub enum AuthFailure {
    /// No session cookie on the request.
    #[error("missing session cookie")]
    MissingCookie,

    /// The cookie is unsigned, malformed, or its signature does not verify.
    #[error("invalid session cookie signature")]
    BadSignature,

    /// The session does not exist, has expired, or has no logged-in user.
    #[error("unknown session")]
    UnknownSession,

    /// The session store could not be queried.
    #[error("session store unavailable: {0}")]
    Store(#[from] SessionStoreError),
}

impl AuthFailure {
    /// HTTP status returned instead of upgrading.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    /// Short label used in metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingCookie => "missing_cookie",
            Self::BadSignature => "bad_signature",
            Self::UnknownSession => "unknown_session",
            Self::Store(_) => "store_error",
        }
    }
}

impl IntoResponse for AuthFailure {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Validates upgrade requests and resolves them to a [`Principal`].
pub struct SessionBridge {
    cookie_name: String,
    secret: Option<String>,
    store: Arc<dyn SessionStore>,
}

impl SessionBridge {
    /// Create a bridge reading `cookie_name`, verifying signatures with
    /// `secret` when one is given.
    pub fn new(cookie_name: impl Into<String>, secret: Option<String>, store: Arc<dyn SessionStore>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            secret,
            store,
        }
    }

    /// Name of the session cookie.
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Authenticate an upgrade request from its headers.
    ///
    /// The only side effect is the store read.
    pub async fn authenticate_upgrade(&self, headers: &HeaderMap) -> Result<Principal, AuthFailure> {
        let result = self.resolve(headers).await;
        match &result {
            Ok(principal) => debug!(%principal, "upgrade authenticated"),
            Err(AuthFailure::Store(e)) => {
                warn!(error = %e, "session store lookup failed");
                counter!(WS_AUTH_FAILURES_TOTAL, "reason" => "store_error").increment(1);
            }
            Err(failure) => {
                debug!(reason = failure.reason(), "upgrade rejected");
                counter!(WS_AUTH_FAILURES_TOTAL, "reason" => failure.reason()).increment(1);
            }
        }
        result
    }

    async fn resolve(&self, headers: &HeaderMap) -> Result<Principal, AuthFailure> {
        let raw = session_cookie(headers, &self.cookie_name).ok_or(AuthFailure::MissingCookie)?;
        let session_id = match &self.secret {
            Some(secret) => unsign(&raw, secret).ok_or(AuthFailure::BadSignature)?,
            None => raw,
        };
        self.store
            .resolve(&session_id)
            .await?
            .ok_or(AuthFailure::UnknownSession)
    }
}
