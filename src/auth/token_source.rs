//! Adapter exposing "current bearer token" and "refresh" to transports
//! (§4.4), without exposing the full authorization-start machinery that
//! only the host application should trigger.

use std::sync::Arc;

use url::Url;

use crate::auth::coordinator::AuthCoordinator;
use crate::auth::token_store::TokenStore;
use crate::error::{Error, Result};

/// Wraps a [`TokenStore`] and an [`AuthCoordinator`] for one server URL,
/// giving transports a narrow surface: read the current token, or force a
/// refresh.
pub struct TokenSource {
    store: Arc<dyn TokenStore>,
    coordinator: Arc<AuthCoordinator>,
    server_url: Url,
}

impl TokenSource {
    /// Construct a token source for `server_url`, backed by `store` and
    /// `coordinator`.
    pub fn new(store: Arc<dyn TokenStore>, coordinator: Arc<AuthCoordinator>, server_url: Url) -> Self {
        Self {
            store,
            coordinator,
            server_url,
        }
    }

    /// Return the currently stored access token, or `None` if no tokens are
    /// persisted for this server.
    ///
    /// # Errors
    ///
    /// [`Error::Unauthorized`] is not returned here -- an absent token is a
    /// normal, non-error outcome; callers decide whether that absence is
    /// fatal for the operation they're attempting.
    pub async fn get_token(&self) -> Result<Option<String>> {
        Ok(self
            .store
            .load_tokens(self.server_url.as_str())
            .await?
            .map(|t| t.access_token))
    }

    /// Force a token refresh: rediscover metadata, invoke the refresh flow,
    /// persist the new tokens, and return the new access token.
    ///
    /// # Errors
    ///
    /// [`Error::Unauthorized`] if no refresh token / client registration is
    /// available or the authorization server rejects the refresh request.
    pub async fn refresh_token(&self) -> Result<String> {
        let refreshed = self
            .coordinator
            .refresh_token(&self.server_url)
            .await
            .map_err(|e| match e {
                Error::Configuration(msg) => Error::Unauthorized(msg),
                other => other,
            })?;
        Ok(refreshed.access_token)
    }
}
