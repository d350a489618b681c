//! The OAuth 2.1 + PKCE authorization coordinator (§4.3): a single entry
//! point that drives discovery, dynamic registration, PKCE authorization
//! start, code exchange, and refresh.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::metadata::{OAuthClientInformation, OAuthClientMetadata, OAuthMetadata, OAuthTokens};
use crate::auth::pkce;
use crate::auth::token_store::TokenStore;
use crate::error::{Error, Result};

/// The client-side identity used to drive one authorization flow: the
/// metadata presented during dynamic registration, the redirect URI bound
/// to that registration, and the callback that delivers an authorization
/// URL back to the host application (a browser launch, a printed link,
/// whatever the host wants -- the coordinator itself never touches a
/// browser or a listener).
pub struct Provider {
    /// Metadata POSTed to `registration_endpoint` during dynamic client
    /// registration.
    pub client_metadata: OAuthClientMetadata,
    /// The redirect URI used both in client registration and in the
    /// authorization URL. Must be one of `client_metadata.redirect_uris`.
    pub redirect_uri: String,
    /// Invoked with the authorization URL the host must deliver to the
    /// user (open a browser, print a link, etc). Errors from the callback
    /// are not propagated -- delivery is fire-and-forget from the
    /// coordinator's perspective.
    pub deliver_redirect: Arc<dyn Fn(&Url) + Send + Sync>,
}

/// The outcome of [`AuthCoordinator::auth`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    /// Tokens are present and fresh (or were just obtained/refreshed).
    Authorized,
    /// No usable tokens; the caller must deliver the given URL to the user
    /// and call [`AuthCoordinator::auth`] again with the resulting
    /// authorization code.
    Redirect(Url),
}

/// Drives the full OAuth 2.1 + PKCE flow for a single provider/server pair.
pub struct AuthCoordinator {
    http: reqwest::Client,
    store: Arc<dyn TokenStore>,
}

impl AuthCoordinator {
    /// Construct a coordinator backed by `store`.
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self {
            http: reqwest::Client::new(),
            store,
        }
    }

    /// Construct a coordinator with an explicit `reqwest::Client`, e.g. to
    /// share connection pooling with a transport.
    pub fn with_http_client(store: Arc<dyn TokenStore>, http: reqwest::Client) -> Self {
        Self { http, store }
    }

    /// Drive the authorization flow for `server_url` and return
    /// [`AuthResult::Authorized`] or [`AuthResult::Redirect`].
    ///
    /// # Errors
    ///
    /// [`Error::Unsupported`] if the server returns 404 on the metadata
    /// well-known URL. [`Error::Configuration`] if registration is required
    /// but no `registration_endpoint` is advertised, or if an authorization
    /// code was supplied before any client registration exists.
    /// [`Error::Unauthorized`]/[`Error::Transport`] on HTTP failures from
    /// the authorization server.
    pub async fn auth(
        &self,
        provider: &Provider,
        server_url: &Url,
        authorization_code: Option<&str>,
    ) -> Result<AuthResult> {
        let key = server_url.as_str();

        let metadata = match self.discover(server_url).await? {
            Some(m) => m,
            None => {
                return Err(Error::unsupported(
                    "Server does not support OAuth authentication",
                ))
            }
        };

        let client_info = self
            .ensure_client_registration(&metadata, provider, key, authorization_code)
            .await?;

        if let Some(code) = authorization_code {
            return self
                .exchange_code(&metadata, provider, &client_info, key, code)
                .await;
        }

        if let Some(tokens) = self.store.load_tokens(key).await? {
            if tokens.refresh_token.is_some() {
                match self.refresh(&metadata, &client_info, key, &tokens).await {
                    Ok(result) => return Ok(result),
                    Err(e) => {
                        warn!(server = %server_url, error = %e, "token refresh failed, falling back to full authorization");
                    }
                }
            }
        }

        self.start_authorization(&metadata, provider, key).await
    }

    async fn discover(&self, server_url: &Url) -> Result<Option<OAuthMetadata>> {
        let well_known = well_known_metadata_url(server_url)?;
        debug!(url = %well_known, "discovering oauth metadata");

        let response = self.http.get(well_known.clone()).send().await?;
        match response.status().as_u16() {
            404 => Ok(None),
            200 => {
                let body = response.text().await?;
                OAuthMetadata::parse(&body).map(Some)
            }
            status => {
                let message = response.text().await.unwrap_or_default();
                Err(Error::TransportStatus {
                    status,
                    message,
                })
            }
        }
    }

    async fn ensure_client_registration(
        &self,
        metadata: &OAuthMetadata,
        provider: &Provider,
        key: &str,
        authorization_code: Option<&str>,
    ) -> Result<OAuthClientInformation> {
        if let Some(info) = self.store.load_client_info(key).await? {
            return Ok(info);
        }

        if authorization_code.is_some() {
            return Err(Error::configuration(
                "code exchange requires prior client registration",
            ));
        }

        let registration_endpoint = metadata.registration_endpoint.clone().ok_or_else(|| {
            Error::configuration("server does not advertise a registration_endpoint")
        })?;

        provider.client_metadata.validate()?;

        info!(endpoint = %registration_endpoint, "registering oauth client");
        let response = self
            .http
            .post(&registration_endpoint)
            .json(&provider.client_metadata)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(Error::TransportStatus { status, message });
        }

        let info: OAuthClientInformation = response.json().await?;
        self.store.save_client_info(key, info.clone()).await?;
        Ok(info)
    }

    async fn exchange_code(
        &self,
        metadata: &OAuthMetadata,
        provider: &Provider,
        client_info: &OAuthClientInformation,
        key: &str,
        code: &str,
    ) -> Result<AuthResult> {
        let verifier = self
            .store
            .load_code_verifier(key)
            .await?
            .ok_or_else(|| Error::protocol("no PKCE verifier persisted for this authorization"))?;

        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", provider.redirect_uri.clone()),
            ("client_id", client_info.client_id.clone()),
            ("code_verifier", verifier),
        ];
        if let Some(secret) = &client_info.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let tokens = self.post_token_request(&metadata.token_endpoint, &form).await?;
        self.store.save_tokens(key, tokens).await?;
        info!(server = key, "authorization code exchange succeeded");
        Ok(AuthResult::Authorized)
    }

    async fn refresh(
        &self,
        metadata: &OAuthMetadata,
        client_info: &OAuthClientInformation,
        key: &str,
        current: &OAuthTokens,
    ) -> Result<AuthResult> {
        let tokens = self
            .refresh_with_metadata(metadata, client_info, key, current)
            .await?;
        self.store.save_tokens(key, tokens).await?;
        info!(server = key, "token refresh succeeded");
        Ok(AuthResult::Authorized)
    }

    async fn refresh_with_metadata(
        &self,
        metadata: &OAuthMetadata,
        client_info: &OAuthClientInformation,
        _key: &str,
        current: &OAuthTokens,
    ) -> Result<OAuthTokens> {
        let refresh_token = current
            .refresh_token
            .clone()
            .ok_or_else(|| Error::unauthorized("no refresh token available"))?;

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token),
            ("client_id", client_info.client_id.clone()),
        ];
        if let Some(secret) = &client_info.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        self.post_token_request(&metadata.token_endpoint, &form).await
    }

    /// Rediscover metadata and refresh tokens for `server_url`, used by
    /// [`crate::auth::token_source::TokenSource::refresh_token`]. Requires
    /// both a persisted refresh token and persisted client registration.
    ///
    /// # Errors
    ///
    /// [`Error::Unauthorized`] if no tokens/refresh token are stored, or the
    /// authorization server rejects the refresh. [`Error::Configuration`] if
    /// no client registration is stored.
    pub async fn refresh_token(&self, server_url: &Url) -> Result<OAuthTokens> {
        let key = server_url.as_str();

        let metadata = self
            .discover(server_url)
            .await?
            .ok_or_else(|| Error::unsupported("Server does not support OAuth authentication"))?;

        let client_info = self
            .store
            .load_client_info(key)
            .await?
            .ok_or_else(|| Error::configuration("no registered client available to refresh"))?;

        let current = self
            .store
            .load_tokens(key)
            .await?
            .ok_or_else(|| Error::unauthorized("no tokens stored to refresh"))?;

        let refreshed = self
            .refresh_with_metadata(&metadata, &client_info, key, &current)
            .await?;
        self.store.save_tokens(key, refreshed.clone()).await?;
        Ok(refreshed)
    }

    async fn post_token_request(
        &self,
        token_endpoint: &str,
        form: &[(&str, String)],
    ) -> Result<OAuthTokens> {
        let response = self.http.post(token_endpoint).form(form).send().await?;

        if response.status().as_u16() == 401 {
            return Err(Error::unauthorized("token endpoint rejected the request"));
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(Error::TransportStatus { status, message });
        }

        let raw: OAuthTokens = response.json().await?;
        Ok(raw.with_expiry(Utc::now()))
    }

    async fn start_authorization(
        &self,
        metadata: &OAuthMetadata,
        provider: &Provider,
        key: &str,
    ) -> Result<AuthResult> {
        pkce::verify_s256_support(metadata)?;

        let challenge = pkce::generate()?;
        self.store
            .save_code_verifier(key, challenge.verifier.clone())
            .await?;

        let client_info = self.store.load_client_info(key).await?.ok_or_else(|| {
            Error::configuration("no registered client available to start authorization")
        })?;

        let mut url = Url::parse(&metadata.authorization_endpoint)?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &client_info.client_id)
            .append_pair("redirect_uri", &provider.redirect_uri)
            .append_pair("code_challenge", &challenge.challenge)
            .append_pair("code_challenge_method", "S256");

        (provider.deliver_redirect)(&url);
        Ok(AuthResult::Redirect(url))
    }
}

/// RFC 8414 §3: the well-known path replaces the entire path at the
/// server's origin, regardless of any base path on `server_url`.
fn well_known_metadata_url(server_url: &Url) -> Result<Url> {
    let mut url = server_url.clone();
    url.set_path("/.well-known/oauth-authorization-server");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider() -> Provider {
        Provider {
            client_metadata: OAuthClientMetadata {
                redirect_uris: vec!["http://localhost:9999/callback".into()],
                client_name: Some("test-client".into()),
                scope: None,
                grant_types: Some(vec!["authorization_code".into(), "refresh_token".into()]),
                token_endpoint_auth_method: Some("none".into()),
                jwks: None,
                software_id: None,
            },
            redirect_uri: "http://localhost:9999/callback".into(),
            deliver_redirect: Arc::new(|_url| {}),
        }
    }

    #[test]
    fn well_known_url_replaces_existing_path() {
        let base = Url::parse("https://auth.example.com/tenant/abc?x=1").unwrap();
        let resolved = well_known_metadata_url(&base).unwrap();
        assert_eq!(
            resolved.as_str(),
            "https://auth.example.com/.well-known/oauth-authorization-server"
        );
    }

    #[tokio::test]
    async fn discovery_404_returns_unsupported_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = Arc::new(crate::auth::token_store::InMemoryTokenStore::new());
        let coordinator = AuthCoordinator::new(store);
        let server_url = Url::parse(&server.uri()).unwrap();

        let err = coordinator
            .auth(&provider(), &server_url, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[tokio::test]
    async fn discovery_non_404_failure_status_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = Arc::new(crate::auth::token_store::InMemoryTokenStore::new());
        let coordinator = AuthCoordinator::new(store);
        let server_url = Url::parse(&server.uri()).unwrap();

        let err = coordinator
            .auth(&provider(), &server_url, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransportStatus { status: 500, .. }));
    }

    #[tokio::test]
    async fn full_flow_redirects_then_exchanges_code() {
        let server = MockServer::start().await;
        let metadata_body = serde_json::json!({
            "issuer": server.uri(),
            "authorization_endpoint": format!("{}/authorize", server.uri()),
            "token_endpoint": format!("{}/token", server.uri()),
            "registration_endpoint": format!("{}/register", server.uri()),
            "response_types_supported": ["code"],
            "code_challenge_methods_supported": ["S256"],
        });
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&metadata_body))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/register"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "client_id": "client-123"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "A",
                "token_type": "bearer",
                "refresh_token": "R"
            })))
            .mount(&server)
            .await;

        let store = Arc::new(crate::auth::token_store::InMemoryTokenStore::new());
        let coordinator = AuthCoordinator::new(Arc::clone(&store) as Arc<dyn TokenStore>);
        let server_url = Url::parse(&server.uri()).unwrap();

        let first = coordinator.auth(&provider(), &server_url, None).await.unwrap();
        let redirect_url = match first {
            AuthResult::Redirect(url) => url,
            other => panic!("expected redirect, got {other:?}"),
        };
        assert_eq!(
            redirect_url.query_pairs().find(|(k, _)| k == "code_challenge_method").map(|(_, v)| v.into_owned()),
            Some("S256".to_string())
        );

        let second = coordinator
            .auth(&provider(), &server_url, Some("auth-code-xyz"))
            .await
            .unwrap();
        assert_eq!(second, AuthResult::Authorized);

        let tokens = store.load_tokens(server_url.as_str()).await.unwrap().unwrap();
        assert_eq!(tokens.access_token, "A");
    }
}
