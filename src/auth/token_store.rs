//! Pluggable persistence for tokens, client registration, and the PKCE code
//! verifier (§4.2). Four operation pairs, each keyed by a provider/server
//! identity string so one store instance can back multiple coordinators.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::auth::metadata::{OAuthClientInformation, OAuthTokens};
use crate::error::Result;

/// Persists OAuth tokens, client registration, and the PKCE verifier on
/// behalf of one [`crate::auth::coordinator::AuthCoordinator`] and one
/// [`crate::auth::token_source::TokenSource`].
///
/// Implementations must be safe for concurrent use. Any `load_*` method
/// returns `Ok(None)` -- not an error -- when the item has never been
/// stored for that key; the distinction matters because "absent" and
/// "failed to read" drive different control flow in the coordinator.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Persist tokens for `key` (typically a server URL or provider id).
    async fn save_tokens(&self, key: &str, tokens: OAuthTokens) -> Result<()>;
    /// Load previously persisted tokens for `key`, or `None` if absent.
    async fn load_tokens(&self, key: &str) -> Result<Option<OAuthTokens>>;
    /// Persist client registration information for `key`.
    async fn save_client_info(&self, key: &str, info: OAuthClientInformation) -> Result<()>;
    /// Load previously persisted client registration information for `key`.
    async fn load_client_info(&self, key: &str) -> Result<Option<OAuthClientInformation>>;
    /// Persist the PKCE code verifier started for `key`.
    async fn save_code_verifier(&self, key: &str, verifier: String) -> Result<()>;
    /// Load the PKCE code verifier previously persisted for `key`.
    async fn load_code_verifier(&self, key: &str) -> Result<Option<String>>;
    /// Remove any persisted tokens for `key`, e.g. after a 401 that a
    /// refresh could not recover from. Idempotent.
    async fn delete_tokens(&self, key: &str) -> Result<()>;
}

/// The reference [`TokenStore`]: each item held in a single in-memory slot
/// per key, guarded by an `RwLock`. Nothing survives process restart.
#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    tokens: RwLock<HashMap<String, OAuthTokens>>,
    client_info: RwLock<HashMap<String, OAuthClientInformation>>,
    code_verifiers: RwLock<HashMap<String, String>>,
}

impl InMemoryTokenStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn save_tokens(&self, key: &str, tokens: OAuthTokens) -> Result<()> {
        self.tokens
            .write()
            .expect("token store lock poisoned")
            .insert(key.to_string(), tokens);
        Ok(())
    }

    async fn load_tokens(&self, key: &str) -> Result<Option<OAuthTokens>> {
        Ok(self
            .tokens
            .read()
            .expect("token store lock poisoned")
            .get(key)
            .cloned())
    }

    async fn save_client_info(&self, key: &str, info: OAuthClientInformation) -> Result<()> {
        self.client_info
            .write()
            .expect("token store lock poisoned")
            .insert(key.to_string(), info);
        Ok(())
    }

    async fn load_client_info(&self, key: &str) -> Result<Option<OAuthClientInformation>> {
        Ok(self
            .client_info
            .read()
            .expect("token store lock poisoned")
            .get(key)
            .cloned())
    }

    async fn save_code_verifier(&self, key: &str, verifier: String) -> Result<()> {
        self.code_verifiers
            .write()
            .expect("token store lock poisoned")
            .insert(key.to_string(), verifier);
        Ok(())
    }

    async fn load_code_verifier(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .code_verifiers
            .read()
            .expect("token store lock poisoned")
            .get(key)
            .cloned())
    }

    async fn delete_tokens(&self, key: &str) -> Result<()> {
        self.tokens
            .write()
            .expect("token store lock poisoned")
            .remove(key);
        Ok(())
    }
}
