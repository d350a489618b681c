//! OAuth metadata and token types (§4.1): pure data with constructors that
//! validate and reject on missing required fields.

use std::collections::HashMap;

use chrono::serde::ts_seconds_option;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// RFC 8414 authorization server metadata.
///
/// `issuer`, `authorization_endpoint`, `token_endpoint`, and
/// `response_types_supported` are required; every other advertised field is
/// preserved verbatim in `extra` for forward compatibility.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuthMetadata {
    /// The authorization server's issuer identifier.
    pub issuer: String,
    /// The authorization endpoint URL.
    pub authorization_endpoint: String,
    /// The token endpoint URL.
    pub token_endpoint: String,
    /// The response types the server supports (e.g. `["code"]`).
    pub response_types_supported: Vec<String>,
    /// The dynamic client registration endpoint, if advertised.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,
    /// Scopes the server supports, if advertised.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes_supported: Option<Vec<String>>,
    /// PKCE code challenge methods the server supports, if advertised.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_challenge_methods_supported: Option<Vec<String>>,
    /// Every other field the server advertised, preserved verbatim.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl OAuthMetadata {
    /// Parse and validate RFC 8414 metadata from a raw JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the body is not valid JSON, or if any
    /// required field (`issuer`, `authorization_endpoint`, `token_endpoint`,
    /// `response_types_supported`) is missing.
    pub fn parse(body: &str) -> Result<Self> {
        let metadata: OAuthMetadata = serde_json::from_str(body)
            .map_err(|e| Error::protocol(format!("invalid oauth metadata: {e}")))?;
        metadata.validate()?;
        Ok(metadata)
    }

    fn validate(&self) -> Result<()> {
        if self.issuer.is_empty() {
            return Err(Error::protocol("oauth metadata missing `issuer`"));
        }
        if self.authorization_endpoint.is_empty() {
            return Err(Error::protocol(
                "oauth metadata missing `authorization_endpoint`",
            ));
        }
        if self.token_endpoint.is_empty() {
            return Err(Error::protocol("oauth metadata missing `token_endpoint`"));
        }
        if self.response_types_supported.is_empty() {
            return Err(Error::protocol(
                "oauth metadata missing `response_types_supported`",
            ));
        }
        Ok(())
    }

    /// True iff the server advertises PKCE `S256` support.
    pub fn supports_s256(&self) -> bool {
        self.code_challenge_methods_supported
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .any(|m| m == "S256")
    }
}

/// RFC 7591 client registration metadata, as sent to `registration_endpoint`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuthClientMetadata {
    /// At least one redirect URI is required; every entry must parse as a
    /// syntactically valid URI reference.
    pub redirect_uris: Vec<String>,
    /// A human-readable client name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    /// Requested scope string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Requested grant types.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_types: Option<Vec<String>>,
    /// Requested token endpoint auth method.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_method: Option<String>,
    /// JSON Web Key Set, if the client presents one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks: Option<Value>,
    /// A stable identifier for this piece of client software.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub software_id: Option<String>,
}

impl OAuthClientMetadata {
    /// Require at least one redirect URI, each a syntactically valid URI.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when `redirect_uris` is empty or any
    /// entry fails to parse as a URI reference.
    pub fn validate(&self) -> Result<()> {
        if self.redirect_uris.is_empty() {
            return Err(Error::configuration(
                "client metadata requires at least one redirect_uri",
            ));
        }
        for uri in &self.redirect_uris {
            url::Url::parse(uri)
                .map_err(|e| Error::configuration(format!("invalid redirect_uri `{uri}`: {e}")))?;
        }
        Ok(())
    }
}

/// RFC 7591 client information, as returned by the registration endpoint and
/// persisted by the [`crate::auth::token_store::TokenStore`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuthClientInformation {
    /// The issued client identifier.
    pub client_id: String,
    /// The issued client secret, if any (public clients have none).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Unix epoch seconds at which the client was registered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id_issued_at: Option<i64>,
    /// Unix epoch seconds at which `client_secret` expires. `0` means "never
    /// expires" per the invariant in §3.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<i64>,
}

impl OAuthClientInformation {
    /// `false` iff the secret is not expirable (`client_secret_expires_at`
    /// is `None` or `0`) or the stored expiry lies in the future.
    pub fn is_client_secret_expired(&self) -> bool {
        match self.client_secret_expires_at {
            None | Some(0) => false,
            Some(expires_at) => expires_at <= Utc::now().timestamp(),
        }
    }
}

/// An OAuth token response (RFC 6749 §5.1), plus a derived absolute expiry
/// used for freshness checks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuthTokens {
    /// The access token. Required.
    pub access_token: String,
    /// The token type, e.g. `"bearer"`. Required.
    pub token_type: String,
    /// Seconds until expiry, relative to when the response was received.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    /// Scope actually granted, if the server echoes it back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// The refresh token, if the server issued one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// The absolute wall-clock expiry derived from `expires_in` at receipt
    /// time. Not a wire field: computed by [`OAuthTokens::with_expiry`] and
    /// used by [`OAuthTokens::is_expired`].
    #[serde(default, with = "ts_seconds_option", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Freshness checks treat a token as expired this many seconds before its
/// actual expiry, so an in-flight request does not race a token that
/// expires mid-call.
const EXPIRY_SKEW_SECS: i64 = 60;

impl OAuthTokens {
    /// Stamp `expires_at` from `expires_in`, relative to `now`. Call this
    /// once, immediately after receiving a token response.
    pub fn with_expiry(mut self, now: DateTime<Utc>) -> Self {
        self.expires_at = self
            .expires_in
            .map(|secs| now + chrono::Duration::seconds(secs));
        self
    }

    /// `true` if these tokens are expired or within the refresh skew window.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now >= expires_at - chrono::Duration::seconds(EXPIRY_SKEW_SECS),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_metadata_json() -> &'static str {
        r#"{
            "issuer": "https://auth.example.com",
            "authorization_endpoint": "https://auth.example.com/authorize",
            "token_endpoint": "https://auth.example.com/token",
            "response_types_supported": ["code"],
            "code_challenge_methods_supported": ["S256"],
            "some_future_field": "preserved"
        }"#
    }

    #[test]
    fn parse_accepts_valid_metadata_and_preserves_extra_fields() {
        let meta = OAuthMetadata::parse(valid_metadata_json()).unwrap();
        assert_eq!(meta.issuer, "https://auth.example.com");
        assert!(meta.supports_s256());
        assert_eq!(
            meta.extra.get("some_future_field").and_then(|v| v.as_str()),
            Some("preserved")
        );
    }

    #[test]
    fn parse_rejects_missing_required_field() {
        let body = r#"{"issuer": "https://auth.example.com"}"#;
        assert!(OAuthMetadata::parse(body).is_err());
    }

    #[test]
    fn round_trips_through_serialize_parse() {
        let meta = OAuthMetadata::parse(valid_metadata_json()).unwrap();
        let serialized = serde_json::to_string(&meta).unwrap();
        let reparsed = OAuthMetadata::parse(&serialized).unwrap();
        assert_eq!(meta, reparsed);
    }

    #[test]
    fn client_metadata_requires_redirect_uri() {
        let meta = OAuthClientMetadata {
            redirect_uris: vec![],
            client_name: None,
            scope: None,
            grant_types: None,
            token_endpoint_auth_method: None,
            jwks: None,
            software_id: None,
        };
        assert!(meta.validate().is_err());
    }

    #[test]
    fn client_metadata_rejects_malformed_redirect_uri() {
        let meta = OAuthClientMetadata {
            redirect_uris: vec!["not a uri".into()],
            client_name: None,
            scope: None,
            grant_types: None,
            token_endpoint_auth_method: None,
            jwks: None,
            software_id: None,
        };
        assert!(meta.validate().is_err());
    }

    #[test]
    fn zero_client_secret_expiry_means_never_expires() {
        let info = OAuthClientInformation {
            client_id: "abc".into(),
            client_secret: Some("shh".into()),
            client_id_issued_at: None,
            client_secret_expires_at: Some(0),
        };
        assert!(!info.is_client_secret_expired());
    }

    #[test]
    fn past_client_secret_expiry_is_expired() {
        let info = OAuthClientInformation {
            client_id: "abc".into(),
            client_secret: Some("shh".into()),
            client_id_issued_at: None,
            client_secret_expires_at: Some(1),
        };
        assert!(info.is_client_secret_expired());
    }

    #[test]
    fn tokens_with_expiry_are_fresh_immediately_after_receipt() {
        let now = Utc::now();
        let tokens = OAuthTokens {
            access_token: "A".into(),
            token_type: "bearer".into(),
            expires_in: Some(3600),
            scope: None,
            refresh_token: Some("R".into()),
            expires_at: None,
        }
        .with_expiry(now);
        assert!(!tokens.is_expired(now));
    }

    #[test]
    fn tokens_without_expires_in_never_expire() {
        let now = Utc::now();
        let tokens = OAuthTokens {
            access_token: "A".into(),
            token_type: "bearer".into(),
            expires_in: None,
            scope: None,
            refresh_token: None,
            expires_at: None,
        }
        .with_expiry(now);
        assert!(!tokens.is_expired(now + chrono::Duration::days(365)));
    }

    #[test]
    fn tokens_within_skew_window_are_treated_as_expired() {
        let now = Utc::now();
        let tokens = OAuthTokens {
            access_token: "A".into(),
            token_type: "bearer".into(),
            expires_in: Some(30),
            scope: None,
            refresh_token: None,
            expires_at: None,
        }
        .with_expiry(now);
        assert!(tokens.is_expired(now));
    }
}
