//! PKCE S256 challenge generation (RFC 7636), as required by OAuth 2.1.
//!
//! The verifier is a high-entropy string of `[43,128]` characters drawn
//! from the unreserved set; a requested length outside that range is
//! normalized to the default of 64 rather than rejected, matching §8's
//! boundary-behavior requirement.

use base64::Engine as _;
use rand::RngCore as _;
use sha2::{Digest, Sha256};

use crate::auth::metadata::OAuthMetadata;
use crate::error::{Error, Result};

/// Default verifier length per §6's defaults table.
pub const DEFAULT_VERIFIER_LENGTH: usize = 64;
const MIN_VERIFIER_LENGTH: usize = 43;
const MAX_VERIFIER_LENGTH: usize = 128;

/// A PKCE S256 challenge pair: the verifier (persisted between authorization
/// start and code exchange) and its derived challenge (sent in the
/// authorization URL).
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    /// The code verifier. Base64url (no padding) of `length` random bytes,
    /// where `length` has already been normalized into `[43,128]`.
    pub verifier: String,
    /// `base64url_no_pad(SHA-256(verifier))`.
    pub challenge: String,
    /// Always `"S256"`.
    pub method: String,
}

/// Normalize a requested verifier character length into `[43,128]`,
/// substituting [`DEFAULT_VERIFIER_LENGTH`] for any value outside that
/// range.
pub fn normalize_length(requested: usize) -> usize {
    if (MIN_VERIFIER_LENGTH..=MAX_VERIFIER_LENGTH).contains(&requested) {
        requested
    } else {
        DEFAULT_VERIFIER_LENGTH
    }
}

/// Generate a fresh PKCE S256 challenge using [`DEFAULT_VERIFIER_LENGTH`].
pub fn generate() -> Result<PkceChallenge> {
    generate_with_length(DEFAULT_VERIFIER_LENGTH)
}

/// Generate a fresh PKCE S256 challenge with a specific verifier length.
///
/// `requested_length` is normalized via [`normalize_length`] first, so any
/// out-of-range request silently falls back to the default rather than
/// failing.
///
/// Base64url (no padding) encodes 3 input bytes as 4 output characters; the
/// byte count is derived from the normalized character length by rounding up
/// (`ceil(length * 3 / 4)`), then the resulting base64url string is
/// truncated to exactly `length` characters so the output length is exact
/// even though byte-to-character base64 conversion is not always an integer
/// ratio.
pub fn generate_with_length(requested_length: usize) -> Result<PkceChallenge> {
    let length = normalize_length(requested_length);
    let byte_len = (length * 3).div_ceil(4);

    let mut random_bytes = vec![0u8; byte_len];
    rand::rng().fill_bytes(&mut random_bytes);

    let mut verifier = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&random_bytes);
    verifier.truncate(length);

    let digest = Sha256::digest(verifier.as_bytes());
    let challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest.as_slice());

    Ok(PkceChallenge {
        verifier,
        challenge,
        method: "S256".to_string(),
    })
}

/// Recompute the S256 challenge for an already-persisted verifier, e.g. to
/// rebuild the authorization URL after a process restart.
pub fn challenge_for_verifier(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest.as_slice())
}

/// Verify that the authorization server advertises PKCE `S256` support.
///
/// OAuth 2.1 mandates PKCE for all public clients; refusing to proceed
/// without `S256` support is the correct security posture.
///
/// # Errors
///
/// Returns [`Error::Unsupported`] when `S256` is absent from
/// `code_challenge_methods_supported` or the field is missing entirely.
pub fn verify_s256_support(metadata: &OAuthMetadata) -> Result<()> {
    if metadata.supports_s256() {
        Ok(())
    } else {
        Err(Error::unsupported(
            "PKCE S256 not supported by authorization server",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_metadata(methods: Option<Vec<String>>) -> OAuthMetadata {
        OAuthMetadata {
            issuer: "https://auth.example.com".to_string(),
            authorization_endpoint: "https://auth.example.com/authorize".to_string(),
            token_endpoint: "https://auth.example.com/token".to_string(),
            response_types_supported: vec!["code".to_string()],
            registration_endpoint: None,
            scopes_supported: None,
            code_challenge_methods_supported: methods,
            extra: HashMap::new(),
        }
    }

    #[test]
    fn default_generate_produces_64_char_verifier() {
        let pkce = generate().unwrap();
        assert_eq!(pkce.verifier.len(), DEFAULT_VERIFIER_LENGTH);
        assert_eq!(pkce.method, "S256");
    }

    #[test]
    fn challenge_matches_s256_of_verifier() {
        let pkce = generate().unwrap();
        assert_eq!(challenge_for_verifier(&pkce.verifier), pkce.challenge);
    }

    #[test]
    fn verifier_uses_url_safe_base64_no_padding() {
        let pkce = generate().unwrap();
        assert!(pkce
            .verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn length_below_minimum_is_normalized_to_default() {
        let pkce = generate_with_length(10).unwrap();
        assert_eq!(pkce.verifier.len(), DEFAULT_VERIFIER_LENGTH);
    }

    #[test]
    fn length_above_maximum_is_normalized_to_default() {
        let pkce = generate_with_length(500).unwrap();
        assert_eq!(pkce.verifier.len(), DEFAULT_VERIFIER_LENGTH);
    }

    #[test]
    fn minimum_boundary_length_is_honored() {
        let pkce = generate_with_length(43).unwrap();
        assert_eq!(pkce.verifier.len(), 43);
    }

    #[test]
    fn maximum_boundary_length_is_honored() {
        let pkce = generate_with_length(128).unwrap();
        assert_eq!(pkce.verifier.len(), 128);
    }

    #[test]
    fn successive_calls_produce_distinct_verifiers() {
        let a = generate().unwrap();
        let b = generate().unwrap();
        assert_ne!(a.verifier, b.verifier);
    }

    #[test]
    fn s256_known_answer_rfc7636_appendix_b() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            challenge_for_verifier(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn verify_s256_support_accepts_when_present() {
        let meta = make_metadata(Some(vec!["S256".to_string()]));
        assert!(verify_s256_support(&meta).is_ok());
    }

    #[test]
    fn verify_s256_support_rejects_when_absent() {
        let meta = make_metadata(Some(vec!["plain".to_string()]));
        assert!(verify_s256_support(&meta).is_err());
    }

    #[test]
    fn verify_s256_support_rejects_when_missing() {
        let meta = make_metadata(None);
        assert!(verify_s256_support(&meta).is_err());
    }

    #[test]
    fn verify_s256_support_is_case_sensitive() {
        let meta = make_metadata(Some(vec!["s256".to_string()]));
        assert!(verify_s256_support(&meta).is_err());
    }
}
