//! Error types for the MCP client core.
//!
//! Every fallible operation in this crate returns [`Result`], whose error
//! side is [`Error`] -- a small, closed taxonomy matching the five kinds a
//! caller needs to distinguish: [`Error::Unsupported`], [`Error::Unauthorized`],
//! [`Error::Protocol`], [`Error::Transport`], and [`Error::Configuration`].

use thiserror::Error;

/// Result type alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error taxonomy surfaced by the MCP client core.
///
/// Each variant corresponds to one of the caller-distinguishable kinds:
/// the server doesn't support a feature, a credential was rejected, the
/// wire protocol was violated, the underlying transport failed, or the
/// supplied configuration was invalid.
#[derive(Error, Debug)]
pub enum Error {
    /// The server does not support the requested capability (e.g. a 404 on
    /// the OAuth metadata well-known URL).
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Credentials were missing, rejected, or a refresh attempt failed.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The wire protocol was violated: malformed SSE framing, malformed
    /// JSON-RPC, a missing required field, a non-matching endpoint origin,
    /// or an unknown transport type.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The underlying transport failed: socket/IO error, a non-2xx/non-401
    /// HTTP status, or cancellation.
    #[error("transport error: {0}")]
    Transport(String),

    /// Transport failed with cancellation specifically, distinguished from
    /// other transport failures per the cancellation-is-not-an-error rule.
    #[error("transport cancelled")]
    Cancelled,

    /// An HTTP call returned a non-2xx, non-401 status code.
    #[error("transport error: unexpected status {status}: {message}")]
    TransportStatus {
        /// The HTTP status code received.
        status: u16,
        /// The response body or a short description.
        message: String,
    },

    /// The supplied configuration was invalid: missing `command`/`url`,
    /// a below-minimum timeout, missing `redirect_uris`, an unknown
    /// transport type, etc.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Wraps a `serde_json` (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Wraps a `reqwest` error not otherwise classified above.
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Wraps a malformed URL.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    /// Wraps an I/O failure (subprocess spawn, pipe read/write, file load).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for [`Error::Unsupported`].
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    /// Shorthand for [`Error::Unauthorized`].
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Error::Unauthorized(msg.into())
    }

    /// Shorthand for [`Error::Protocol`].
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Shorthand for [`Error::Transport`].
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// Shorthand for [`Error::Configuration`].
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    /// True if this error represents an HTTP 401 response.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Error::Unauthorized(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_stable_prefixes() {
        assert!(Error::unsupported("no oauth").to_string().starts_with("unsupported"));
        assert!(Error::unauthorized("bad token")
            .to_string()
            .starts_with("unauthorized"));
        assert!(Error::protocol("bad frame").to_string().starts_with("protocol error"));
        assert!(Error::transport("closed").to_string().starts_with("transport error"));
        assert!(Error::configuration("bad timeout")
            .to_string()
            .starts_with("configuration error"));
    }

    #[test]
    fn is_unauthorized_only_matches_unauthorized_variant() {
        assert!(Error::unauthorized("x").is_unauthorized());
        assert!(!Error::protocol("x").is_unauthorized());
    }

    #[test]
    fn transport_status_formats_code_and_message() {
        let err = Error::TransportStatus {
            status: 500,
            message: "boom".into(),
        };
        assert_eq!(
            err.to_string(),
            "transport error: unexpected status 500: boom"
        );
    }
}
