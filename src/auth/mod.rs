//! OAuth 2.1 + PKCE authorization: metadata/token types, the pluggable
//! token store, the authorization coordinator, and the token-source
//! adapter consumed by transports.

pub mod coordinator;
pub mod metadata;
pub mod pkce;
pub mod token_source;
pub mod token_store;

pub use coordinator::{AuthCoordinator, AuthResult, Provider};
pub use metadata::{OAuthClientInformation, OAuthClientMetadata, OAuthMetadata, OAuthTokens};
pub use token_source::TokenSource;
pub use token_store::{InMemoryTokenStore, TokenStore};
