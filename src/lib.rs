//! mcp-client-core -- a client-side runtime for concurrent, authenticated
//! JSON-RPC sessions with Model Context Protocol servers over pluggable
//! transports.
//!
//! # Architecture
//!
//! - `config`: the server settings schema (`mcp_servers` map) and validation.
//! - `types`: shared wire types -- the opaque JSON-RPC envelope and the
//!   event-stream message shape.
//! - `auth`: OAuth 2.1 + PKCE metadata/token types, the pluggable
//!   `TokenStore`, the `AuthCoordinator`, and the `TokenSource` adapter.
//! - `transport`: the shared `Transport` contract plus the SSE and stdio
//!   implementations.
//! - `jsonrpc`: request/response correlation for a connected transport.
//! - `hub`: supervises a fleet of named server connections.
//! - `error`: the crate's error taxonomy and result alias.
//!
//! # Example
//!
//! ```no_run
//! use mcp_client_core::hub::Hub;
//!
//! #[tokio::main]
//! async fn main() -> mcp_client_core::error::Result<()> {
//!     let hub = Hub::new(None);
//!     hub.ensure_started().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod hub;
pub mod jsonrpc;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
pub use hub::Hub;
