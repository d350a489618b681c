//! The transport contract shared between the SSE and stdio variants
//! (§4.5/§4.8 + the "Transport contract" row in §2): a small callback-based
//! interface so the Hub and the JSON-RPC client layer never need to know
//! which wire format a given server speaks.

pub mod event_stream;
pub mod sse;
pub mod stdio;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::JsonRpcMessage;

/// Installed before [`Transport::start`] to avoid losing early events.
/// Concurrent installation is permitted; callers synchronize externally.
pub type MessageHandler = Arc<dyn Fn(JsonRpcMessage) + Send + Sync>;
/// Invoked for observable, non-fatal failures (malformed frames, rejected
/// cross-origin endpoints, etc).
pub type ErrorHandler = Arc<dyn Fn(String) + Send + Sync>;
/// Invoked exactly once per transport lifetime, when the transport reaches
/// [`ConnectionState::Closed`].
pub type CloseHandler = Arc<dyn Fn() + Send + Sync>;

/// The transport state machine from §4.5: `New -> Connecting ->
/// EndpointKnown(Ready) -> Closed`. An error in any non-terminal state
/// transitions directly to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, `start` not yet called.
    New,
    /// `start` called, inbound channel opening.
    Connecting,
    /// The endpoint (or stdio's equivalent "ready to send") is known;
    /// `send` is now permitted.
    EndpointKnown,
    /// Terminal. Idempotent to re-enter.
    Closed,
}

/// Common interface between the Hub/Client layer and any transport (SSE,
/// stdio, ...).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the inbound channel and block until ready, cancelled, or timed
    /// out. Fails if already started (idempotency requirement from §4.5).
    async fn start(&self, cancel: CancellationToken) -> Result<()>;

    /// Serialize and deliver one outbound message. Fails if [`Transport::start`]
    /// has not yet reached [`ConnectionState::EndpointKnown`].
    async fn send(&self, msg: JsonRpcMessage) -> Result<()>;

    /// Idempotent. Cancels the inbound read, releases underlying resources,
    /// clears state, and invokes the close handler exactly once.
    async fn close(&self) -> Result<()>;

    /// Install the handler invoked for each successfully parsed inbound
    /// message.
    fn set_message_handler(&self, handler: MessageHandler);

    /// Install the handler invoked for observable, non-fatal failures.
    fn set_error_handler(&self, handler: ErrorHandler);

    /// Install the handler invoked exactly once when the transport closes.
    fn set_close_handler(&self, handler: CloseHandler);

    /// An opaque per-connection identifier. May be `None` for transports
    /// (like SSE) that have no session concept of their own.
    fn session_id(&self) -> Option<String>;

    /// The current state, primarily for diagnostics and tests.
    fn state(&self) -> ConnectionState;
}
