//! The Client layer (§4.9): wraps an `Arc<dyn Transport>` with request-id
//! generation, response correlation, and notification dispatch, keeping the
//! JSON-RPC envelope opaque at the transport boundary and typed only here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::Transport;
use crate::types::{JsonRpcError, JsonRpcMessage};

/// Invoked for an inbound JSON-RPC request or notification that does not
/// correlate to a pending outbound call (a server-initiated message).
pub type NotificationHandler = Arc<dyn Fn(JsonRpcMessage) + Send + Sync>;

// `serde_json::Value` does not implement `Hash`, so pending requests are
// keyed by the id's canonical JSON string rather than the `Value` itself.
type PendingMap = AsyncMutex<HashMap<String, oneshot::Sender<JsonRpcMessage>>>;

/// A per-connection JSON-RPC client sitting above one [`Transport`].
///
/// Owns a monotonic request-id counter and a pending-request map so
/// responses arriving asynchronously through the transport's message
/// handler can be correlated back to the `request()` call awaiting them.
/// Payloads (`params`/`result`) are never interpreted here -- only `id`,
/// `method`, and the presence of `result`/`error` matter at this layer.
pub struct JsonRpcClient {
    transport: Arc<dyn Transport>,
    next_id: AtomicI64,
    pending: PendingMap,
    notification_handler: AsyncMutex<Option<NotificationHandler>>,
}

impl JsonRpcClient {
    /// Wrap `transport`, installing this client's message handler on it.
    /// `transport.start(..)` must still be called separately by the owner
    /// (the Hub) once it also wants the connection live.
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        let client = Arc::new(Self {
            transport: Arc::clone(&transport),
            next_id: AtomicI64::new(1),
            pending: AsyncMutex::new(HashMap::new()),
            notification_handler: AsyncMutex::new(None),
        });

        // Weak, not Arc: the transport outlives this closure inside its own
        // handler slot, so a strong reference here would cycle client <->
        // transport and neither would ever drop.
        let dispatch_target = Arc::downgrade(&client);
        transport.set_message_handler(Arc::new(move |msg| {
            if let Some(client) = dispatch_target.upgrade() {
                tokio::spawn(async move {
                    client.handle_inbound(msg).await;
                });
            }
        }));

        client
    }

    /// Install the handler invoked for inbound messages that do not
    /// correlate to a pending request (notifications, server-initiated
    /// requests).
    pub async fn set_notification_handler(&self, handler: NotificationHandler) {
        *self.notification_handler.lock().await = Some(handler);
    }

    // Correlation is by `id` alone, matching the pending-request map, not by
    // the presence of `result`/`error`: a JSON-RPC response to a call with no
    // return value is legally `{"jsonrpc":"2.0","id":1,"result":null}`, and
    // serde maps a literal JSON `null` to `None`, so `result.is_some()` would
    // wrongly say that message isn't a response at all.
    async fn handle_inbound(&self, msg: JsonRpcMessage) {
        if let Some(id) = &msg.id {
            let key = id.to_string();
            let sender = self.pending.lock().await.remove(&key);
            if let Some(sender) = sender {
                let _ = sender.send(msg);
                return;
            }
        }

        if let Some(handler) = self.notification_handler.lock().await.clone() {
            handler(msg);
        }
    }

    fn next_request_id(&self) -> Value {
        Value::from(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Issue a JSON-RPC request and await its correlated response.
    ///
    /// # Errors
    ///
    /// [`Error::Transport`] if the underlying send fails or the request
    /// times out; [`Error::Protocol`] if the response carries a JSON-RPC
    /// error object.
    pub async fn request(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
        let id = self.next_request_id();
        let key = id.to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(key.clone(), tx);

        let request = JsonRpcMessage {
            jsonrpc: "2.0".to_string(),
            id: Some(id.clone()),
            method: Some(method.to_string()),
            params,
            result: None,
            error: None,
            extra: HashMap::new(),
        };

        debug!(%method, "sending json-rpc request");
        if let Err(e) = self.transport.send(request).await {
            self.pending.lock().await.remove(&key);
            return Err(e);
        }

        let response = tokio::time::timeout(timeout, rx).await.map_err(|_| {
            Error::transport(format!("request `{method}` timed out after {timeout:?}"))
        })?;

        let response = response
            .map_err(|_| Error::transport("transport closed before a response arrived"))?;

        match response.error {
            Some(JsonRpcError { code, message, .. }) => {
                Err(Error::protocol(format!("json-rpc error {code}: {message}")))
            }
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }

    /// Send a one-way notification; no response is awaited.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcMessage {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: Some(method.to_string()),
            params,
            result: None,
            error: None,
            extra: HashMap::new(),
        };
        self.transport.send(notification).await
    }

    /// Start the underlying transport.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        self.transport.start(cancel).await
    }

    /// Close the underlying transport, failing any pending requests.
    pub async fn close(&self) -> Result<()> {
        let result = self.transport.close().await;
        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            drop(sender);
        }
        result
    }

    /// The wrapped transport, primarily for the Hub to read `session_id`/`state`.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}
