//! The SSE transport (§4.5): opens a GET to the configured URL, blocks
//! until the server publishes an `endpoint` event, then fans inbound
//! `message` events to the installed handler and POSTs outbound messages to
//! the resolved endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::{oneshot, Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::auth::token_source::TokenSource;
use crate::error::{Error, Result};
use crate::transport::event_stream::EventStreamReader;
use crate::transport::{CloseHandler, ConnectionState, ErrorHandler, MessageHandler, Transport};
use crate::types::JsonRpcMessage;

const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(30);

struct Inner {
    connect_url: Url,
    http: reqwest::Client,
    token_source: Option<Arc<TokenSource>>,
    extra_headers: HashMap<String, String>,
    state: AsyncRwLock<ConnectionState>,
    endpoint: AsyncRwLock<Option<Url>>,
    // Plain `std::sync::Mutex`, not `tokio::sync::RwLock`: these are
    // installed via a synchronous trait method (no `.await` available) and
    // must be visible to the caller before `set_*_handler` returns, per the
    // "install before Start" contract.
    message_handler: StdMutex<Option<MessageHandler>>,
    error_handler: StdMutex<Option<ErrorHandler>>,
    close_handler: StdMutex<Option<CloseHandler>>,
    close_fired: AtomicBool,
    cancel: AsyncRwLock<Option<CancellationToken>>,
}

/// Implements [`Transport`] over a Server-Sent Events inbound channel and an
/// HTTP POST outbound channel.
pub struct SseTransport {
    inner: Arc<Inner>,
    started: AtomicBool,
}

impl SseTransport {
    /// Construct a transport that will connect to `connect_url` on
    /// [`Transport::start`]. `extra_headers` are cloned onto every request;
    /// `token_source` (if present) supplies `Authorization: Bearer ...`.
    pub fn new(
        connect_url: Url,
        extra_headers: HashMap<String, String>,
        token_source: Option<Arc<TokenSource>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connect_url,
                http: reqwest::Client::new(),
                token_source,
                extra_headers,
                state: AsyncRwLock::new(ConnectionState::New),
                endpoint: AsyncRwLock::new(None),
                message_handler: StdMutex::new(None),
                error_handler: StdMutex::new(None),
                close_handler: StdMutex::new(None),
                close_fired: AtomicBool::new(false),
                cancel: AsyncRwLock::new(None),
            }),
            started: AtomicBool::new(false),
        }
    }

    /// The connect URL, primarily for tests.
    pub fn connect_url(&self) -> &Url {
        &self.inner.connect_url
    }

    /// The resolved POST endpoint, once known.
    pub async fn endpoint(&self) -> Option<Url> {
        self.inner.endpoint.read().await.clone()
    }

    async fn build_headers(&self, accept_sse: bool) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (k, v) in &self.inner.extra_headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(k.as_str()),
                HeaderValue::from_str(v),
            ) {
                headers.insert(name, value);
            }
        }
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static(if accept_sse {
                "text/event-stream"
            } else {
                "application/json"
            }),
        );
        if !accept_sse {
            headers.insert(
                reqwest::header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }
        if let Some(source) = &self.inner.token_source {
            if let Some(token) = source.get_token().await? {
                if !token.is_empty() {
                    let value = HeaderValue::from_str(&format!("Bearer {token}"))
                        .map_err(|e| Error::protocol(format!("invalid bearer token: {e}")))?;
                    headers.insert(reqwest::header::AUTHORIZATION, value);
                }
            }
        }
        Ok(headers)
    }

    async fn fire_error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(url = %self.inner.connect_url, %message, "sse transport error");
        if let Some(handler) = self.inner.error_handler.lock().expect("handler lock poisoned").clone() {
            handler(message);
        }
    }

    async fn fire_close_once(&self) {
        if self
            .inner
            .close_fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self.inner.state.write().await = ConnectionState::Closed;
            if let Some(handler) = self.inner.close_handler.lock().expect("handler lock poisoned").clone() {
                handler();
            }
        }
    }

    async fn publish_endpoint(&self, url: Url, ready_tx: &AsyncMutex<Option<oneshot::Sender<Result<()>>>>) {
        let mut guard = self.inner.endpoint.write().await;
        let first_time = guard.is_none();
        *guard = Some(url);
        if first_time {
            *self.inner.state.write().await = ConnectionState::EndpointKnown;
            if let Some(tx) = ready_tx.lock().await.take() {
                let _ = tx.send(Ok(()));
            }
        }
        // subsequent endpoint events replace the endpoint without re-signaling
    }

    fn resolve_endpoint(&self, raw: &str) -> Result<Url> {
        resolve_endpoint_against(&self.inner.connect_url, raw)
    }

    async fn run_connection(
        self: Arc<Self>,
        cancel: CancellationToken,
        ready_tx: Arc<AsyncMutex<Option<oneshot::Sender<Result<()>>>>>,
    ) {
        let mut attempted_refresh = false;
        loop {
            let headers = match self.build_headers(true).await {
                Ok(h) => h,
                Err(e) => {
                    self.fail_connect(&ready_tx, e).await;
                    return;
                }
            };

            let request = self
                .inner
                .http
                .get(self.inner.connect_url.clone())
                .headers(headers)
                .send();

            let response = tokio::select! {
                r = request => r,
                _ = cancel.cancelled() => {
                    self.fail_connect(&ready_tx, Error::Cancelled).await;
                    return;
                }
            };

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    self.fail_connect(&ready_tx, Error::from(e)).await;
                    return;
                }
            };

            if response.status().as_u16() == 401 {
                if !attempted_refresh {
                    if let Some(source) = &self.inner.token_source {
                        attempted_refresh = true;
                        if source.refresh_token().await.is_ok() {
                            continue;
                        }
                    }
                }
                self.fail_connect(&ready_tx, Error::unauthorized("sse connect rejected with 401"))
                    .await;
                return;
            }

            if !response.status().is_success() {
                let status = response.status().as_u16();
                let message = response.text().await.unwrap_or_default();
                self.fail_connect(&ready_tx, Error::TransportStatus { status, message })
                    .await;
                return;
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            if !content_type.starts_with("text/event-stream") {
                self.fail_connect(
                    &ready_tx,
                    Error::protocol(format!("unexpected content-type: {content_type}")),
                )
                .await;
                return;
            }

            debug!(url = %self.inner.connect_url, "sse connected");
            self.read_body(response, cancel, ready_tx).await;
            return;
        }
    }

    async fn fail_connect(
        &self,
        ready_tx: &AsyncMutex<Option<oneshot::Sender<Result<()>>>>,
        err: Error,
    ) {
        if !matches!(err, Error::Cancelled) {
            self.fire_error(err.to_string()).await;
        }
        if let Some(tx) = ready_tx.lock().await.take() {
            let _ = tx.send(Err(err));
        }
        self.fire_close_once().await;
    }

    async fn read_body(
        self: Arc<Self>,
        response: reqwest::Response,
        cancel: CancellationToken,
        ready_tx: Arc<AsyncMutex<Option<oneshot::Sender<Result<()>>>>>,
    ) {
        use futures::StreamExt;

        let mut stream = response.bytes_stream();
        let mut reader = EventStreamReader::new();

        loop {
            let next = tokio::select! {
                n = stream.next() => n,
                _ = cancel.cancelled() => {
                    self.fire_close_once().await;
                    return;
                }
            };

            match next {
                Some(Ok(bytes)) => {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    for event in reader.feed(&text) {
                        self.dispatch_event(event, &ready_tx).await;
                    }
                }
                Some(Err(e)) => {
                    self.fire_error(e.to_string()).await;
                    if let Some(tx) = ready_tx.lock().await.take() {
                        let _ = tx.send(Err(Error::transport(e.to_string())));
                    }
                    self.fire_close_once().await;
                    return;
                }
                None => {
                    // EOF is clean closure.
                    for event in reader.finish() {
                        self.dispatch_event(event, &ready_tx).await;
                    }
                    self.fire_close_once().await;
                    return;
                }
            }
        }
    }

    async fn dispatch_event(
        &self,
        event: crate::types::EventStreamMessage,
        ready_tx: &AsyncMutex<Option<oneshot::Sender<Result<()>>>>,
    ) {
        match event.event.as_str() {
            "message" => match serde_json::from_str::<JsonRpcMessage>(&event.data) {
                Ok(msg) => {
                    if let Some(handler) = self.inner.message_handler.lock().expect("handler lock poisoned").clone() {
                        handler(msg);
                    }
                }
                Err(e) => {
                    self.fire_error(format!("malformed json-rpc message: {e}")).await;
                }
            },
            "endpoint" => match self.resolve_endpoint(&event.data) {
                Ok(url) => self.publish_endpoint(url, ready_tx).await,
                Err(e) => {
                    self.fire_error(e.to_string()).await;
                }
            },
            _ => {}
        }
    }
}

fn resolve_endpoint_against(connect_url: &Url, raw: &str) -> Result<Url> {
    match Url::parse(raw) {
        Ok(absolute) => {
            if absolute.scheme() == connect_url.scheme() && absolute.host() == connect_url.host() {
                Ok(absolute)
            } else {
                Err(Error::protocol(format!(
                    "endpoint origin {}://{:?} does not match connect origin {}://{:?}",
                    absolute.scheme(),
                    absolute.host(),
                    connect_url.scheme(),
                    connect_url.host(),
                )))
            }
        }
        Err(_) => connect_url
            .join(raw)
            .map_err(|e| Error::protocol(format!("invalid relative endpoint: {e}"))),
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::protocol("transport already started"));
        }
        *self.inner.state.write().await = ConnectionState::Connecting;
        *self.inner.cancel.write().await = Some(cancel.clone());

        let (ready_tx, ready_rx) = oneshot::channel();
        let ready_tx = Arc::new(AsyncMutex::new(Some(ready_tx)));

        // The spawned task only needs the shared `Inner` state, not `self`
        // itself, so it outlives this call without requiring `Arc<Self>`.
        let inner = Arc::clone(&self.inner);
        let connect_url = inner.connect_url.clone();
        let task_cancel = cancel.clone();
        let runner = ConnectionRunner { inner };
        tokio::spawn(async move {
            runner.run(task_cancel, ready_tx).await;
        });

        tokio::select! {
            result = ready_rx => match result {
                Ok(inner_result) => inner_result,
                Err(_) => Err(Error::transport("connection task ended without signaling readiness")),
            },
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(ENDPOINT_TIMEOUT) => {
                Err(Error::transport(format!(
                    "timed out waiting for endpoint event from {connect_url}"
                )))
            }
        }
    }

    async fn send(&self, msg: JsonRpcMessage) -> Result<()> {
        self.send_with_retry(msg, true).await
    }

    async fn close(&self) -> Result<()> {
        if let Some(cancel) = self.inner.cancel.read().await.as_ref() {
            cancel.cancel();
        }
        *self.inner.endpoint.write().await = None;
        self.fire_close_once().await;
        Ok(())
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        *self.inner.message_handler.lock().expect("handler lock poisoned") = Some(handler);
    }

    fn set_error_handler(&self, handler: ErrorHandler) {
        *self.inner.error_handler.lock().expect("handler lock poisoned") = Some(handler);
    }

    fn set_close_handler(&self, handler: CloseHandler) {
        *self.inner.close_handler.lock().expect("handler lock poisoned") = Some(handler);
    }

    fn session_id(&self) -> Option<String> {
        None
    }

    fn state(&self) -> ConnectionState {
        // Best-effort synchronous read: `try_read` avoids requiring this
        // trait method to be async. Contention here is rare (state only
        // changes at connect/close boundaries) so falling back to `New`
        // on contention is an acceptable diagnostic approximation.
        self.inner
            .state
            .try_read()
            .map(|s| *s)
            .unwrap_or(ConnectionState::New)
    }
}

impl SseTransport {
    fn send_with_retry<'a>(
        &'a self,
        msg: JsonRpcMessage,
        allow_retry: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let endpoint = self
                .inner
                .endpoint
                .read()
                .await
                .clone()
                .ok_or_else(|| Error::protocol("send called before an endpoint was resolved"))?;

            let headers = self.build_headers(false).await?;
            let body = serde_json::to_vec(&msg)?;

            let response = self
                .inner
                .http
                .post(endpoint)
                .headers(headers)
                .body(body)
                .send()
                .await;

            match response {
                Ok(r) if r.status().as_u16() == 401 => {
                    if allow_retry {
                        if let Some(source) = &self.inner.token_source {
                            if source.refresh_token().await.is_ok() {
                                return self.send_with_retry(msg, false).await;
                            }
                        }
                    }
                    let err = Error::unauthorized("send rejected with 401");
                    self.fire_error(err.to_string()).await;
                    Err(err)
                }
                Ok(r) if r.status().is_success() => Ok(()),
                Ok(r) => {
                    let status = r.status().as_u16();
                    let message = r.text().await.unwrap_or_default();
                    let err = Error::TransportStatus { status, message };
                    self.fire_error(err.to_string()).await;
                    Err(err)
                }
                Err(e) => {
                    let err = Error::from(e);
                    self.fire_error(err.to_string()).await;
                    Err(err)
                }
            }
        })
    }
}

/// A thin wrapper so the spawned connection task does not need `Arc<Self>`
/// for the whole `SseTransport`, only the shared `Inner` state plus the
/// handful of free functions/methods it needs. Mirrors the methods on
/// `SseTransport` that operate purely on `Inner`.
struct ConnectionRunner {
    inner: Arc<Inner>,
}

impl ConnectionRunner {
    async fn run(
        self,
        cancel: CancellationToken,
        ready_tx: Arc<AsyncMutex<Option<oneshot::Sender<Result<()>>>>>,
    ) {
        let facade = SseTransport {
            inner: Arc::clone(&self.inner),
            started: AtomicBool::new(true),
        };
        let facade = Arc::new(facade);
        facade.run_connection(cancel, ready_tx).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn connect_url(server: &MockServer) -> Url {
        Url::parse(&server.uri()).unwrap()
    }

    #[test]
    fn resolve_endpoint_accepts_relative_path() {
        let base = Url::parse("http://127.0.0.1:8080/").unwrap();
        let resolved = resolve_endpoint_against(&base, "/endpoint").unwrap();
        assert_eq!(resolved.as_str(), "http://127.0.0.1:8080/endpoint");
    }

    #[test]
    fn resolve_endpoint_accepts_matching_absolute_origin() {
        let base = Url::parse("http://127.0.0.1:8080/").unwrap();
        let resolved =
            resolve_endpoint_against(&base, "http://127.0.0.1:8080/endpoint").unwrap();
        assert_eq!(resolved.as_str(), "http://127.0.0.1:8080/endpoint");
    }

    #[test]
    fn resolve_endpoint_rejects_cross_origin_host() {
        let base = Url::parse("http://127.0.0.1:8080/").unwrap();
        let result = resolve_endpoint_against(&base, "http://evil.example/endpoint");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn happy_sse_resolves_endpoint_and_delivers_message() {
        let server = MockServer::start().await;
        let body = "event: endpoint\ndata: /endpoint\n\n\
                     event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"test\",\"params\":{\"key\":\"value\"}}\n\n";
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let transport = Arc::new(SseTransport::new(connect_url(&server), HashMap::new(), None));
        let received: Arc<StdMutex<Vec<JsonRpcMessage>>> = Arc::new(StdMutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);
        transport.set_message_handler(Arc::new(move |msg| {
            received_clone.lock().unwrap().push(msg);
        }));

        let cancel = CancellationToken::new();
        transport.start(cancel.clone()).await.unwrap();

        // give the body-reading task a moment to deliver the message event
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            transport.endpoint().await.unwrap().as_str(),
            format!("{}endpoint", server.uri())
        );
        assert_eq!(received.lock().unwrap().len(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn immediate_401_without_token_source_is_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let transport = SseTransport::new(connect_url(&server), HashMap::new(), None);
        let cancel = CancellationToken::new();
        let err = transport.start(cancel).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
        assert_eq!(transport.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn non_sse_content_type_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-type", "text/plain"))
            .mount(&server)
            .await;

        let transport = SseTransport::new(connect_url(&server), HashMap::new(), None);
        let cancel = CancellationToken::new();
        let err = transport.start(cancel).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn auth_header_is_sent_when_token_source_present() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .and(header("authorization", "Bearer test_token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw("event: endpoint\ndata: /ep\n\n", "text/event-stream"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let store: Arc<dyn crate::auth::TokenStore> =
            Arc::new(crate::auth::InMemoryTokenStore::new());
        let server_url = connect_url(&server);
        store
            .save_tokens(
                server_url.as_str(),
                crate::auth::OAuthTokens {
                    access_token: "test_token".into(),
                    token_type: "bearer".into(),
                    expires_in: None,
                    scope: None,
                    refresh_token: None,
                    expires_at: None,
                },
            )
            .await
            .unwrap();
        let coordinator = Arc::new(crate::auth::AuthCoordinator::new(Arc::clone(&store)));
        let token_source = Arc::new(TokenSource::new(store, coordinator, server_url.clone()));

        let transport = Arc::new(SseTransport::new(server_url, HashMap::new(), Some(token_source)));
        let cancel = CancellationToken::new();
        transport.start(cancel.clone()).await.unwrap();
        assert_eq!(transport.state(), ConnectionState::EndpointKnown);
        transport.close().await.unwrap();
        cancel.cancel();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fires_handler_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw("event: endpoint\ndata: /ep\n\n", "text/event-stream"),
            )
            .mount(&server)
            .await;

        let transport = Arc::new(SseTransport::new(connect_url(&server), HashMap::new(), None));
        let fire_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fire_count_clone = Arc::clone(&fire_count);
        transport.set_close_handler(Arc::new(move || {
            fire_count_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let cancel = CancellationToken::new();
        transport.start(cancel.clone()).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert_eq!(fire_count.load(Ordering::SeqCst), 1);
    }
}
