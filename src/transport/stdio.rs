//! The stdio transport (§4.8): a subprocess speaking line-delimited JSON-RPC
//! over its own stdin/stdout. Kept deliberately minimal -- no reconnect, no
//! bearer tokens, no endpoint negotiation -- since it exists only so the
//! Hub and JSON-RPC client layer can treat it as just another [`Transport`].

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::transport::{CloseHandler, ConnectionState, ErrorHandler, MessageHandler, Transport};
use crate::types::JsonRpcMessage;

struct Inner {
    command: String,
    child: AsyncMutex<Option<Child>>,
    stdin: AsyncMutex<Option<tokio::process::ChildStdin>>,
    state: AsyncRwLock<ConnectionState>,
    // Plain `std::sync::Mutex`, not `tokio::sync::RwLock`: these are
    // installed via a synchronous trait method (no `.await` available) and
    // must be visible to the caller before `set_*_handler` returns, per the
    // "install before Start" contract shared with `sse.rs`.
    message_handler: StdMutex<Option<MessageHandler>>,
    error_handler: StdMutex<Option<ErrorHandler>>,
    close_handler: StdMutex<Option<CloseHandler>>,
    close_fired: AtomicBool,
}

impl Inner {
    async fn fire_error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(command = %self.command, %message, "stdio transport error");
        if let Some(handler) = self.error_handler.lock().expect("handler lock poisoned").clone() {
            handler(message);
        }
    }

    async fn fire_close_once(&self) {
        if self
            .close_fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self.state.write().await = ConnectionState::Closed;
            if let Some(handler) = self.close_handler.lock().expect("handler lock poisoned").clone() {
                handler();
            }
        }
    }
}

/// Spawns `command args...` and exchanges newline-delimited JSON-RPC
/// messages over its stdin/stdout.
pub struct StdioTransport {
    inner: Arc<Inner>,
    args: Vec<String>,
    env: Vec<(String, String)>,
    started: AtomicBool,
}

impl StdioTransport {
    /// Construct a transport that will spawn `command` with `args` and
    /// `env` on [`Transport::start`].
    pub fn new(command: String, args: Vec<String>, env: Vec<(String, String)>) -> Self {
        Self {
            inner: Arc::new(Inner {
                command,
                child: AsyncMutex::new(None),
                stdin: AsyncMutex::new(None),
                state: AsyncRwLock::new(ConnectionState::New),
                message_handler: StdMutex::new(None),
                error_handler: StdMutex::new(None),
                close_handler: StdMutex::new(None),
                close_fired: AtomicBool::new(false),
            }),
            args,
            env,
            started: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::protocol("transport already started"));
        }
        *self.inner.state.write().await = ConnectionState::Connecting;

        let mut command = Command::new(&self.inner.command);
        command
            .args(&self.args)
            .envs(self.env.iter().cloned())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| Error::transport(format!("failed to spawn {}: {e}", self.inner.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::transport("child process has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::transport("child process has no stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::transport("child process has no stderr"))?;

        *self.inner.stdin.lock().await = Some(stdin);
        *self.inner.child.lock().await = Some(child);
        *self.inner.state.write().await = ConnectionState::EndpointKnown;

        let stderr_command = self.inner.command.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => debug!(command = %stderr_command, "{line}"),
                    Ok(None) => break,
                    Err(e) => {
                        debug!(command = %stderr_command, error = %e, "stderr read failed");
                        break;
                    }
                }
            }
        });

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            read_stdout(inner, stdout, cancel).await;
        });

        Ok(())
    }

    async fn send(&self, msg: JsonRpcMessage) -> Result<()> {
        if *self.inner.state.read().await != ConnectionState::EndpointKnown {
            return Err(Error::protocol("send called before the transport is ready"));
        }
        let mut guard = self.inner.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| Error::protocol("transport has no open stdin"))?;

        let mut line = serde_json::to_vec(&msg)?;
        line.push(b'\n');
        stdin
            .write_all(&line)
            .await
            .map_err(|e| Error::transport(format!("failed writing to child stdin: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::transport(format!("failed flushing child stdin: {e}")))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.inner.stdin.lock().await = None;
        if let Some(mut child) = self.inner.child.lock().await.take() {
            let _ = child.start_kill();
        }
        self.inner.fire_close_once().await;
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
        self.inner
            .state
            .try_read()
            .map(|s| *s)
            .unwrap_or(ConnectionState::New)
    }
}

async fn read_stdout(inner: Arc<Inner>, stdout: tokio::process::ChildStdout, cancel: CancellationToken) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let next = tokio::select! {
            line = lines.next_line() => line,
            _ = cancel.cancelled() => {
                inner.fire_close_once().await;
                return;
            }
        };

        match next {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcMessage>(&line) {
                    Ok(msg) => {
                        if let Some(handler) = inner.message_handler.lock().expect("handler lock poisoned").clone() {
                            handler(msg);
                        }
                    }
                    Err(e) => inner.fire_error(format!("malformed json-rpc line: {e}")).await,
                }
            }
            Ok(None) => {
                inner.fire_close_once().await;
                return;
            }
            Err(e) => {
                inner.fire_error(format!("stdout read failed: {e}")).await;
                inner.fire_close_once().await;
                return;
            }
        }
    }
}
