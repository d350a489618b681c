//! The Hub (§4.7): supervises a named set of server connections, reconciling
//! a desired `{name -> ServerConfig}` map against the current one, bootstrapping
//! each connection after it comes up, and restarting connections on request.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::token_source::TokenSource;
use crate::config::{self, ServerConfig, TransportTypeConfig};
use crate::error::{Error, Result};
use crate::jsonrpc::JsonRpcClient;
use crate::transport::sse::SseTransport;
use crate::transport::stdio::StdioTransport;
use crate::transport::Transport;

const RESTART_DELAY: Duration = Duration::from_millis(500);
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection lifecycle status, mirrored from the transport's own state
/// machine plus the "bootstrapped" distinction the Hub layers on top.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// `Start` has been called but the endpoint is not yet known.
    Connecting,
    /// The endpoint is known and bootstrap RPCs have been attempted.
    Connected,
    /// The transport's close handler fired.
    Disconnected,
}

/// The runtime projection of a [`ServerConfig`]: everything the Hub tracks
/// about one named server.
#[derive(Clone)]
pub struct ServerConnection {
    /// The settings-map key this connection was created for.
    pub name: String,
    /// The canonical snapshot of the config this connection was built from,
    /// used to detect configuration drift on the next reconcile.
    pub config_snapshot_json: String,
    /// Current lifecycle status.
    pub status: ConnectionStatus,
    /// Append-only, newline-separated error log.
    pub error_log: String,
    /// Populated by the `tools/list` bootstrap call, if it succeeded.
    pub tools: Option<Value>,
    /// Populated by the `resources/list` bootstrap call, if it succeeded.
    pub resources: Option<Value>,
    /// Populated by the `resources/templates/list` bootstrap call, if it succeeded.
    pub resource_templates: Option<Value>,
    /// The JSON-RPC client layered over this connection's transport.
    pub client: Arc<JsonRpcClient>,
    cancel: CancellationToken,
}

struct ConnectionEntry {
    connection: ServerConnection,
    config: ServerConfig,
}

/// Supervises a fleet of named [`ServerConnection`]s.
///
/// Always constructed via [`Hub::new`], which returns an `Arc<Hub>` -- the
/// Hub hands a weak reference to itself to each connection's error/close
/// handlers so they can update connection state without the `Hub` needing
/// to outlive them through a reference cycle.
pub struct Hub {
    settings_path: Option<PathBuf>,
    connections: RwLock<HashMap<String, ConnectionEntry>>,
    initialized: tokio::sync::Mutex<bool>,
    self_weak: Weak<Hub>,
}

impl Hub {
    /// Construct an uninitialized Hub that will read its settings from
    /// `settings_path` (or [`config::default_settings_path`] if `None`) the
    /// first time [`Hub::ensure_started`] or [`Hub::get_servers`] runs.
    pub fn new(settings_path: Option<PathBuf>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            settings_path,
            connections: RwLock::new(HashMap::new()),
            initialized: tokio::sync::Mutex::new(false),
            self_weak: weak.clone(),
        })
    }

    /// Read the settings file (if not already done) and reconcile against
    /// it. Safe to call repeatedly; only the first call performs I/O.
    pub async fn ensure_started(&self) -> Result<()> {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            return Ok(());
        }
        let settings = config::load_settings(self.settings_path.as_deref()).await?;
        let desired = config::validate_settings(&settings)?;
        self.update_server_connections(desired).await?;
        *initialized = true;
        Ok(())
    }

    /// A copy-on-read snapshot of the current connection set, safe to hold
    /// across no awaits (it owns no lock).
    pub async fn get_servers(&self) -> Vec<ServerConnection> {
        self.connections
            .read()
            .await
            .values()
            .map(|e| e.connection.clone())
            .collect()
    }

    /// Reconcile the current connection set against `desired`: close
    /// connections whose name is no longer present, create connections for
    /// new names, and close-and-recreate connections whose config snapshot
    /// changed. Connections whose config is unchanged are left untouched
    /// (identity-preserved).
    pub async fn update_server_connections(&self, desired: HashMap<String, ServerConfig>) -> Result<()> {
        let stale: Vec<String> = {
            let current = self.connections.read().await;
            current
                .keys()
                .filter(|name| !desired.contains_key(*name))
                .cloned()
                .collect()
        };
        for name in stale {
            info!(server = %name, "removing connection: no longer in desired config");
            self.close_and_remove(&name).await;
        }

        for (name, config) in desired {
            if config.disabled {
                self.close_and_remove(&name).await;
                continue;
            }

            let snapshot = config.snapshot_json();
            let needs_recreate = {
                let current = self.connections.read().await;
                match current.get(&name) {
                    Some(entry) => entry.connection.config_snapshot_json != snapshot,
                    None => true,
                }
            };

            if needs_recreate {
                info!(server = %name, "(re)creating connection");
                self.close_and_remove(&name).await;
                self.create_connection(name, config).await;
            }
        }

        Ok(())
    }

    /// Restart the named connection: snapshot its current config,
    /// transition to `Connecting`, clear the error log, wait briefly (for
    /// visible UI feedback), close the existing connection, then recreate
    /// it from the snapshot.
    pub async fn restart(&self, name: &str) -> Result<()> {
        let config = {
            let mut current = self.connections.write().await;
            let entry = current
                .get_mut(name)
                .ok_or_else(|| Error::configuration(format!("no connection named `{name}`")))?;
            entry.connection.status = ConnectionStatus::Connecting;
            entry.connection.error_log.clear();
            entry.config.clone()
        };

        tokio::time::sleep(RESTART_DELAY).await;
        self.close_and_remove(name).await;
        self.create_connection(name.to_string(), config).await;
        Ok(())
    }

    async fn close_and_remove(&self, name: &str) {
        let removed = self.connections.write().await.remove(name);
        if let Some(entry) = removed {
            entry.connection.cancel.cancel();
            if let Err(e) = entry.connection.client.close().await {
                warn!(server = %name, error = %e, "error closing connection");
            }
        }
    }

    async fn create_connection(&self, name: String, config: ServerConfig) {
        let snapshot = config.snapshot_json();
        let cancel = CancellationToken::new();

        let transport: Arc<dyn Transport> = match &config.transport_type {
            TransportTypeConfig::Stdio { command, args, env } => Arc::new(StdioTransport::new(
                command.clone(),
                args.clone(),
                env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            )),
            TransportTypeConfig::Sse { url } => {
                Arc::new(SseTransport::new(url.clone(), HashMap::new(), None::<Arc<TokenSource>>))
            }
        };

        if let Some(hub) = self.self_weak.upgrade() {
            let error_name = name.clone();
            let hub_for_error = Arc::clone(&hub);
            transport.set_error_handler(Arc::new(move |message| {
                let hub = Arc::clone(&hub_for_error);
                let name = error_name.clone();
                tokio::spawn(async move {
                    hub.append_error(&name, &message).await;
                });
            }));

            let close_name = name.clone();
            let hub_for_close = Arc::clone(&hub);
            transport.set_close_handler(Arc::new(move || {
                let hub = Arc::clone(&hub_for_close);
                let name = close_name.clone();
                tokio::spawn(async move {
                    hub.mark_disconnected(&name).await;
                });
            }));
        }

        let client = JsonRpcClient::new(transport);
        let connection = ServerConnection {
            name: name.clone(),
            config_snapshot_json: snapshot,
            status: ConnectionStatus::Connecting,
            error_log: String::new(),
            tools: None,
            resources: None,
            resource_templates: None,
            client: Arc::clone(&client),
            cancel: cancel.clone(),
        };

        self.connections
            .write()
            .await
            .insert(name.clone(), ConnectionEntry { connection, config });

        match client.start(cancel).await {
            Ok(()) => {
                debug!(server = %name, "connection established");
                self.mark_connected(&name).await;
                self.run_bootstrap(&name).await;
            }
            Err(e) => {
                warn!(server = %name, error = %e, "failed to start connection");
                self.append_error(&name, &e.to_string()).await;
            }
        }
    }

    async fn mark_connected(&self, name: &str) {
        if let Some(entry) = self.connections.write().await.get_mut(name) {
            entry.connection.status = ConnectionStatus::Connected;
        }
    }

    async fn mark_disconnected(&self, name: &str) {
        if let Some(entry) = self.connections.write().await.get_mut(name) {
            entry.connection.status = ConnectionStatus::Disconnected;
        }
    }

    async fn append_error(&self, name: &str, message: &str) {
        if let Some(entry) = self.connections.write().await.get_mut(name) {
            if entry.connection.error_log.is_empty() {
                entry.connection.error_log = message.to_string();
            } else {
                entry.connection.error_log.push('\n');
                entry.connection.error_log.push_str(message);
            }
        }
    }

    async fn run_bootstrap(&self, name: &str) {
        let client = {
            let current = self.connections.read().await;
            match current.get(name) {
                Some(entry) => Arc::clone(&entry.connection.client),
                None => return,
            }
        };

        match client.request("tools/list", None, BOOTSTRAP_TIMEOUT).await {
            Ok(value) => {
                if let Some(entry) = self.connections.write().await.get_mut(name) {
                    entry.connection.tools = Some(value);
                }
            }
            Err(e) => self.append_error(name, &format!("tools/list failed: {e}")).await,
        }

        match client.request("resources/list", None, BOOTSTRAP_TIMEOUT).await {
            Ok(value) => {
                if let Some(entry) = self.connections.write().await.get_mut(name) {
                    entry.connection.resources = Some(value);
                }
            }
            Err(e) => self.append_error(name, &format!("resources/list failed: {e}")).await,
        }

        match client
            .request("resources/templates/list", None, BOOTSTRAP_TIMEOUT)
            .await
        {
            Ok(value) => {
                if let Some(entry) = self.connections.write().await.get_mut(name) {
                    entry.connection.resource_templates = Some(value);
                }
            }
            Err(e) => {
                self.append_error(name, &format!("resources/templates/list failed: {e}"))
                    .await
            }
        }
    }
}
