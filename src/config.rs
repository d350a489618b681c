//! Server settings schema: the `mcp_servers` map loaded from the settings
//! file, and the validated [`ServerConfig`] used to instantiate transports.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const MINIMUM_TIMEOUT_SECS: u64 = 10;

/// Which transport a server is reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// Subprocess IPC over stdin/stdout pipes.
    Stdio,
    /// Server-Sent Events over HTTP.
    Sse,
}

/// The raw, on-disk shape of one entry in the `mcp_servers` map. Field
/// presence is looser than [`ServerConfig`]; [`ServerConfig::from_raw`]
/// performs the validation the wire schema does not express.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawServerConfig {
    /// `"stdio"` or `"sse"`.
    #[serde(rename = "transportType")]
    pub transport_type: String,
    /// Skip this server during reconciliation without removing its entry.
    #[serde(default)]
    pub disabled: bool,
    /// Per-server request timeout in seconds. `0` means "use the default".
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Tool names the host may invoke without prompting.
    #[serde(default, rename = "autoApprove")]
    pub auto_approve: Vec<String>,
    /// Executable to spawn (stdio only).
    #[serde(default)]
    pub command: Option<String>,
    /// Arguments passed to `command` (stdio only).
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables for the spawned process (stdio only).
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// The SSE endpoint to connect to (sse only).
    #[serde(default)]
    pub url: Option<String>,
}

/// A declarative, validated description of one MCP server.
///
/// Constructed only via [`ServerConfig::from_raw`], which enforces every
/// validation rule: unknown transport types, below-minimum timeouts, and
/// missing per-transport required fields are all rejected; a zero timeout is
/// rewritten to the default.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Transport kind.
    pub transport_type: TransportTypeConfig,
    /// Request timeout in seconds; always `>= MINIMUM_TIMEOUT_SECS`.
    pub timeout_secs: u64,
    /// Whether this server should be skipped during reconciliation.
    pub disabled: bool,
    /// Tool names the host may invoke without prompting.
    pub auto_approve: Vec<String>,
}

/// Per-transport-kind required fields, validated at construction.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportTypeConfig {
    /// `command`/`args`/`env` for a subprocess transport.
    Stdio {
        /// Executable to spawn.
        command: String,
        /// Arguments passed to `command`.
        args: Vec<String>,
        /// Environment variables for the spawned process.
        env: HashMap<String, String>,
    },
    /// `url` for an SSE transport.
    Sse {
        /// The SSE endpoint URL.
        url: url::Url,
    },
}

impl ServerConfig {
    /// Validate a [`RawServerConfig`] and produce a [`ServerConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an unknown transport type, a
    /// below-minimum timeout, or a missing per-transport required field.
    pub fn from_raw(raw: &RawServerConfig) -> Result<Self> {
        let timeout_secs = match raw.timeout.unwrap_or(0) {
            0 => DEFAULT_TIMEOUT_SECS,
            t if t < MINIMUM_TIMEOUT_SECS => {
                return Err(Error::configuration(format!(
                    "timeout {t} is below the minimum of {MINIMUM_TIMEOUT_SECS} seconds"
                )));
            }
            t => t,
        };

        let transport_type = match raw.transport_type.as_str() {
            "stdio" => {
                let command = raw.command.clone().ok_or_else(|| {
                    Error::configuration("stdio transport requires a `command` field")
                })?;
                TransportTypeConfig::Stdio {
                    command,
                    args: raw.args.clone(),
                    env: raw.env.clone(),
                }
            }
            "sse" => {
                let raw_url = raw
                    .url
                    .clone()
                    .ok_or_else(|| Error::configuration("sse transport requires a `url` field"))?;
                let url = url::Url::parse(&raw_url)
                    .map_err(|e| Error::configuration(format!("invalid sse url: {e}")))?;
                TransportTypeConfig::Sse { url }
            }
            other => {
                return Err(Error::configuration(format!(
                    "unknown transportType: {other}"
                )));
            }
        };

        Ok(ServerConfig {
            transport_type,
            timeout_secs,
            disabled: raw.disabled,
            auto_approve: raw.auto_approve.clone(),
        })
    }

    /// The canonical JSON serialization used to detect configuration drift
    /// during Hub reconciliation. Two configs with the same snapshot are
    /// considered identical; any difference triggers close-and-recreate.
    pub fn snapshot_json(&self) -> String {
        let value = match &self.transport_type {
            TransportTypeConfig::Stdio { command, args, env } => serde_json::json!({
                "transportType": "stdio",
                "command": command,
                "args": args,
                "env": env,
                "timeout": self.timeout_secs,
                "disabled": self.disabled,
                "autoApprove": self.auto_approve,
            }),
            TransportTypeConfig::Sse { url } => serde_json::json!({
                "transportType": "sse",
                "url": url.as_str(),
                "timeout": self.timeout_secs,
                "disabled": self.disabled,
                "autoApprove": self.auto_approve,
            }),
        };
        // `serde_json::Value`'s `Display` impl is already deterministic for
        // a fixed key set constructed via `json!`, since `json!` builds a
        // `Map` that preserves insertion order (the `preserve_order`
        // feature is not required: we only need two snapshots built the
        // same way to compare equal, not a canonical byte-for-byte form).
        value.to_string()
    }
}

/// The full settings file: `{ "mcp_servers": { name: RawServerConfig } }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Server name -> raw (unvalidated) config.
    #[serde(default, rename = "mcp_servers")]
    pub mcp_servers: HashMap<String, RawServerConfig>,
}

/// Parse settings from an already-read JSON string. Split from
/// [`load_settings`] so parsing is unit-testable without touching the
/// filesystem.
pub fn parse_settings(raw_json: &str) -> Result<Settings> {
    serde_json::from_str(raw_json).map_err(Error::from)
}

/// Parse and validate every entry in a [`Settings`] document, returning a
/// map of name to [`ServerConfig`].
///
/// A single invalid entry fails the whole load, since a partially-loaded
/// settings file would silently drop servers the operator expected to be
/// present.
pub fn validate_settings(settings: &Settings) -> Result<HashMap<String, ServerConfig>> {
    settings
        .mcp_servers
        .iter()
        .map(|(name, raw)| {
            ServerConfig::from_raw(raw)
                .map(|cfg| (name.clone(), cfg))
                .map_err(|e| Error::configuration(format!("server `{name}`: {e}")))
        })
        .collect()
}

/// The default settings file path: `$HOME/.nca/mcp_settings.json`.
pub fn default_settings_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.home_dir().join(".nca").join("mcp_settings.json"))
}

/// Read and parse the settings file at `path`, or at
/// [`default_settings_path`] if `path` is `None`.
///
/// A missing file is not an error: it is treated as an empty server map, so
/// a brand-new installation with no configured servers starts cleanly.
pub async fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let resolved = match path {
        Some(p) => p.to_path_buf(),
        None => default_settings_path()
            .ok_or_else(|| Error::configuration("could not resolve home directory"))?,
    };

    match tokio::fs::read_to_string(&resolved).await {
        Ok(raw) => parse_settings(&raw),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Settings::default()),
        Err(e) => Err(Error::from(e)),
    }
}
