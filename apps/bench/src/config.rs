//! Client configuration.
//!
//! Read from the TOML file named by the first argument, or from
//! `tracebench.toml` in the working directory when present. Every field has
//! a default, so a partial file (or none at all) is valid.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracebench_protocol::constants::DEFAULT_PORT;
use tracebench_session::{DrainPolicy, SessionConfig};
use tracebench_transfer::SchedulerConfig;

/// File looked up when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "tracebench.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_peer_host")]
    pub peer_host: String,

    #[serde(default = "default_peer_port")]
    pub peer_port: u16,

    /// Bandwidth trace, one bits-per-quantum value per line.
    #[serde(default = "default_trace_path")]
    pub trace_path: String,

    /// Directory whose regular files are offloaded.
    #[serde(default = "default_source_dir")]
    pub source_dir: String,

    /// Spacing between chunk slots in milliseconds.
    #[serde(default = "default_quantum_ms")]
    pub quantum_ms: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,

    /// Bound on each result wait. Unset waits forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_timeout_secs: Option<u64>,

    /// Bound on the whole transfer. Unset waits forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_timeout_secs: Option<u64>,

    #[serde(default)]
    pub drain_policy: DrainPolicy,

    /// Exact header acknowledgment to require.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_ack: Option<String>,

    /// Exact 12-byte chunk acknowledgment to require.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_ack: Option<String>,

    /// Where to write the JSON run report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,

    /// Serve the run from an in-process scripted peer instead of `peer_host`.
    #[serde(default)]
    pub simulate_peer: bool,
}

fn default_peer_host() -> String {
    "127.0.0.1".into()
}

fn default_peer_port() -> u16 {
    DEFAULT_PORT
}

fn default_trace_path() -> String {
    "sprintGo.txt".into()
}

fn default_source_dir() -> String {
    "./testImages/".into()
}

fn default_quantum_ms() -> u64 {
    1000
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_ack_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_host: default_peer_host(),
            peer_port: default_peer_port(),
            trace_path: default_trace_path(),
            source_dir: default_source_dir(),
            quantum_ms: default_quantum_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            ack_timeout_secs: default_ack_timeout_secs(),
            result_timeout_secs: None,
            transfer_timeout_secs: None,
            drain_policy: DrainPolicy::default(),
            header_ack: None,
            chunk_ack: None,
            report_path: None,
            simulate_peer: false,
        }
    }
}

impl Config {
    /// Loads `path`, or `tracebench.toml` if it exists, or the defaults.
    ///
    /// An explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))
            }
            None => {
                tracing::debug!("no configuration file, using defaults");
                Ok(Self::default())
            }
        }
    }

    fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn peer_addr(&self) -> String {
        format!("{}:{}", self.peer_host, self.peer_port)
    }

    pub fn session_config(&self) -> anyhow::Result<SessionConfig> {
        anyhow::ensure!(self.quantum_ms > 0, "quantum_ms must be positive");

        let expected_ack = self
            .chunk_ack
            .as_deref()
            .map(|ack| {
                <[u8; 12]>::try_from(ack.as_bytes()).map_err(|_| {
                    anyhow::anyhow!("chunk_ack must be exactly 12 bytes, got {}", ack.len())
                })
            })
            .transpose()?;

        Ok(SessionConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            scheduler: SchedulerConfig {
                quantum: Duration::from_millis(self.quantum_ms),
                ack_timeout: Duration::from_secs(self.ack_timeout_secs),
                expected_ack,
            },
            header_ack: self.header_ack.as_ref().map(|ack| ack.as_bytes().to_vec()),
            drain_policy: self.drain_policy,
            result_timeout: self.result_timeout_secs.map(Duration::from_secs),
            transfer_timeout: self.transfer_timeout_secs.map(Duration::from_secs),
        })
    }
}
