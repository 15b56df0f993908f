use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracebench_transfer::SchedulerConfig;

/// Default timeout for the TCP connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for the greeting and probe reply.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How many results the collector waits for after the transfer loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainPolicy {
    /// One result per announced file, even when the loop stopped early.
    ///
    /// After an early stop the peer may never send the missing results; the
    /// collector then blocks until the peer closes or `result_timeout`
    /// expires, and fails with `ResultCountMismatch`.
    #[default]
    Announced,
    /// One result per file the peer accepted with `"OK"`.
    Transmitted,
}

/// Settings for a [`TransferSession`](crate::TransferSession).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub scheduler: SchedulerConfig,
    /// When set, every header acknowledgment must equal this value.
    pub header_ack: Option<Vec<u8>>,
    pub drain_policy: DrainPolicy,
    /// Bound on the wait for each result message.
    pub result_timeout: Option<Duration>,
    /// Bound on the whole run after the probe.
    pub transfer_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            scheduler: SchedulerConfig::default(),
            header_ack: None,
            drain_policy: DrainPolicy::default(),
            result_timeout: None,
            transfer_timeout: None,
        }
    }
}
