//! Benchmark session against an inference peer.
//!
//! A [`ConnectionProbe`] checks readiness and queries the peer's load on its
//! own connection. A [`TransferSession`] then opens the transfer connection,
//! sends every file paced by the bandwidth profile, and hands the connection
//! to a [`ResultCollector`] to drain the inference results.
//!
//! # Lifecycle
//!
//! `init -> probed -> transferring -> collecting -> done`, with any fatal
//! error moving the session to `error`.

pub mod collector;
pub mod config;
pub mod error;
pub mod probe;
pub mod session;

pub use collector::{ResultCollector, ResultRecord};
pub use config::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT, DrainPolicy, SessionConfig};
pub use error::SessionFailure;
pub use probe::{ConnectionProbe, ProbeReport};
pub use session::{AbortInfo, FileOutcome, RunReport, SessionState, TransferSession};
