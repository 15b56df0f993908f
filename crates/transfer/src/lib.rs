//! Bandwidth-profile driven file transfer.
//!
//! A [`BandwidthProfile`] is loaded once per run and consumed through a
//! single [`QuotaCursor`]. Each file is split by [`plan_chunks`] into one
//! chunk per cursor draw, then sent one chunk per quantum by a
//! [`ChunkScheduler`] task that owns the connection until it finishes.

mod inspect;
mod profile;
mod scheduler;

pub use inspect::{
    FileRecord, calculate_file_checksum, checksum_bytes, enumerate_files, inspect_file,
};
pub use profile::{BandwidthProfile, QuotaCursor};
pub use scheduler::{
    Chunk, ChunkScheduler, ScheduledTransfer, SchedulerConfig, TransmitReport, plan_chunks,
};

use tracebench_protocol::ProtocolError;

/// Errors produced by the transfer engine.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect to {addr} failed: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("invalid bandwidth profile: {0}")]
    InvalidProfile(String),

    #[error("bandwidth profile exhausted at position {position} of {len}")]
    ProfileExhausted { position: usize, len: usize },

    #[error("peer rejected {file} with final ack {ack:?}")]
    TransferAborted { file: String, ack: String },

    #[error("expected {expected} results, received {received}")]
    ResultCountMismatch { expected: u32, received: u32 },

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("cancelled")]
    Cancelled,

    #[error("scheduler task failed: {0}")]
    TaskFailed(String),
}

impl From<ProtocolError> for TransferError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => Self::Io(e),
            ProtocolError::Closed => Self::ProtocolViolation("peer closed the connection".into()),
            ProtocolError::Violation(msg) => Self::ProtocolViolation(msg),
        }
    }
}
