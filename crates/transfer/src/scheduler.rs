use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tracebench_protocol::constants::CHUNK_ACK_LEN;
use tracebench_protocol::wire::read_chunk_ack;

use crate::{QuotaCursor, TransferError};

/// Default length of one scheduling quantum.
pub const DEFAULT_QUANTUM: Duration = Duration::from_secs(1);

/// Default bound on the wait for a single chunk acknowledgment.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// One slice of a file, sized by a single profile draw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Position of the chunk within its file.
    pub seq: u32,
    /// Quanta after transmission start at which the chunk fires.
    pub slot: u32,
    pub payload: Vec<u8>,
}

/// Splits the next `size` bytes of `reader` into chunks.
///
/// Each chunk consumes exactly one cursor draw and carries
/// `min(budget, remaining)` bytes, so the chunk count equals the number of
/// draws needed to cover the file.
pub async fn plan_chunks<R: AsyncRead + Unpin>(
    reader: &mut R,
    size: u64,
    cursor: &mut QuotaCursor,
) -> Result<Vec<Chunk>, TransferError> {
    let mut chunks = Vec::new();
    let mut remaining = size;
    let mut seq = 0u32;

    while remaining > 0 {
        let budget = cursor.draw()?;
        let len = budget.min(remaining);
        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TransferError::Io(std::io::Error::new(
                    e.kind(),
                    format!("file shorter than announced size {size}"),
                ))
            } else {
                TransferError::Io(e)
            }
        })?;
        chunks.push(Chunk {
            seq,
            slot: seq,
            payload,
        });
        remaining -= len;
        seq += 1;
    }

    Ok(chunks)
}

/// Pacing and acknowledgment settings for [`ChunkScheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Spacing between consecutive chunk slots.
    pub quantum: Duration,
    /// Maximum wait for each 12-byte chunk acknowledgment.
    pub ack_timeout: Duration,
    /// When set, every chunk acknowledgment must equal this value.
    pub expected_ack: Option<[u8; CHUNK_ACK_LEN]>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            quantum: DEFAULT_QUANTUM,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            expected_ack: None,
        }
    }
}

/// Outcome of one file's paced transmission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransmitReport {
    pub chunks_sent: usize,
    pub bytes_sent: u64,
    /// Chunks whose slot had already passed when the previous chunk's
    /// acknowledgment arrived.
    pub late_slots: usize,
    pub elapsed: Duration,
}

/// Sends planned chunks one per quantum, waiting for each acknowledgment.
///
/// Stopping takes effect between slots only; a chunk whose send has started
/// always runs to its acknowledgment.
#[derive(Debug, Clone)]
pub struct ChunkScheduler {
    config: SchedulerConfig,
    cancel: CancellationToken,
}

impl ChunkScheduler {
    pub fn new(config: SchedulerConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    /// Transmits `chunks` in order, firing chunk *i* at `T0 + i * quantum`.
    ///
    /// A slot that has already passed fires immediately.
    pub async fn transmit<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
        chunks: Vec<Chunk>,
    ) -> Result<TransmitReport, TransferError> {
        let t0 = Instant::now();
        let mut report = TransmitReport::default();
        let total = chunks.len();

        for chunk in chunks {
            let slot = t0 + self.config.quantum * chunk.slot;
            let late = chunk.slot > 0 && Instant::now() > slot;

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!(sent = report.chunks_sent, total, "chunk scheduler stopped");
                    return Err(TransferError::Cancelled);
                }
                _ = tokio::time::sleep_until(slot) => {}
            }

            if late {
                report.late_slots += 1;
                warn!(seq = chunk.seq, "chunk slot missed, sending immediately");
            }

            debug!(
                seq = chunk.seq,
                bytes = chunk.payload.len(),
                "sending chunk"
            );
            stream.write_all(&chunk.payload).await?;
            stream.flush().await?;

            let ack = tokio::time::timeout(self.config.ack_timeout, read_chunk_ack(stream))
                .await
                .map_err(|_| TransferError::Timeout("chunk ack"))??;
            if let Some(expected) = &self.config.expected_ack
                && ack != *expected
            {
                return Err(TransferError::ProtocolViolation(format!(
                    "chunk {} ack {:?}, expected {:?}",
                    chunk.seq,
                    String::from_utf8_lossy(&ack),
                    String::from_utf8_lossy(expected)
                )));
            }

            report.chunks_sent += 1;
            report.bytes_sent += chunk.payload.len() as u64;
        }

        report.elapsed = t0.elapsed();
        Ok(report)
    }

    /// Moves `stream` into a background task that transmits `chunks`.
    ///
    /// The stream comes back from [`ScheduledTransfer::join`] once every
    /// chunk has been sent and acknowledged.
    pub fn spawn<S>(self, mut stream: S, chunks: Vec<Chunk>) -> ScheduledTransfer<S>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let result = self.transmit(&mut stream, chunks).await;
            (stream, result)
        });
        ScheduledTransfer { handle, cancel }
    }
}

/// Handle to a transmission running in its own task.
pub struct ScheduledTransfer<S> {
    handle: JoinHandle<(S, Result<TransmitReport, TransferError>)>,
    cancel: CancellationToken,
}

impl<S> ScheduledTransfer<S> {
    /// Asks the scheduler to stop before its next slot. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Waits until the scheduler has finished and returns the stream.
    pub async fn join(self) -> Result<(S, TransmitReport), TransferError> {
        let (stream, result) = self
            .handle
            .await
            .map_err(|e| TransferError::TaskFailed(e.to_string()))?;
        Ok((stream, result?))
    }
}
