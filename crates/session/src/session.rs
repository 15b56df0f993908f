//! Transfer session state machine.
//!
//! One session drives one run: probe, connect, announce, send every file
//! under the bandwidth profile, then collect results. The connection is
//! owned by exactly one flow at a time; for each file body it is moved into
//! the chunk scheduler task and handed back when that task finishes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tracebench_protocol::ProtocolError;
use tracebench_protocol::constants::{ACK_OK, TRANSFER_INTENT};
use tracebench_protocol::wire::{
    read_final_ack, read_message, write_file_count, write_header, write_literal,
};
use tracebench_transfer::{
    ChunkScheduler, FileRecord, QuotaCursor, TransferError, TransmitReport, enumerate_files,
    inspect_file, plan_chunks,
};

use crate::collector::{ResultCollector, ResultRecord};
use crate::config::{DrainPolicy, SessionConfig};
use crate::error::SessionFailure;
use crate::probe::{ConnectionProbe, ProbeReport, connect, expect_greeting};

/// Lifecycle of a [`TransferSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Init,
    Probed,
    Transferring,
    Collecting,
    Done,
    /// Absorbing state after a fatal error.
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Probed => "probed",
            Self::Transferring => "transferring",
            Self::Collecting => "collecting",
            Self::Done => "done",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Per-file transfer result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileOutcome {
    pub name: String,
    pub index: u32,
    pub size: u64,
    pub checksum: String,
    pub chunks: usize,
    pub late_slots: usize,
    /// Cursor position after this file's chunks were planned.
    pub cursor_after: usize,
    pub elapsed: Duration,
    /// Final acknowledgment as sent by the peer.
    pub final_ack: String,
}

impl FileOutcome {
    pub fn accepted(&self) -> bool {
        self.final_ack.as_bytes() == ACK_OK
    }
}

/// A non-`"OK"` final acknowledgment that stopped the file loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AbortInfo {
    pub file: String,
    pub ack: String,
}

/// Summary of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub peer: String,
    pub probe: ProbeReport,
    /// Files announced to the peer.
    pub file_count: u32,
    /// Files whose body was sent, in order.
    pub files: Vec<FileOutcome>,
    pub aborted: Option<AbortInfo>,
    pub drain_policy: DrainPolicy,
    pub results: Vec<ResultRecord>,
    pub cursor_position: usize,
    pub elapsed: Duration,
}

impl RunReport {
    /// Files the peer accepted with `"OK"`.
    pub fn completed(&self) -> usize {
        self.files.iter().filter(|f| f.accepted()).count()
    }

    /// Turns an early stop into a `TransferAborted` error.
    pub fn ensure_complete(&self) -> Result<(), TransferError> {
        match &self.aborted {
            Some(abort) => Err(TransferError::TransferAborted {
                file: abort.file.clone(),
                ack: abort.ack.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Drives one benchmark run against a peer.
pub struct TransferSession {
    config: SessionConfig,
    cursor: QuotaCursor,
    state: SessionState,
    cancel: CancellationToken,
    current_file: Option<String>,
    completed: usize,
    aborted: Option<AbortInfo>,
}

impl TransferSession {
    pub fn new(config: SessionConfig, cursor: QuotaCursor) -> Self {
        Self {
            config,
            cursor,
            state: SessionState::Init,
            cancel: CancellationToken::new(),
            current_file: None,
            completed: 0,
            aborted: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn cursor(&self) -> &QuotaCursor {
        &self.cursor
    }

    /// Token that aborts the run when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the whole session: probe, transfer every file in `source_dir`,
    /// collect results.
    pub async fn run(
        &mut self,
        addr: &str,
        source_dir: &Path,
    ) -> Result<RunReport, SessionFailure> {
        match self.run_inner(addr, source_dir).await {
            Ok(report) => Ok(report),
            Err(source) => {
                let failure = SessionFailure {
                    state: self.state,
                    file: self.current_file.take(),
                    completed: self.completed,
                    aborted: self.aborted.clone(),
                    source,
                };
                warn!(error = %failure, "session failed");
                self.state = SessionState::Error;
                Err(failure)
            }
        }
    }

    async fn run_inner(
        &mut self,
        addr: &str,
        source_dir: &Path,
    ) -> Result<RunReport, TransferError> {
        if self.state != SessionState::Init {
            return Err(TransferError::ProtocolViolation(format!(
                "session already used (state {})",
                self.state
            )));
        }
        let started_at = Utc::now();
        let files = enumerate_files(source_dir)?;
        let file_count = u32::try_from(files.len()).map_err(|_| {
            TransferError::ProtocolViolation(format!("too many files to announce: {}", files.len()))
        })?;
        info!(dir = %source_dir.display(), file_count, "files enumerated");

        let probe = ConnectionProbe::new(self.config.connect_timeout, self.config.handshake_timeout)
            .probe(addr, &self.cursor)
            .await?;
        let mut stream = connect(addr, self.config.connect_timeout).await?;
        expect_greeting(&mut stream, self.config.handshake_timeout).await?;
        self.state = SessionState::Probed;

        let _deadline = self.arm_deadline();
        let since = Instant::now();

        write_literal(&mut stream, TRANSFER_INTENT).await?;
        write_file_count(&mut stream, file_count).await?;
        self.state = SessionState::Transferring;
        info!(file_count, "transfer started");

        let (mut stream, files_sent) = self.transfer_files(stream, &files).await?;

        self.state = SessionState::Collecting;
        let drain = match self.config.drain_policy {
            DrainPolicy::Announced => file_count,
            DrainPolicy::Transmitted => self.completed as u32,
        };
        if drain as usize != self.completed {
            warn!(
                expected = drain,
                completed = self.completed,
                "draining more results than files completed"
            );
        }
        let results = ResultCollector::new(drain, self.config.result_timeout)
            .drain(&mut stream, since, &self.cancel)
            .await?;

        self.state = SessionState::Done;
        let report = RunReport {
            started_at,
            peer: addr.to_string(),
            probe,
            file_count,
            files: files_sent,
            aborted: self.aborted.clone(),
            drain_policy: self.config.drain_policy,
            results,
            cursor_position: self.cursor.position(),
            elapsed: since.elapsed(),
        };
        info!(
            completed = report.completed(),
            results = report.results.len(),
            cursor = report.cursor_position,
            "session done"
        );
        Ok(report)
    }

    /// Cancels the session once `transfer_timeout` elapses. The returned
    /// guard disarms the timer when dropped.
    fn arm_deadline(&self) -> Option<tokio_util::sync::DropGuard> {
        let limit = self.config.transfer_timeout?;
        let cancel = self.cancel.clone();
        let disarm = CancellationToken::new();
        let guard = disarm.clone().drop_guard();
        tokio::spawn(async move {
            tokio::select! {
                _ = disarm.cancelled() => {}
                _ = tokio::time::sleep(limit) => {
                    warn!(limit_secs = limit.as_secs_f64(), "transfer timeout reached");
                    cancel.cancel();
                }
            }
        });
        Some(guard)
    }

    /// Sends files in order until all are sent or the peer rejects one. A
    /// rejection is kept in `self.aborted`.
    async fn transfer_files(
        &mut self,
        mut stream: TcpStream,
        files: &[PathBuf],
    ) -> Result<(TcpStream, Vec<FileOutcome>), TransferError> {
        let mut outcomes = Vec::with_capacity(files.len());

        for (index, path) in files.iter().enumerate() {
            self.current_file = Some(
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string()),
            );
            let record = inspect_file(path, index as u32)?;
            let (returned, outcome) = self.transfer_file(stream, &record).await?;
            stream = returned;

            let accepted = outcome.accepted();
            let ack = outcome.final_ack.clone();
            outcomes.push(outcome);
            self.current_file = None;

            if !accepted {
                warn!(file = %record.name, ack = %ack, "peer rejected file, stopping transfer");
                self.aborted = Some(AbortInfo {
                    file: record.name,
                    ack,
                });
                return Ok((stream, outcomes));
            }
            self.completed += 1;
        }

        Ok((stream, outcomes))
    }

    async fn transfer_file(
        &mut self,
        mut stream: TcpStream,
        record: &FileRecord,
    ) -> Result<(TcpStream, FileOutcome), TransferError> {
        let started = Instant::now();

        // Plan before the header goes out so an exhausted profile never
        // leaves a half-announced file on the wire.
        let mut file = tokio::fs::File::open(&record.path).await?;
        let chunks = plan_chunks(&mut file, record.size, &mut self.cursor).await?;
        let chunk_count = chunks.len();

        write_header(&mut stream, &record.header()).await?;
        let header_ack = cancellable(&self.cancel, read_message(&mut stream)).await?;
        if let Some(expected) = &self.config.header_ack
            && header_ack != *expected
        {
            return Err(TransferError::ProtocolViolation(format!(
                "header ack for {} was {:?}, expected {:?}",
                record.name,
                String::from_utf8_lossy(&header_ack),
                String::from_utf8_lossy(expected)
            )));
        }
        debug!(
            file = %record.name,
            ack = %String::from_utf8_lossy(&header_ack),
            "header acknowledged"
        );

        info!(
            file = %record.name,
            size = record.size,
            chunks = chunk_count,
            cursor = self.cursor.position(),
            "sending file"
        );
        let scheduler =
            ChunkScheduler::new(self.config.scheduler.clone(), self.cancel.child_token());
        let (mut stream, transmit): (TcpStream, TransmitReport) =
            scheduler.spawn(stream, chunks).join().await?;

        let final_ack = cancellable(&self.cancel, read_final_ack(&mut stream)).await?;
        let outcome = FileOutcome {
            name: record.name.clone(),
            index: record.index,
            size: record.size,
            checksum: record.checksum.to_string(),
            chunks: transmit.chunks_sent,
            late_slots: transmit.late_slots,
            cursor_after: self.cursor.position(),
            elapsed: started.elapsed(),
            final_ack: String::from_utf8_lossy(&final_ack).into_owned(),
        };
        info!(
            file = %outcome.name,
            bytes = transmit.bytes_sent,
            late_slots = outcome.late_slots,
            "file sent"
        );
        Ok((stream, outcome))
    }
}

/// Awaits `fut` unless the session is cancelled first.
async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, ProtocolError>>,
) -> Result<T, TransferError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        result = fut => Ok(result?),
    }
}
