//! Readiness handshake and resource query against the peer.

use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info};

use tracebench_protocol::constants::{GREETING, RESOURCE_QUERY};
use tracebench_protocol::wire::{expect_message, read_probe_reply, write_literal};
use tracebench_transfer::{QuotaCursor, TransferError};

use crate::config::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT};

/// What the probe learned about the peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReport {
    /// Peer CPU load in percent.
    pub peer_load: f32,
    pub peer_conn_class: i32,
    /// Budget the next chunk will get. Diagnostic only.
    pub next_quota_hint: u64,
    pub round_trip: Duration,
}

/// One-shot peer probe on a dedicated connection.
#[derive(Debug, Clone)]
pub struct ConnectionProbe {
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl Default for ConnectionProbe {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT)
    }
}

impl ConnectionProbe {
    pub fn new(connect_timeout: Duration, handshake_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            handshake_timeout,
        }
    }

    /// Connects to `addr`, checks the greeting and runs one resource query.
    ///
    /// The cursor is only peeked; probing never consumes bandwidth budget.
    pub async fn probe(
        &self,
        addr: &str,
        cursor: &QuotaCursor,
    ) -> Result<ProbeReport, TransferError> {
        let next_quota_hint = cursor.peek()?;
        info!(%addr, "probing peer");

        let mut stream = connect(addr, self.connect_timeout).await?;
        expect_greeting(&mut stream, self.handshake_timeout).await?;
        let report = self.query(&mut stream, next_quota_hint).await?;

        info!(
            peer_load = report.peer_load,
            peer_conn_class = report.peer_conn_class,
            next_quota_hint = report.next_quota_hint,
            rtt_ms = report.round_trip.as_secs_f64() * 1000.0,
            "probe finished"
        );
        Ok(report)
    }

    async fn query<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
        next_quota_hint: u64,
    ) -> Result<ProbeReport, TransferError> {
        let started = Instant::now();
        write_literal(stream, RESOURCE_QUERY).await?;
        let reply = tokio::time::timeout(self.handshake_timeout, read_probe_reply(stream))
            .await
            .map_err(|_| TransferError::Timeout("probe reply"))??;
        let round_trip = started.elapsed();

        Ok(ProbeReport {
            peer_load: reply.load,
            peer_conn_class: reply.conn_class,
            next_quota_hint,
            round_trip,
        })
    }
}

/// Opens a TCP connection, reporting any failure as `ConnectFailed`.
pub(crate) async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream, TransferError> {
    debug!(%addr, "connecting");
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            info!(%addr, "connected");
            Ok(stream)
        }
        Ok(Err(source)) => Err(TransferError::ConnectFailed {
            addr: addr.to_string(),
            source,
        }),
        Err(_) => Err(TransferError::ConnectFailed {
            addr: addr.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
        }),
    }
}

/// Waits for the peer's readiness greeting, read as one message and
/// compared exactly. A mismatch is not retried.
pub(crate) async fn expect_greeting<S: AsyncRead + Unpin>(
    stream: &mut S,
    timeout: Duration,
) -> Result<(), TransferError> {
    tokio::time::timeout(timeout, expect_message(stream, GREETING))
        .await
        .map_err(|_| TransferError::Timeout("greeting"))??;
    Ok(())
}
