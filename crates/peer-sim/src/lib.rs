//! Scripted inference peer.
//!
//! Binds a loopback listener and answers probes and transfers the way the
//! inference worker does, following a [`PeerScript`]. Everything the client
//! sent is recorded in a [`PeerLog`] so tests can inspect the wire traffic.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tracebench_protocol::ProtocolError;
use tracebench_protocol::constants::{
    ACK_OK, CHUNK_ACK_LEN, GREETING, RESOURCE_QUERY, TRANSFER_INTENT,
};
use tracebench_protocol::wire::{
    FileHeader, ProbeReply, expect_literal, read_file_count, read_header, write_literal,
    write_probe_reply,
};

/// How the peer behaves on each connection.
#[derive(Debug, Clone)]
pub struct PeerScript {
    pub greeting: Vec<u8>,
    pub load: f32,
    pub conn_class: i32,
    pub header_ack: Vec<u8>,
    pub chunk_ack: [u8; CHUNK_ACK_LEN],
    /// Byte budgets used to split file bodies into chunks. Must mirror the
    /// client's bandwidth profile.
    pub budgets: Vec<u64>,
    /// Final ack for each file by position; later files get `"OK"`.
    pub final_acks: Vec<[u8; 2]>,
    /// Results to send; `None` sends one per announced file.
    pub results: Option<u32>,
    /// Keep the connection open after the last result instead of closing.
    pub hold_open: bool,
    /// Pause after each variable-size message so the client reads it alone.
    pub message_gap: Duration,
}

impl Default for PeerScript {
    fn default() -> Self {
        Self {
            greeting: GREETING.to_vec(),
            load: 0.0,
            conn_class: 0,
            header_ack: b"[Server] Header received.".to_vec(),
            chunk_ack: *b"[Server] ACK",
            budgets: Vec::new(),
            final_acks: Vec::new(),
            results: None,
            hold_open: false,
            message_gap: Duration::from_millis(20),
        }
    }
}

/// Everything the peer observed.
#[derive(Debug, Clone, Default)]
pub struct PeerLog {
    pub probes: u32,
    pub announced: Option<u32>,
    pub headers: Vec<FileHeader>,
    pub bodies: Vec<Vec<u8>>,
    pub chunk_sizes: Vec<Vec<usize>>,
    pub results_sent: u32,
}

/// A scripted peer bound to an ephemeral loopback port.
pub struct PeerSim {
    listener: TcpListener,
    script: PeerScript,
}

impl PeerSim {
    pub async fn bind(script: PeerScript) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        Ok(Self { listener, script })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Binds and serves in a background task.
    pub async fn spawn(
        script: PeerScript,
    ) -> std::io::Result<(
        SocketAddr,
        CancellationToken,
        JoinHandle<Result<PeerLog, ProtocolError>>,
    )> {
        let sim = Self::bind(script).await?;
        let addr = sim.local_addr()?;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sim.serve(cancel.clone()));
        Ok((addr, cancel, handle))
    }

    /// Accepts connections until one transfer has been served or `cancel`
    /// fires, then returns the log.
    pub async fn serve(self, cancel: CancellationToken) -> Result<PeerLog, ProtocolError> {
        let mut log = PeerLog::default();

        loop {
            let mut stream = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(log),
                accepted = self.listener.accept() => {
                    let (stream, addr) = accepted?;
                    debug!(%addr, "peer accepted connection");
                    stream
                }
            };

            match self.handle_connection(&mut stream, &mut log, &cancel).await {
                Ok(true) => return Ok(log),
                Ok(false) => {}
                Err(ProtocolError::Closed) => debug!("client went away"),
                Err(e) => {
                    warn!(error = %e, "peer connection failed");
                    return Err(e);
                }
            }
        }
    }

    /// Returns `Ok(true)` once a transfer connection has been fully served.
    async fn handle_connection(
        &self,
        stream: &mut TcpStream,
        log: &mut PeerLog,
        cancel: &CancellationToken,
    ) -> Result<bool, ProtocolError> {
        write_literal(stream, &self.script.greeting).await?;

        // The intent is one byte shorter than the query, and is followed
        // immediately by the file count, so read only its length first.
        let mut opening = vec![0u8; TRANSFER_INTENT.len()];
        read_exact(stream, &mut opening).await?;
        if opening == TRANSFER_INTENT {
            self.serve_transfer(stream, log, cancel).await?;
            return Ok(true);
        }

        let mut last = [0u8; 1];
        read_exact(stream, &mut last).await?;
        opening.extend_from_slice(&last);
        if opening != RESOURCE_QUERY {
            return Err(ProtocolError::Violation(format!(
                "unknown opening message {:?}",
                String::from_utf8_lossy(&opening)
            )));
        }

        let reply = ProbeReply {
            load: self.script.load,
            conn_class: self.script.conn_class,
        };
        write_probe_reply(stream, &reply).await?;
        log.probes += 1;
        info!(load = reply.load, conn_class = reply.conn_class, "probe answered");
        Ok(false)
    }

    async fn serve_transfer(
        &self,
        stream: &mut TcpStream,
        log: &mut PeerLog,
        cancel: &CancellationToken,
    ) -> Result<(), ProtocolError> {
        let count = read_file_count(stream).await?;
        log.announced = Some(count);
        info!(count, "transfer announced");

        let mut budget_pos = 0usize;
        for i in 0..count as usize {
            let header = read_header(stream).await?;
            debug!(name = %header.name, size = header.file_size, "header received");
            self.send_message(stream, &self.script.header_ack).await?;

            let mut body = Vec::with_capacity(header.file_size as usize);
            let mut sizes = Vec::new();
            let mut remaining = header.file_size;
            while remaining > 0 {
                let budget = *self.script.budgets.get(budget_pos).ok_or_else(|| {
                    ProtocolError::Violation("peer ran out of chunk budgets".into())
                })?;
                budget_pos += 1;
                let len = budget.min(remaining) as usize;
                let mut chunk = vec![0u8; len];
                read_exact(stream, &mut chunk).await?;
                stream.write_all(&self.script.chunk_ack).await?;
                body.extend_from_slice(&chunk);
                sizes.push(len);
                remaining -= len as u64;
            }

            let final_ack = self.script.final_acks.get(i).copied().unwrap_or(*ACK_OK);
            stream.write_all(&final_ack).await?;
            log.headers.push(header);
            log.bodies.push(body);
            log.chunk_sizes.push(sizes);

            if final_ack != *ACK_OK {
                info!(file = i, "file rejected, expecting no further headers");
                break;
            }
        }

        let results = self.script.results.unwrap_or(count);
        for i in 0..results as usize {
            let name = log
                .headers
                .get(i)
                .map(|h| h.name.clone())
                .unwrap_or_else(|| format!("missing-{i}"));
            self.send_message(stream, name.as_bytes()).await?;
            expect_literal(stream, ACK_OK).await?;
            let result = format!("{name}: class {i}");
            self.send_message(stream, result.as_bytes()).await?;
            log.results_sent += 1;
        }

        if self.script.hold_open {
            info!("holding connection open");
            cancel.cancelled().await;
        }
        Ok(())
    }

    async fn send_message(&self, stream: &mut TcpStream, msg: &[u8]) -> Result<(), ProtocolError> {
        stream.write_all(msg).await?;
        tokio::time::sleep(self.script.message_gap).await;
        Ok(())
    }
}

async fn read_exact(stream: &mut TcpStream, buf: &mut [u8]) -> Result<(), ProtocolError> {
    stream
        .read_exact(buf)
        .await
        .map(|_| ())
        .map_err(ProtocolError::from_read)
}
