//! End-of-run result collection.

use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tracebench_protocol::ProtocolError;
use tracebench_protocol::constants::ACK_OK;
use tracebench_protocol::wire::{read_message, write_literal};
use tracebench_transfer::TransferError;

/// One inference result returned by the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultRecord {
    pub name: String,
    pub result: String,
    /// Time from the start of the transfer until the result arrived.
    pub received_after: Duration,
}

/// Drains a fixed number of `(name, result)` pairs from the peer.
#[derive(Debug, Clone)]
pub struct ResultCollector {
    expected: u32,
    result_timeout: Option<Duration>,
}

impl ResultCollector {
    pub fn new(expected: u32, result_timeout: Option<Duration>) -> Self {
        Self {
            expected,
            result_timeout,
        }
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }

    /// Runs exactly `expected` drain iterations: receive a name, reply
    /// `"OK"`, receive the result.
    ///
    /// Fails with `ResultCountMismatch` when the peer closes the connection
    /// or a receive exceeds `result_timeout` before all iterations finish.
    /// Without a timeout, a peer that stays connected but has nothing more
    /// to send blocks this call until `cancel` fires.
    pub async fn drain<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
        since: Instant,
        cancel: &CancellationToken,
    ) -> Result<Vec<ResultRecord>, TransferError> {
        let mut results = Vec::with_capacity(self.expected as usize);

        for received in 0..self.expected {
            let name = self.receive(stream, received, cancel).await?;
            write_literal(stream, ACK_OK).await?;
            let result = self.receive(stream, received, cancel).await?;

            let record = ResultRecord {
                name: String::from_utf8_lossy(&name).into_owned(),
                result: String::from_utf8_lossy(&result).into_owned(),
                received_after: since.elapsed(),
            };
            info!(
                name = %record.name,
                result = %record.result,
                after_ms = record.received_after.as_millis() as u64,
                "result received"
            );
            results.push(record);
        }

        Ok(results)
    }

    async fn receive<S: AsyncRead + Unpin>(
        &self,
        stream: &mut S,
        received: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, TransferError> {
        let read = async {
            match self.result_timeout {
                Some(limit) => tokio::time::timeout(limit, read_message(stream))
                    .await
                    .unwrap_or(Err(ProtocolError::Closed)),
                None => read_message(stream).await,
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            outcome = read => outcome,
        };

        match outcome {
            Ok(msg) => Ok(msg),
            Err(ProtocolError::Closed) => {
                warn!(
                    expected = self.expected,
                    received, "peer stopped sending results"
                );
                Err(TransferError::ResultCountMismatch {
                    expected: self.expected,
                    received,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Sends `count` result pairs, answering each name's "OK".
    async fn serve_results(peer: &mut DuplexStream, count: usize) {
        for i in 0..count {
            peer.write_all(format!("img{i}.jpg").as_bytes()).await.unwrap();
            let mut ok = [0u8; 2];
            peer.read_exact(&mut ok).await.unwrap();
            assert_eq!(&ok, ACK_OK);
            peer.write_all(format!("class {i}").as_bytes()).await.unwrap();
            // Give the collector a chance to read the result on its own.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn drains_expected_pairs() {
        let (mut client, mut peer) = tokio::io::duplex(4096);
        let peer_task = tokio::spawn(async move {
            serve_results(&mut peer, 2).await;
            peer
        });

        let results = ResultCollector::new(2, None)
            .drain(&mut client, Instant::now(), &CancellationToken::new())
            .await
            .unwrap();
        peer_task.await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "img0.jpg");
        assert_eq!(results[0].result, "class 0");
        assert_eq!(results[1].name, "img1.jpg");
        assert_eq!(results[1].result, "class 1");
        assert!(results[1].received_after >= results[0].received_after);
    }

    #[tokio::test]
    async fn zero_expected_reads_nothing() {
        let (mut client, _peer) = tokio::io::duplex(64);
        let results = ResultCollector::new(0, None)
            .drain(&mut client, Instant::now(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn peer_close_before_all_results_is_mismatch() {
        let (mut client, mut peer) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            serve_results(&mut peer, 1).await;
            drop(peer);
        });

        let result = ResultCollector::new(3, None)
            .drain(&mut client, Instant::now(), &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(TransferError::ResultCountMismatch {
                expected: 3,
                received: 1
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_open_peer_blocks_until_cancelled() {
        let (mut client, mut peer) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();
        let peer_task = tokio::spawn(async move {
            serve_results(&mut peer, 1).await;
            // Stay connected without sending anything else.
            tokio::time::sleep(Duration::from_secs(3600)).await;
            peer
        });

        let collector = ResultCollector::new(2, None);
        let blocked = tokio::time::timeout(
            Duration::from_secs(60),
            collector.drain(&mut client, Instant::now(), &cancel),
        )
        .await;
        assert!(blocked.is_err(), "drain should still be waiting");

        cancel.cancel();
        let result = collector
            .drain(&mut client, Instant::now(), &cancel)
            .await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
        peer_task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn result_timeout_turns_silence_into_mismatch() {
        let (mut client, mut peer) = tokio::io::duplex(4096);
        let peer_task = tokio::spawn(async move {
            serve_results(&mut peer, 1).await;
            tokio::time::sleep(Duration::from_secs(3600)).await;
            peer
        });

        let result = ResultCollector::new(2, Some(Duration::from_secs(5)))
            .drain(&mut client, Instant::now(), &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(TransferError::ResultCountMismatch {
                expected: 2,
                received: 1
            })
        ));
        peer_task.abort();
    }
}
