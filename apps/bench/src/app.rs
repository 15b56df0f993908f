//! Run orchestration: profile, optional simulated peer, session, report.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracebench_peer_sim::{PeerScript, PeerSim};
use tracebench_session::{RunReport, TransferSession};
use tracebench_transfer::{BandwidthProfile, QuotaCursor};

use crate::config::Config;

/// Runs one benchmark and writes the report if configured.
pub async fn run(config: Config) -> anyhow::Result<RunReport> {
    let profile = Arc::new(BandwidthProfile::load(Path::new(&config.trace_path))?);
    let session_config = config.session_config()?;

    // -- Peer --
    let mut sim = None;
    let addr = if config.simulate_peer {
        let script = PeerScript {
            budgets: profile.budgets().to_vec(),
            ..PeerScript::default()
        };
        let (addr, cancel, handle) = PeerSim::spawn(script).await?;
        tracing::info!(%addr, "simulated peer listening");
        sim = Some((cancel, handle));
        addr.to_string()
    } else {
        config.peer_addr()
    };

    // -- Session --
    let mut session = TransferSession::new(session_config, QuotaCursor::new(profile));
    let interrupt = watch_ctrl_c(session.cancel_token());
    let result = session.run(&addr, Path::new(&config.source_dir)).await;
    interrupt.cancel();

    if let Some((cancel, handle)) = sim {
        cancel.cancel();
        match handle.await {
            Ok(Ok(log)) => tracing::debug!(
                headers = log.headers.len(),
                results = log.results_sent,
                "simulated peer finished"
            ),
            Ok(Err(e)) => tracing::warn!(error = %e, "simulated peer failed"),
            Err(e) => tracing::warn!(error = %e, "simulated peer task failed"),
        }
    }

    let report = result?;
    summarize(&report);
    if let Some(path) = &config.report_path {
        write_report(&report, Path::new(path))?;
    }
    report.ensure_complete()?;
    Ok(report)
}

/// Cancels `session` on SIGINT until the returned token is cancelled.
fn watch_ctrl_c(session: CancellationToken) -> CancellationToken {
    let done = CancellationToken::new();
    let watcher = done.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = watcher.cancelled() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("SIGINT received, cancelling run");
                session.cancel();
            }
        }
    });
    done
}

fn summarize(report: &RunReport) {
    for file in &report.files {
        tracing::info!(
            file = %file.name,
            size = file.size,
            chunks = file.chunks,
            late_slots = file.late_slots,
            elapsed_ms = file.elapsed.as_millis() as u64,
            ack = %file.final_ack,
            "file summary"
        );
    }
    for result in &report.results {
        tracing::info!(
            name = %result.name,
            result = %result.result,
            after_ms = result.received_after.as_millis() as u64,
            "inference result"
        );
    }
    tracing::info!(
        peer_load = report.probe.peer_load,
        completed = report.completed(),
        announced = report.file_count,
        cursor = report.cursor_position,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "run summary"
    );
}

fn write_report(report: &RunReport, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json)?;
    tracing::info!(path = %path.display(), "report written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Trace of 800 bits per quantum, i.e. 100-byte chunks.
    fn fixture(tmp: &Path) -> Config {
        let trace = tmp.join("trace.txt");
        std::fs::write(&trace, "800\n800\n800\n800\n800\n800\n").unwrap();
        let images = tmp.join("images");
        std::fs::create_dir(&images).unwrap();
        std::fs::write(images.join("cat.jpg"), vec![7u8; 230]).unwrap();
        std::fs::write(images.join("dog.jpg"), vec![9u8; 90]).unwrap();

        Config {
            trace_path: trace.to_string_lossy().into_owned(),
            source_dir: images.to_string_lossy().into_owned(),
            quantum_ms: 10,
            simulate_peer: true,
            report_path: Some(tmp.join("out/report.json").to_string_lossy().into_owned()),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn simulated_run_writes_report() {
        let tmp = tempfile::tempdir().unwrap();
        let config = fixture(tmp.path());

        let report = run(config).await.unwrap();
        assert_eq!(report.file_count, 2);
        assert_eq!(report.completed(), 2);
        assert_eq!(report.cursor_position, 4);

        let json = std::fs::read_to_string(tmp.path().join("out/report.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["file_count"], 2);
        assert_eq!(value["files"][0]["name"], "cat.jpg");
        assert_eq!(value["files"][0]["chunks"], 3);
        assert_eq!(value["results"][1]["name"], "dog.jpg");
        assert_eq!(value["drain_policy"], "announced");
    }

    #[tokio::test]
    async fn short_trace_fails_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let config = fixture(tmp.path());
        std::fs::write(&config.trace_path, "800\n800\n").unwrap();

        let err = run(config).await.unwrap_err();
        assert!(err.to_string().contains("exhausted"), "{err}");
    }

    #[tokio::test]
    async fn missing_trace_fails_before_connecting() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            trace_path: tmp.path().join("absent.txt").to_string_lossy().into_owned(),
            ..Config::default()
        };
        assert!(run(config).await.is_err());
    }
}
