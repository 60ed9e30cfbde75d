//! Readiness predicates deciding when a started server counts as running.

use std::time::Duration;

use reqwest::Client;
use tokio::sync::{broadcast, watch};

use crate::config::{Readiness, StatusProtocol};
use crate::error::{AppError, Result};
use crate::protocol;

use super::logs::LogLine;

const INITIAL_POLL_INTERVAL: Duration = Duration::from_millis(500);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Everything a predicate may observe about the starting process.
pub(super) struct ReadinessProbe {
    pub port: u16,
    pub protocol: StatusProtocol,
    pub probe_timeout: Duration,
    pub http_client: Client,
    pub logs: broadcast::Receiver<LogLine>,
    pub exited: watch::Receiver<bool>,
}

/// Wait until `readiness` holds, the process exits, or `timeout` elapses.
pub(super) async fn wait_ready(
    readiness: &Readiness,
    probe: ReadinessProbe,
    timeout: Duration,
) -> Result<()> {
    let ReadinessProbe {
        port,
        protocol: status_protocol,
        probe_timeout,
        http_client,
        mut logs,
        mut exited,
    } = probe;

    let predicate = async {
        match readiness {
            Readiness::Immediate => Ok(()),
            Readiness::LogPattern { pattern } => wait_for_log(&mut logs, pattern).await,
            Readiness::PortBind => {
                poll_until(move || async move {
                    tokio::net::TcpStream::connect(("127.0.0.1", port))
                        .await
                        .is_ok()
                })
                .await;
                Ok(())
            }
            Readiness::StatusProbe => {
                poll_until(move || async move {
                    protocol::probe(status_protocol, port, probe_timeout).await.is_ok()
                })
                .await;
                Ok(())
            }
            Readiness::HttpHealth { path } => {
                let url = format!("http://127.0.0.1:{}{}", port, path);
                let (client, url) = (&http_client, url.as_str());
                poll_until(move || check_http(client, url)).await;
                Ok(())
            }
        }
    };

    let raced = async {
        tokio::select! {
            result = predicate => result,
            _ = exited.wait_for(|exited| *exited) => {
                Err(AppError::process("process exited before becoming ready"))
            }
        }
    };

    tokio::time::timeout(timeout, raced)
        .await
        .map_err(|_| AppError::timeout("startup readiness", timeout.as_secs()))?
}

async fn wait_for_log(logs: &mut broadcast::Receiver<LogLine>, pattern: &str) -> Result<()> {
    loop {
        match logs.recv().await {
            Ok(line) if line.line.contains(pattern) => return Ok(()),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::debug!("Readiness log watcher skipped {} lines", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(AppError::process("log stream closed before ready"));
            }
        }
    }
}

async fn check_http(client: &Client, url: &str) -> bool {
    match client.get(url).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

/// Poll `check` with exponential backoff until it succeeds.
async fn poll_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let mut interval = INITIAL_POLL_INTERVAL;
    loop {
        if check().await {
            return;
        }
        tokio::time::sleep(interval).await;
        interval = (interval * 2).min(MAX_POLL_INTERVAL);
    }
}
