//! Health-check signalling.
//!
//! Pings follow the healthchecks.io convention: `{url}/start` when a run
//! begins, `{url}` on success and `{url}/fail` on failure, each a POST whose
//! body carries the summary or diagnostic text.

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::config::HealthConfig;
use crate::errors::{AppError, Result};
use crate::utils::with_retries;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingKind {
    Start,
    Success,
    Fail,
}

impl fmt::Display for PingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PingKind::Start => "start",
            PingKind::Success => "success",
            PingKind::Fail => "fail",
        })
    }
}

/// One fire-and-forget event sent to the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckPing {
    pub kind: PingKind,
    pub payload: Option<String>,
}

impl HealthCheckPing {
    pub fn new(kind: PingKind, payload: Option<String>) -> Self {
        Self { kind, payload }
    }

    /// Endpoint for this ping under the monitor's base URL.
    pub fn url(&self, base: &str) -> String {
        let base = base.trim_end_matches('/');
        match self.kind {
            PingKind::Start => format!("{}/start", base),
            PingKind::Success => base.to_string(),
            PingKind::Fail => format!("{}/fail", base),
        }
    }
}

/// External run monitor. Implementations must never fail or block the caller
/// beyond their own bounded timeout.
#[async_trait]
pub trait Monitor: Send + Sync {
    async fn ping(&self, ping: HealthCheckPing);

    async fn notify_start(&self) {
        self.ping(HealthCheckPing::new(PingKind::Start, None)).await
    }

    async fn notify_success(&self, summary: String) {
        self.ping(HealthCheckPing::new(PingKind::Success, Some(summary)))
            .await
    }

    async fn notify_fail(&self, diagnostic: String) {
        self.ping(HealthCheckPing::new(PingKind::Fail, Some(diagnostic)))
            .await
    }
}

/// HTTP monitor; a no-op when no ping URL is configured.
pub struct HealthSignal {
    endpoint: Option<Endpoint>,
}

struct Endpoint {
    client: reqwest::Client,
    base_url: String,
    retries: u32,
}

impl HealthSignal {
    pub fn new(config: Option<&HealthConfig>) -> Self {
        let Some(config) = config else {
            return Self::disabled();
        };
        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!("Health pings disabled, cannot build HTTP client: {}", e);
                return Self::disabled();
            }
        };
        Self {
            endpoint: Some(Endpoint {
                client,
                base_url: config.ping_url.clone(),
                retries: config.retries,
            }),
        }
    }

    pub fn disabled() -> Self {
        Self { endpoint: None }
    }

    #[cfg(test)]
    pub fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }
}

#[async_trait]
impl Monitor for HealthSignal {
    async fn ping(&self, ping: HealthCheckPing) {
        let Some(endpoint) = &self.endpoint else {
            tracing::debug!("No health endpoint configured, skipping {} ping", ping.kind);
            return;
        };
        let url = ping.url(&endpoint.base_url);
        let body = ping.payload.clone().unwrap_or_default();

        let sent = with_retries(endpoint.retries, &format!("{} ping", ping.kind), || async {
            endpoint
                .client
                .post(&url)
                .body(body.clone())
                .send()
                .await?
                .error_for_status()?;
            Ok(())
        })
        .await;

        match sent {
            Ok(()) => tracing::debug!("Sent {} ping", ping.kind),
            Err(e) => tracing::warn!("Health ping not delivered: {:#}", e),
        }
    }
}

/// Which pings a supervised run emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signals {
    /// start, then success or fail.
    Lifecycle,
    /// fail only.
    FailureOnly,
}

/// The single top-level handler around a run: emits the lifecycle pings and
/// exactly one failure ping, with `diagnose`'s bundle, if `run` fails.
pub async fn supervise<T, R, S, D>(
    monitor: &dyn Monitor,
    signals: Signals,
    run: R,
    summarize: S,
    diagnose: D,
) -> Result<T>
where
    R: Future<Output = Result<T>>,
    S: FnOnce(&T) -> Option<String>,
    D: FnOnce(&AppError) -> String,
{
    if signals == Signals::Lifecycle {
        monitor.notify_start().await;
    }
    match run.await {
        Ok(value) => {
            if signals == Signals::Lifecycle {
                if let Some(summary) = summarize(&value) {
                    monitor.notify_success(summary).await;
                }
            }
            Ok(value)
        }
        Err(err) => {
            tracing::error!("{}: {:#}", err.kind(), err);
            monitor.notify_fail(diagnose(&err)).await;
            Err(err)
        }
    }
}
