//! Periodic health sweep over every enabled service.
//!
//! Each sweep checks OS-level liveness first; a dead process is restarted
//! immediately since there is nothing left to probe. Live processes past
//! their boot grace window get an HTTP probe against their health path, and
//! a streak of consecutive probe failures reaching the record's threshold
//! escalates to a restart. The threshold damps transient blips while keeping
//! detection latency bounded by `threshold x interval`.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::service::ServiceRecord;
use crate::supervisor::error::WardenError;
use crate::supervisor::{RestartOutcome, Supervisor};

pub struct HealthMonitor {
    supervisor: Arc<Supervisor>,
    interval: Duration,
    client: reqwest::Client,
    shutdown: CancellationToken,
}

impl HealthMonitor {
    pub fn new(supervisor: Arc<Supervisor>, interval: Duration, shutdown: CancellationToken) -> Self {
        // One shared client; per-request timeouts come from each record.
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .build()
            .unwrap_or_default();
        Self {
            supervisor,
            interval,
            client,
            shutdown,
        }
    }

    /// Run sweeps until cancelled. Never holds the registry lock across
    /// probe I/O; each sweep works from a snapshot.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // consume the immediate first tick so the first sweep happens one
        // interval after startup, giving boot-time services room to come up
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Health monitor stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    /// One pass over all enabled, non-failed services. Failures local to one
    /// service never halt monitoring of the others.
    pub async fn sweep(&self) {
        for record in self.supervisor.snapshot().await {
            if !record.enabled || record.failed {
                continue;
            }

            if !self.supervisor.is_alive(&record.name).await {
                // Confirmed process death bypasses the failure threshold.
                tracing::warn!("'{}' process is gone, restarting", record.name);
                self.escalate(&record.name).await;
                continue;
            }

            if record.in_boot_grace() {
                tracing::debug!("'{}' within boot grace, skipping probe", record.name);
                continue;
            }

            match probe_service(&self.client, &record).await {
                Ok(()) => {
                    self.supervisor.record_probe_success(&record.name).await;
                }
                Err(e) => {
                    let (streak, threshold) =
                        self.supervisor.record_probe_failure(&record.name).await;
                    tracing::warn!(
                        "Health probe for '{}' failed ({}/{}): {}",
                        record.name, streak, threshold, e
                    );
                    if streak >= threshold {
                        self.escalate(&record.name).await;
                    }
                }
            }
        }
    }

    async fn escalate(&self, name: &str) {
        match self.supervisor.restart(name).await {
            Ok(RestartOutcome::Restarted) => tracing::info!("Restarted '{}'", name),
            Ok(RestartOutcome::MarkedFailed) => {
                tracing::error!("'{}' marked failed, giving up on automatic restarts", name)
            }
            Ok(RestartOutcome::InFlight) => {
                tracing::debug!("Restart of '{}' already in flight", name)
            }
            Ok(RestartOutcome::Skipped) => {}
            Err(e) => tracing::error!("Failed to restart '{}': {}", name, e),
        }
    }
}

/// Probe a service's health endpoint. Success is a 2xx response whose
/// trimmed plain-text body is exactly `true`.
pub async fn probe_service(
    client: &reqwest::Client,
    record: &ServiceRecord,
) -> Result<(), WardenError> {
    let url = record.health_url();
    let response = client
        .get(&url)
        .timeout(record.healthcheck_timeout())
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                WardenError::HealthCheckTimeout(record.name.clone())
            } else {
                WardenError::Internal(anyhow::anyhow!("probe of {} failed: {}", url, e))
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(WardenError::Internal(anyhow::anyhow!(
            "probe of {} returned {}",
            url,
            status
        )));
    }

    let body = response
        .text()
        .await
        .map_err(|e| WardenError::Internal(anyhow::anyhow!("probe of {}: {}", url, e)))?;
    if body.trim() == "true" {
        Ok(())
    } else {
        Err(WardenError::Internal(anyhow::anyhow!(
            "probe of {} returned unexpected body {:?}",
            url,
            body.trim()
        )))
    }
}
