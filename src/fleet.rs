//! Stopping every workload the sidecar hosts, and bringing them back later.
//!
//! A fleet stop is one batched stop request followed by polling the workload
//! list until every stopped workload reports a final status. The workloads that
//! were running beforehand are persisted so a later launch can resume them.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::{
    config::ShutdownConfig,
    snapshot::ShutdownStore,
    workloads::{Workload, WorkloadApi, WorkloadConnector},
};

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("failed to reach the sidecar api")]
    Connect(#[source] anyhow::Error),
    #[error("failed to request workload stop")]
    StopRequest(#[source] anyhow::Error),
    #[error("some servers failed to stop within timeout")]
    Timeout { pending: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopAllOutcome {
    NothingRunning,
    /// Every named workload reached a final status.
    Stopped(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    NothingToResume,
    Restarted(Vec<String>),
}

pub struct FleetShutdown {
    connector: Arc<dyn WorkloadConnector>,
    store: ShutdownStore,
    poll_interval: Duration,
    timeout: Duration,
}

impl FleetShutdown {
    pub fn new(
        connector: Arc<dyn WorkloadConnector>,
        store: ShutdownStore,
        config: &ShutdownConfig,
    ) -> Self {
        Self {
            connector,
            store,
            poll_interval: config.poll_interval(),
            timeout: config.timeout(),
        }
    }

    pub fn store(&self) -> &ShutdownStore {
        &self.store
    }

    /// Stops every running workload of the sidecar on `port` and waits for them to settle.
    pub async fn stop_all_servers(&self, port: u16) -> Result<StopAllOutcome, ShutdownError> {
        let api = self.connector.connect(port).map_err(ShutdownError::Connect)?;

        let running = running_workloads(api.as_ref()).await;
        let names: Vec<String> = running.iter().map(|w| w.name.clone()).collect();
        info!(count = names.len(), ?names, "found running servers");

        if running.is_empty() {
            info!("No running servers – teardown complete");
            return Ok(StopAllOutcome::NothingRunning);
        }

        if let Err(err) = self.store.save(&running) {
            warn!(err = %format!("{err:#}"), "failed to persist shutdown snapshot");
        }

        info!(count = names.len(), "stopping servers");
        if let Err(err) = api.stop_workloads(&names).await {
            error!(err = %format!("{err:#}"), "failed to initiate stop for servers");
            return Err(ShutdownError::StopRequest(err));
        }

        match self.poll_until_stopped(api.as_ref(), &names).await {
            Ok(()) => {
                info!("All servers stopped cleanly");
                Ok(StopAllOutcome::Stopped(names))
            }
            Err(pending) => {
                error!(?pending, "Some servers failed to stop within timeout");
                Err(ShutdownError::Timeout { pending })
            }
        }
    }

    /// Polls until every tracked workload is final. Returns the names still
    /// pending once the shutdown deadline passes; a slow listing counts against it.
    async fn poll_until_stopped(
        &self,
        api: &dyn WorkloadApi,
        names: &[String],
    ) -> Result<(), Vec<String>> {
        let deadline = Instant::now() + self.timeout;
        let mut pending = names.to_vec();
        let mut attempt: u32 = 0;

        loop {
            if attempt > 0 {
                tokio::time::sleep_until((Instant::now() + self.poll_interval).min(deadline)).await;
                if Instant::now() >= deadline {
                    break;
                }
            }
            attempt += 1;

            let listing = tokio::time::timeout_at(deadline, api.list_workloads(true)).await;
            let workloads = match listing {
                Ok(Ok(workloads)) => workloads,
                Ok(Err(err)) => {
                    error!(attempt, err = %format!("{err:#}"), "error polling server status");
                    continue;
                }
                Err(_) => {
                    warn!(attempt, "server status poll ran past the shutdown deadline");
                    break;
                }
            };

            let waiting: Vec<&Workload> = workloads
                .iter()
                .filter(|w| !w.name.is_empty() && names.contains(&w.name))
                .filter(|w| !w.status.is_final())
                .collect();

            if waiting.is_empty() {
                info!("All servers have reached final state");
                return Ok(());
            }

            let summary = waiting
                .iter()
                .map(|w| format!("{}({})", w.name, w.status))
                .collect::<Vec<_>>()
                .join(", ");
            info!(
                attempt,
                count = waiting.len(),
                "still waiting for servers to reach final state: {summary}"
            );
            pending = waiting.iter().map(|w| w.name.clone()).collect();
        }

        Err(pending)
    }

    /// Restarts the workloads recorded by the last fleet stop that still exist.
    pub async fn resume_servers(&self, port: u16) -> Result<ResumeOutcome> {
        let snapshot = self.store.load()?;
        if snapshot.is_empty() {
            info!("no servers to resume");
            return Ok(ResumeOutcome::NothingToResume);
        }

        let api = self.connector.connect(port)?;
        let existing = api
            .list_workloads(true)
            .await
            .context("failed to list workloads before resume")?;

        let names: Vec<String> = snapshot
            .iter()
            .map(|w| w.name.clone())
            .filter(|name| !name.is_empty() && existing.iter().any(|w| &w.name == name))
            .collect();

        if names.is_empty() {
            info!("none of the previously running servers exist any more");
            self.store.clear()?;
            return Ok(ResumeOutcome::NothingToResume);
        }

        info!(?names, "restarting servers from last shutdown");
        api.restart_workloads(&names)
            .await
            .context("failed to restart servers from last shutdown")?;
        self.store.clear()?;
        Ok(ResumeOutcome::Restarted(names))
    }

    pub fn last_shutdown_servers(&self) -> Result<Vec<Workload>> {
        self.store.load()
    }

    pub fn clear_shutdown_history(&self) -> Result<()> {
        self.store.clear()
    }
}

/// Workloads currently running. A failed listing counts as none.
async fn running_workloads(api: &dyn WorkloadApi) -> Vec<Workload> {
    match api.list_workloads(true).await {
        Ok(workloads) => workloads.into_iter().filter(Workload::is_running).collect(),
        Err(err) => {
            error!(err = %format!("{err:#}"), "failed to get running servers");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_support::{FakeConnector, FakeWorkloadApi, workload},
        workloads::WorkloadStatus::{Error as Errored, Running, Stopped, Stopping},
    };
    use tempfile::TempDir;

    struct Harness {
        fleet: FleetShutdown,
        api: Arc<FakeWorkloadApi>,
        connector: Arc<FakeConnector>,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().expect("tempdir");
        let api = Arc::new(FakeWorkloadApi::default());
        let connector = Arc::new(FakeConnector::new(api.clone()));
        let fleet = FleetShutdown::new(
            connector.clone(),
            ShutdownStore::in_dir(dir.path()),
            &ShutdownConfig::default(),
        );
        Harness {
            fleet,
            api,
            connector,
            _dir: dir,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_running_makes_no_stop_call() {
        let h = harness();
        h.api.push_list(Ok(vec![workload("a", Stopped), workload("", Running)]));

        let outcome = h.fleet.stop_all_servers(50001).await.expect("stop all");
        assert_eq!(outcome, StopAllOutcome::NothingRunning);
        assert!(h.api.stop_calls().is_empty());
        assert_eq!(h.connector.ports(), vec![50001]);
    }

    #[tokio::test(start_paused = true)]
    async fn listing_failure_is_treated_as_empty() {
        let h = harness();
        h.api.push_list(Err("connection refused".into()));

        let outcome = h.fleet.stop_all_servers(50001).await.expect("stop all");
        assert_eq!(outcome, StopAllOutcome::NothingRunning);
        assert!(h.api.stop_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn one_batched_stop_then_polls_to_convergence() {
        let h = harness();
        h.api.push_list(Ok(vec![
            workload("a", Running),
            workload("b", Running),
            workload("c", Stopped),
        ]));
        h.api.push_list(Ok(vec![workload("a", Stopping), workload("b", Stopped)]));
        h.api.push_list(Err("transient".into()));
        h.api.push_list(Ok(vec![workload("a", Errored), workload("b", Stopped)]));

        let started = tokio::time::Instant::now();
        let outcome = h.fleet.stop_all_servers(50001).await.expect("stop all");

        assert_eq!(
            outcome,
            StopAllOutcome::Stopped(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(
            h.api.stop_calls(),
            vec![vec!["a".to_string(), "b".to_string()]]
        );
        assert_eq!(h.api.list_calls(), 4);
        // first poll is immediate, the next two wait one interval each
        assert_eq!(started.elapsed(), Duration::from_secs(4));

        let snapshot = h.fleet.last_shutdown_servers().expect("snapshot");
        let names: Vec<_> = snapshot.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_workload_times_out() {
        let h = harness();
        h.api.push_list(Ok(vec![workload("a", Running)]));
        h.api.set_default_list(vec![workload("a", Stopping)]);

        let started = tokio::time::Instant::now();
        let err = h
            .fleet
            .stop_all_servers(50001)
            .await
            .expect_err("must time out");

        match err {
            ShutdownError::Timeout { ref pending } => assert_eq!(pending, &["a".to_string()]),
            ref other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(err.to_string(), "some servers failed to stop within timeout");
        // polls at 0s, 2s, ..., 38s, then the 40s deadline ends the wait
        assert_eq!(h.api.list_calls(), 1 + 20);
        assert_eq!(started.elapsed(), Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_stop_request_is_an_error() {
        let h = harness();
        h.api.push_list(Ok(vec![workload("a", Running)]));
        h.api.fail_stop();

        let err = h
            .fleet
            .stop_all_servers(50001)
            .await
            .expect_err("stop must fail");
        assert!(matches!(err, ShutdownError::StopRequest(_)));
        assert_eq!(h.api.list_calls(), 1, "no polling after a failed stop");
    }

    #[tokio::test]
    async fn resume_restarts_surviving_workloads_and_clears() {
        let h = harness();
        h.fleet
            .store()
            .save(&[workload("a", Running), workload("gone", Running)])
            .expect("save");
        h.api.push_list(Ok(vec![workload("a", Stopped), workload("other", Stopped)]));

        let outcome = h.fleet.resume_servers(50001).await.expect("resume");
        assert_eq!(outcome, ResumeOutcome::Restarted(vec!["a".to_string()]));
        assert_eq!(h.api.restart_calls(), vec![vec!["a".to_string()]]);
        assert!(h.fleet.last_shutdown_servers().expect("load").is_empty());
    }

    #[tokio::test]
    async fn resume_with_empty_snapshot_does_nothing() {
        let h = harness();
        let outcome = h.fleet.resume_servers(50001).await.expect("resume");
        assert_eq!(outcome, ResumeOutcome::NothingToResume);
        assert_eq!(h.api.list_calls(), 0);
    }

    #[tokio::test]
    async fn failed_resume_keeps_snapshot() {
        let h = harness();
        h.fleet
            .store()
            .save(&[workload("a", Running)])
            .expect("save");
        h.api.push_list(Ok(vec![workload("a", Stopped)]));
        h.api.fail_restart();

        assert!(h.fleet.resume_servers(50001).await.is_err());
        assert_eq!(h.fleet.last_shutdown_servers().expect("load").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_listings_cannot_stretch_the_deadline() {
        let h = harness();
        h.api.push_list(Ok(vec![workload("a", Running)]));
        h.api.set_default_list(vec![workload("a", Stopping)]);
        h.api.set_list_delay(Duration::from_secs(10));

        let started = tokio::time::Instant::now();
        let err = h
            .fleet
            .stop_all_servers(50001)
            .await
            .expect_err("must time out");

        assert!(matches!(err, ShutdownError::Timeout { .. }));
        // 10s for the initial listing, then at most the 40s shutdown timeout
        assert!(
            started.elapsed() <= Duration::from_secs(50),
            "took {:?}",
            started.elapsed()
        );
        assert_eq!(h.api.stop_calls().len(), 1);
    }
}
