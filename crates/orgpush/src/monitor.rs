//! Periodic monitor that drives active upgrades forward.
//!
//! Each pass starts newly unblocked buckets, closes finished upgrades and
//! pulls remote status for running items and jobs. A manual trigger over a
//! broadcast channel wakes the loop early.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::db::item_repo::ItemFilter;
use crate::db::job_repo::JobFilter;
use crate::db::query::{ItemSort, JobSort};
use crate::db::SortDir;
use crate::error::Result;
use crate::orchestrator::{ItemStatusCounts, JobReporter, JobStatusCounts, LogReporter, Orchestrator};

/// What a call to [`MonitorLoop::run_pass`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Another pass was still running.
    Skipped,
    /// Nothing unfinished was due.
    Idle,
    Completed(PassSummary),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub upgrades: usize,
    pub upgrades_done: usize,
    pub items: ItemStatusCounts,
    pub jobs: JobStatusCounts,
    pub failures: usize,
}

#[derive(Clone)]
pub struct MonitorLoop {
    orchestrator: Orchestrator,
    reporter: Arc<dyn JobReporter>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    running: Arc<Mutex<()>>,
}

impl MonitorLoop {
    pub fn new(orchestrator: Orchestrator, interval: Duration) -> Self {
        Self {
            orchestrator,
            reporter: Arc::new(LogReporter),
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
            running: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn JobReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Runs one pass unless one is already in progress.
    ///
    /// Failures of a single upgrade, or of the item or job pull, are logged
    /// and counted; the pass carries on. Only the gate query itself fails
    /// the call.
    pub async fn run_pass(&self) -> Result<PassOutcome> {
        let Ok(_guard) = self.running.try_lock() else {
            tracing::debug!("monitor pass already running, skipping");
            return Ok(PassOutcome::Skipped);
        };

        let now = Utc::now();
        if !self.orchestrator.any_unfinished(now)? {
            return Ok(PassOutcome::Idle);
        }

        let mut summary = PassSummary::default();

        for upgrade in self.orchestrator.active_upgrades(now)? {
            summary.upgrades += 1;
            if let Err(e) = self
                .orchestrator
                .activate_available_items(upgrade.id, self.reporter.as_ref())
                .await
            {
                tracing::error!(upgrade_id = upgrade.id, error = %e, "bucket activation failed");
                summary.failures += 1;
                continue;
            }
            match self.orchestrator.complete_if_finished(upgrade.id) {
                Ok(true) => summary.upgrades_done += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(upgrade_id = upgrade.id, error = %e, "cannot complete upgrade");
                    summary.failures += 1;
                }
            }
        }

        let items = self.orchestrator.list_items(
            &ItemFilter::Running { now },
            ItemSort::Id,
            SortDir::Asc,
        );
        match items {
            Ok(items) => match self.orchestrator.fetch_status(&items).await {
                Ok(counts) => {
                    summary.failures += counts.failed;
                    summary.items = counts;
                }
                Err(e) => {
                    tracing::error!(error = %e, "item status pull failed");
                    summary.failures += 1;
                }
            },
            Err(e) => {
                tracing::error!(error = %e, "cannot load running items");
                summary.failures += 1;
            }
        }

        let jobs = self
            .orchestrator
            .list_jobs(&JobFilter::running(now), JobSort::Id, SortDir::Asc);
        match jobs {
            Ok(jobs) => match self.orchestrator.fetch_job_status(&jobs).await {
                Ok(counts) => summary.jobs = counts,
                Err(e) => {
                    tracing::error!(error = %e, "job status pull failed");
                    summary.failures += 1;
                }
            },
            Err(e) => {
                tracing::error!(error = %e, "cannot load running jobs");
                summary.failures += 1;
            }
        }

        tracing::info!(
            upgrades = summary.upgrades,
            done = summary.upgrades_done,
            items_updated = summary.items.updated,
            jobs_updated = summary.jobs.updated,
            failures = summary.failures,
            "monitor pass finished"
        );
        Ok(PassOutcome::Completed(summary))
    }

    /// Starts the loop on the current runtime. A message on `trigger_rx`
    /// runs a pass without waiting for the next tick.
    pub fn start(&self, mut trigger_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let monitor = self.clone();

        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(monitor.interval);
            interval_timer.tick().await; // skip immediate first tick

            loop {
                if monitor.shutdown.load(Ordering::Acquire) {
                    break;
                }

                tokio::select! {
                    _ = interval_timer.tick() => {},
                    Ok(()) = trigger_rx.recv() => {
                        tracing::info!("manual monitor pass triggered");
                    },
                }

                if monitor.shutdown.load(Ordering::Acquire) {
                    break;
                }

                if let Err(e) = monitor.run_pass().await {
                    tracing::error!(error = %e, "monitor pass failed");
                }
            }
            tracing::info!("monitor stopped");
        })
    }

    /// Signals the loop to stop after the current pass.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::UpgradeEventBus;
    use crate::config::EngineConfig;
    use crate::db::Database;
    use crate::gateway::{Connector, GatewayError, OrgConnection};
    use async_trait::async_trait;

    struct NoOrgs;

    #[async_trait]
    impl Connector for NoOrgs {
        async fn build_connection(
            &self,
            org_id: &str,
        ) -> std::result::Result<Arc<dyn OrgConnection>, GatewayError> {
            Err(GatewayError::UnknownOrg(org_id.to_string()))
        }
    }

    fn monitor() -> MonitorLoop {
        let orchestrator = Orchestrator::new(
            Database::open_in_memory().unwrap(),
            Arc::new(NoOrgs),
            UpgradeEventBus::default(),
            &EngineConfig::default(),
        );
        MonitorLoop::new(orchestrator, Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_pass_is_idle_without_work() {
        assert_eq!(monitor().run_pass().await.unwrap(), PassOutcome::Idle);
    }

    #[tokio::test]
    async fn test_concurrent_pass_is_skipped() {
        let monitor = monitor();
        let _held = monitor.running.lock().await;
        assert_eq!(monitor.run_pass().await.unwrap(), PassOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_monitor_shutdown() {
        let monitor = monitor();
        let (trigger_tx, trigger_rx) = broadcast::channel(16);
        let handle = monitor.start(trigger_rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.stop();
        let _ = trigger_tx.send(());

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("monitor did not stop")
            .expect("monitor task panicked");
    }
}
