use crate::clock::Zone;
use crate::config::SchedulerConfig;
use crate::errors::StoreError;
use crate::metrics::CoreMetrics;
use crate::store::{counter_key, dau_set_key, DurableStore, FastStore};
use chrono::{Days, NaiveDate, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Bound on the work done for one counter during a midnight run. A fresh
/// deadline per step; the run never inherits a caller's context.
const ARCHIVE_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Floor on the computed sleep, so a wake landing exactly on the boundary
/// cannot re-run the same midnight.
const MIN_SLEEP: Duration = Duration::from_secs(1);

/// Archives and zeroes the configured daily counters at each midnight of
/// the configured zone, then prunes history past retention.
pub struct ResetScheduler {
    fast: Arc<dyn FastStore>,
    durable: Arc<dyn DurableStore>,
    daily_counters: Vec<String>,
    retention_days: u32,
    zone: Zone,
    metrics: Arc<CoreMetrics>,
}

impl ResetScheduler {
    pub fn new(
        fast: Arc<dyn FastStore>,
        durable: Arc<dyn DurableStore>,
        config: SchedulerConfig,
        zone: Zone,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        Self {
            fast,
            durable,
            daily_counters: config.daily_counters,
            retention_days: config.retention_days,
            zone,
            metrics,
        }
    }

    /// Sleep-until-midnight loop. The sleep is recomputed against the wall
    /// clock every cycle, so drift never accumulates. Exits when `shutdown`
    /// flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let wait = self.zone.until_next_midnight().max(MIN_SLEEP);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    let today = self.zone.today();
                    let ended = today.pred_opt().unwrap_or(today);
                    self.run_once(ended).await;
                }
                _ = shutdown.changed() => {
                    info!("reset scheduler shutting down");
                    break;
                }
            }
        }
    }

    /// Archive-and-zero every daily counter for the day that just ended,
    /// then prune old history.
    ///
    /// Public so an operator path can re-run a missed day; the history
    /// upsert makes a re-run for the same date idempotent. A failure on one
    /// counter never aborts the rest of the run.
    pub async fn run_once(&self, day: NaiveDate) {
        info!(date = %day, counters = self.daily_counters.len(), "running midnight reset");

        for name in &self.daily_counters {
            match timeout(ARCHIVE_STEP_TIMEOUT, self.archive_and_zero(name, day)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(counter = %name, error = %e, "midnight reset failed for counter, continuing")
                }
                Err(_) => {
                    error!(counter = %name, "midnight reset timed out for counter, continuing")
                }
            }
        }

        self.prune(day).await;
        self.metrics.record_scheduler_run();
    }

    /// Ordering matters: archive before zeroing, zero before dropping the
    /// dedup set. A crash after the archive leaves a non-zero counter whose
    /// re-archive overwrites the same row; a crash after the zero leaves a
    /// set the TTL will collect.
    async fn archive_and_zero(&self, name: &str, day: NaiveDate) -> Result<(), StoreError> {
        let value_key = counter_key(name);
        let set_key = dau_set_key(name, day);

        let value = self.fast.get(&value_key).await?;
        let mut users = self.fast.set_members(&set_key).await?;
        users.sort_unstable();

        let metadata = json!({
            "archived_at": Utc::now().to_rfc3339(),
            "user_count": users.len(),
        });
        self.durable
            .upsert_history(name, day, value, &users, metadata)
            .await?;

        self.fast.del(&value_key).await?;
        self.fast.del(&set_key).await?;

        info!(counter = %name, date = %day, value, users = users.len(), "archived and reset daily counter");
        Ok(())
    }

    async fn prune(&self, day: NaiveDate) {
        let cutoff = day
            .checked_sub_days(Days::new(self.retention_days as u64))
            .unwrap_or(day);
        match self.durable.delete_history_before(cutoff).await {
            Ok(0) => {}
            Ok(rows) => info!(rows, cutoff = %cutoff, "pruned counter history"),
            Err(e) => warn!(error = %e, "failed to prune counter history"),
        }
    }
}
