use crate::batch::BatchWriter;
use crate::clock::Zone;
use crate::config::CounterConfig;
use crate::errors::{StoreError, TallyError};
use crate::health::HealthMonitor;
use crate::metrics::{unix_to_datetime, CoreMetrics, MetricsSnapshot};
use crate::scheduler::ResetScheduler;
use crate::store::{counter_key, dau_set_key, DurableStore, FastStore};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// The public surface of the counter core.
///
/// In PRIMARY mode every operation executes on the fast store and enqueues
/// its delta to the batch writer; in FALLBACK mode it executes synchronously
/// on the durable store. Each call reads the mode once at entry and commits
/// to that path.
pub struct CounterService {
    fast: Arc<dyn FastStore>,
    durable: Arc<dyn DurableStore>,
    health: HealthMonitor,
    writer: BatchWriter,
    metrics: Arc<CoreMetrics>,
    zone: Zone,
    scheduler_shutdown: watch::Sender<bool>,
    scheduler_handle: JoinHandle<()>,
}

impl CounterService {
    /// Spawn the batch writer and the reset scheduler and return the
    /// running core.
    pub fn start(
        config: CounterConfig,
        fast: Arc<dyn FastStore>,
        durable: Arc<dyn DurableStore>,
    ) -> Result<Self, TallyError> {
        let zone = Zone::parse(&config.scheduler.timezone)?;
        let metrics = Arc::new(CoreMetrics::default());
        let health = HealthMonitor::new(Arc::clone(&fast), &config.fallback);
        let writer = BatchWriter::start(
            Arc::clone(&durable),
            config.batch.clone(),
            Arc::clone(&metrics),
        );

        let (scheduler_shutdown, shutdown_rx) = watch::channel(false);
        let scheduler = ResetScheduler::new(
            Arc::clone(&fast),
            Arc::clone(&durable),
            config.scheduler.clone(),
            zone,
            Arc::clone(&metrics),
        );
        let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx));

        info!("counter core started");
        Ok(Self {
            fast,
            durable,
            health,
            writer,
            metrics,
            zone,
            scheduler_shutdown,
            scheduler_handle,
        })
    }

    /// Stop the background loops: the batch writer drains and flushes
    /// pending once, the scheduler exits at its next wake.
    pub async fn shutdown(self) {
        let _ = self.scheduler_shutdown.send(true);
        self.writer.shutdown().await;
        if let Err(e) = self.scheduler_handle.await {
            error!(error = %e, "reset scheduler task failed during shutdown");
        }
        info!("counter core stopped");
    }

    /// Increment `name` by `delta`, returning the new value.
    ///
    /// With a non-empty `user_id` on the PRIMARY path the increment is
    /// deduplicated per (counter, user, day): the first call of the day
    /// credits exactly 1, repeats return the current value unchanged. The
    /// FALLBACK path bypasses dedup entirely, so a user who was already
    /// counted today can be counted again while the fast store is down.
    pub async fn increment(
        &self,
        name: &str,
        user_id: Option<&str>,
        delta: i64,
    ) -> Result<i64, TallyError> {
        validate_name(name)?;
        if delta == 0 {
            return self.get(name).await;
        }
        if self.health.in_fallback() {
            return self.durable_add(name, delta).await;
        }
        match user_id.filter(|user| !user.is_empty()) {
            Some(user) => self.increment_deduped(name, user, delta).await,
            None => self.apply_primary(name, delta).await,
        }
    }

    /// Decrement `name` by `delta`, returning the new value. Decrements
    /// never consult the dedup set and may go below zero.
    pub async fn decrement(&self, name: &str, delta: i64) -> Result<i64, TallyError> {
        validate_name(name)?;
        if delta == 0 {
            return self.get(name).await;
        }
        if self.health.in_fallback() {
            return self.durable_add(name, -delta).await;
        }
        self.apply_primary(name, -delta).await
    }

    /// Current value of `name`. In PRIMARY mode this is the fast store's
    /// value; in FALLBACK it is the durable store's last-synced value,
    /// which may lag by up to one flush interval.
    pub async fn get(&self, name: &str) -> Result<i64, TallyError> {
        validate_name(name)?;
        if self.health.in_fallback() {
            return self.durable_get(name).await;
        }
        self.read_primary(name).await
    }

    /// Values for each of `names`, without cross-counter consistency. An
    /// empty list yields an empty map.
    pub async fn batch_get(&self, names: &[String]) -> Result<HashMap<String, i64>, TallyError> {
        let mut values = HashMap::with_capacity(names.len());
        for name in names {
            values.insert(name.clone(), self.get(name).await?);
        }
        Ok(values)
    }

    /// Administrative zero of `name` on both stores. Not part of the normal
    /// data path.
    pub async fn reset(&self, name: &str) -> Result<(), TallyError> {
        validate_name(name)?;
        match self.fast.del(&counter_key(name)).await {
            Ok(()) => self.health.record_success(),
            Err(e) => self.report_fast_failure("del", name, e),
        }
        self.durable
            .set_counter(name, 0)
            .await
            .map_err(TallyError::Durable)
    }

    /// Read-only observability snapshot for the RPC layer.
    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            in_fallback: self.health.in_fallback(),
            consecutive_failures: self.health.consecutive_failures(),
            queue_depth: self.writer.queue_depth(),
            dropped_enqueues: self.metrics.dropped_enqueues.load(Ordering::Relaxed),
            last_flush: unix_to_datetime(self.metrics.last_flush_unix.load(Ordering::Relaxed)),
            last_scheduler_run: unix_to_datetime(
                self.metrics.last_scheduler_run_unix.load(Ordering::Relaxed),
            ),
        }
    }

    // --- PRIMARY path -------------------------------------------------------

    /// Apply `delta` on the fast store and enqueue it for the durable side.
    /// A fast-store error re-routes this call through the durable store.
    async fn apply_primary(&self, name: &str, delta: i64) -> Result<i64, TallyError> {
        match self.fast.incr(&counter_key(name), delta).await {
            Ok(value) => {
                self.health.record_success();
                self.enqueue(name, delta);
                Ok(value)
            }
            Err(e) => {
                self.report_fast_failure("incr", name, e);
                self.durable_add(name, delta).await
            }
        }
    }

    async fn increment_deduped(
        &self,
        name: &str,
        user: &str,
        delta: i64,
    ) -> Result<i64, TallyError> {
        let set_key = dau_set_key(name, self.zone.today());
        match self.fast.set_add(&set_key, user).await {
            Ok(true) => {
                self.health.record_success();
                // First credit of the day pins the set's expiry just past
                // the next midnight; re-setting the same absolute expiry on
                // later days' first credits is a no-op for this key.
                if let Err(e) = self.fast.set_expire_at(&set_key, self.zone.dedup_expiry()).await {
                    self.report_fast_failure("set_expire_at", name, e);
                }
                self.apply_primary(name, 1).await
            }
            Ok(false) => {
                self.health.record_success();
                self.read_primary(name).await
            }
            Err(e) => {
                self.report_fast_failure("set_add", name, e);
                self.durable_add(name, delta).await
            }
        }
    }

    async fn read_primary(&self, name: &str) -> Result<i64, TallyError> {
        match self.fast.get(&counter_key(name)).await {
            Ok(value) => {
                self.health.record_success();
                Ok(value)
            }
            Err(e) => {
                self.report_fast_failure("get", name, e);
                self.durable_get(name).await
            }
        }
    }

    fn enqueue(&self, name: &str, delta: i64) {
        if !self.writer.enqueue(name, delta) {
            self.metrics.record_dropped_enqueue();
            debug!(counter = %name, delta, "batch intake full, write record dropped");
        }
    }

    fn report_fast_failure(&self, op: &str, name: &str, error: StoreError) {
        warn!(op, counter = %name, error = %error, "fast store operation failed, re-routing to durable store");
        self.health.record_failure();
    }

    // --- FALLBACK path ------------------------------------------------------

    async fn durable_add(&self, name: &str, delta: i64) -> Result<i64, TallyError> {
        self.durable
            .upsert_counter(name, delta)
            .await
            .map_err(TallyError::Durable)
    }

    async fn durable_get(&self, name: &str) -> Result<i64, TallyError> {
        self.durable
            .get_counter(name)
            .await
            .map_err(TallyError::Durable)
    }
}

fn validate_name(name: &str) -> Result<(), TallyError> {
    if name.is_empty() {
        return Err(TallyError::InvalidArgument(
            "counter name must be non-empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatchConfig, FallbackConfig, SchedulerConfig};
    use crate::store::testing::{MemoryDurableStore, MemoryFastStore};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn test_config() -> CounterConfig {
        CounterConfig {
            batch: BatchConfig {
                size: 100,
                interval_ms: 20,
                queue_capacity: 200,
            },
            fallback: FallbackConfig {
                threshold: 3,
                probe_interval_ms: 20,
            },
            scheduler: SchedulerConfig {
                timezone: "UTC".to_string(),
                daily_counters: vec!["dau".to_string()],
                retention_days: 7,
            },
        }
    }

    fn start(
        config: CounterConfig,
    ) -> (Arc<MemoryFastStore>, Arc<MemoryDurableStore>, CounterService) {
        let fast = Arc::new(MemoryFastStore::default());
        let durable = Arc::new(MemoryDurableStore::default());
        let service = CounterService::start(
            config,
            fast.clone() as Arc<dyn FastStore>,
            durable.clone() as Arc<dyn DurableStore>,
        )
        .unwrap();
        (fast, durable, service)
    }

    async fn settle() {
        // One flush interval plus slack.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn single_user_dau_counts_each_user_once() {
        let (fast, durable, service) = start(test_config());
        let today = service.zone.today();

        assert_eq!(service.increment("dau", Some("u1"), 1).await.unwrap(), 1);
        assert_eq!(service.increment("dau", Some("u1"), 1).await.unwrap(), 1);
        assert_eq!(service.increment("dau", Some("u2"), 1).await.unwrap(), 2);

        settle().await;
        assert_eq!(durable.counter("dau"), 2);

        let set_key = dau_set_key("dau", today);
        let mut members = fast.set_members(&set_key).await.unwrap();
        members.sort_unstable();
        assert_eq!(members, vec!["u1".to_string(), "u2".to_string()]);
        assert!(fast.expirations.lock().unwrap().contains_key(&set_key));

        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn increments_coalesce_into_one_durable_update() {
        let (fast, durable, service) = start(test_config());

        for _ in 0..100 {
            service.increment("online", None, 1).await.unwrap();
        }
        assert_eq!(fast.value(&counter_key("online")), 100);

        settle().await;
        assert_eq!(durable.counter("online"), 100);
        assert_eq!(durable.upsert_count(), 1);

        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn single_fast_store_error_reroutes_without_failing_the_call() {
        let (fast, durable, service) = start(test_config());

        fast.set_failing(true);
        assert_eq!(service.increment("x", None, 5).await.unwrap(), 5);
        assert_eq!(durable.counter("x"), 5);
        assert!(!service.health.in_fallback());

        fast.set_failing(false);
        service.increment("x", None, 1).await.unwrap();
        assert_eq!(service.health.consecutive_failures(), 0);
        assert_eq!(fast.value(&counter_key("x")), 1);

        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_failures_flip_to_fallback_and_probe_recovers() {
        let (fast, durable, service) = start(test_config());

        fast.set_failing(true);
        for i in 1..=3 {
            assert_eq!(service.increment("x", None, 1).await.unwrap(), i);
        }
        assert!(service.health.in_fallback());

        // Fallback: straight to the durable store, no coalescing.
        let upserts_before = durable.upsert_count();
        assert_eq!(service.increment("x", None, 1).await.unwrap(), 4);
        assert_eq!(service.get("x").await.unwrap(), 4);
        assert_eq!(durable.upsert_count(), upserts_before + 1);

        fast.set_failing(false);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!service.health.in_fallback());

        // Back on the primary path.
        assert_eq!(service.increment("x", None, 1).await.unwrap(), 1);
        assert_eq!(fast.value(&counter_key("x")), 1);

        settle().await;
        assert_eq!(durable.counter("x"), 5);

        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dedup_is_bypassed_in_fallback() {
        let (fast, durable, service) = start(test_config());

        fast.set_failing(true);
        for _ in 0..3 {
            service.increment("dau", Some("u1"), 1).await.unwrap();
        }
        assert!(service.health.in_fallback());

        // Same user again: still credited, dedup unavailable.
        assert_eq!(service.increment("dau", Some("u1"), 1).await.unwrap(), 4);
        assert_eq!(durable.counter("dau"), 4);

        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delta_touches_nothing() {
        let (fast, durable, service) = start(test_config());

        assert_eq!(service.increment("x", None, 0).await.unwrap(), 0);
        assert_eq!(service.decrement("x", 0).await.unwrap(), 0);

        settle().await;
        assert_eq!(fast.value(&counter_key("x")), 0);
        assert_eq!(durable.upsert_count(), 0);

        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn empty_user_id_falls_through_to_plain_increment() {
        let (fast, _durable, service) = start(test_config());

        assert_eq!(service.increment("x", Some(""), 5).await.unwrap(), 5);
        assert_eq!(fast.value(&counter_key("x")), 5);
        assert!(fast.sets.lock().unwrap().is_empty());

        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn decrement_goes_below_zero() {
        let (fast, _durable, service) = start(test_config());

        assert_eq!(service.decrement("x", 3).await.unwrap(), -3);
        assert_eq!(fast.value(&counter_key("x")), -3);

        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn batch_get_of_empty_list_is_empty() {
        let (_fast, _durable, service) = start(test_config());

        assert!(service.batch_get(&[]).await.unwrap().is_empty());

        service.increment("a", None, 1).await.unwrap();
        service.increment("b", None, 2).await.unwrap();
        let values = service
            .batch_get(&["a".to_string(), "b".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(values["a"], 1);
        assert_eq!(values["b"], 2);
        assert_eq!(values["missing"], 0);

        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reset_zeroes_both_stores() {
        let (fast, durable, service) = start(test_config());

        service.increment("x", None, 9).await.unwrap();
        settle().await;
        assert_eq!(durable.counter("x"), 9);

        service.reset("x").await.unwrap();
        assert_eq!(fast.value(&counter_key("x")), 0);
        assert_eq!(durable.counter("x"), 0);
        assert_eq!(service.get("x").await.unwrap(), 0);

        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn empty_name_is_rejected_synchronously() {
        let (_fast, _durable, service) = start(test_config());

        assert!(matches!(
            service.increment("", None, 1).await,
            Err(TallyError::InvalidArgument(_))
        ));
        assert!(matches!(
            service.get("").await,
            Err(TallyError::InvalidArgument(_))
        ));

        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_dau_increments_credit_once() {
        let (fast, _durable, service) = start(test_config());
        let service = Arc::new(service);

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let service = Arc::clone(&service);
            tasks.push(tokio::spawn(async move {
                service.increment("dau", Some("u1"), 1).await.unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(fast.value(&counter_key("dau")), 1);

        Arc::try_unwrap(service)
            .unwrap_or_else(|_| panic!("service still shared"))
            .shutdown()
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn overflowing_intake_drops_records_but_keeps_fast_truth() {
        let mut config = test_config();
        config.batch.queue_capacity = 2;
        config.batch.interval_ms = 60_000;
        let (fast, durable, service) = start(config);

        // No intervening await points, so the flush loop cannot drain.
        for _ in 0..5 {
            service.increment("online", None, 1).await.unwrap();
        }

        assert_eq!(fast.value(&counter_key("online")), 5);
        let snapshot = service.metrics();
        assert_eq!(snapshot.dropped_enqueues, 3);
        assert_eq!(snapshot.queue_depth, 2);

        service.shutdown().await;
        assert_eq!(durable.counter("online"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn metrics_snapshot_reflects_mode_and_flushes() {
        let (fast, _durable, service) = start(test_config());

        let snapshot = service.metrics();
        assert!(!snapshot.in_fallback);
        assert_eq!(snapshot.dropped_enqueues, 0);
        assert_eq!(snapshot.last_flush, None);

        service.increment("x", None, 1).await.unwrap();
        settle().await;
        assert!(service.metrics().last_flush.is_some());

        fast.set_failing(true);
        for _ in 0..3 {
            service.increment("x", None, 1).await.unwrap();
        }
        let snapshot = service.metrics();
        assert!(snapshot.in_fallback);
        assert!(snapshot.consecutive_failures >= 3);

        service.shutdown().await;
    }
}
