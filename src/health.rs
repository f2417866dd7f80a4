use crate::config::FallbackConfig;
use crate::store::FastStore;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Primary/fallback mode switch driven by observed fast-store health.
///
/// Operations read [`in_fallback`](HealthMonitor::in_fallback) once at
/// entry and commit to that path for their whole duration; a concurrent
/// flip never corrupts an in-flight call, though for a brief window a
/// call's path may not match the current global mode.
pub struct HealthMonitor {
    fast: Arc<dyn FastStore>,
    threshold: u32,
    probe_interval: Duration,
    state: Arc<HealthState>,
}

#[derive(Default)]
struct HealthState {
    consecutive_failures: AtomicU32,
    in_fallback: AtomicBool,
    probe_running: AtomicBool,
}

impl HealthMonitor {
    pub fn new(fast: Arc<dyn FastStore>, config: &FallbackConfig) -> Self {
        Self {
            fast,
            threshold: config.threshold.max(1),
            probe_interval: Duration::from_millis(config.probe_interval_ms.max(1)),
            state: Arc::new(HealthState::default()),
        }
    }

    pub fn in_fallback(&self) -> bool {
        self.state.in_fallback.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Record a successful fast-store operation.
    pub fn record_success(&self) {
        self.state.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Record a failed fast-store operation. Past the threshold this flips
    /// the core into fallback mode and starts the recovery probe; the CAS
    /// guarantees a single flip and at most one probe task.
    pub fn record_failure(&self) {
        let failures = self
            .state
            .consecutive_failures
            .fetch_add(1, Ordering::AcqRel)
            + 1;

        if failures >= self.threshold
            && self
                .state
                .in_fallback
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            warn!(failures, "fast store unhealthy, switching to fallback mode");
            self.spawn_probe();
        }
    }

    fn spawn_probe(&self) {
        if self
            .state
            .probe_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let fast = Arc::clone(&self.fast);
        let state = Arc::clone(&self.state);
        let probe_interval = self.probe_interval;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(probe_interval).await;
                match fast.ping().await {
                    Ok(()) => {
                        state.consecutive_failures.store(0, Ordering::Relaxed);
                        // Clear probe_running first: while in_fallback is
                        // still true, the flip CAS in record_failure cannot
                        // fire, so no competing probe can be lost between
                        // the two stores.
                        state.probe_running.store(false, Ordering::Release);
                        state.in_fallback.store(false, Ordering::Release);
                        info!("fast store recovered, back to primary mode");
                        break;
                    }
                    Err(e) => debug!(error = %e, "recovery probe failed"),
                }
            }
        });
    }
}
