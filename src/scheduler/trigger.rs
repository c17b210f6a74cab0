//! Fixed-delay periodic trigger.
//!
//! Fires a [`PeriodicTask`] every `interval`, first after one full interval.
//! Each invocation runs as its own tokio task, so the ticker keeps its
//! cadence while work is in flight. A tick that finds the previous
//! invocation still running is skipped, never queued.
//!
//! Timing comes from the tokio clock, so tests drive it deterministically
//! with `tokio::time::pause` / `start_paused`.
//!
//! Shutdown: cancelling the token stops new ticks at once. An invocation
//! already in flight gets `shutdown_grace` to finish and is aborted after
//! that.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Work fired by the trigger.
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn run(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerConfig {
    pub interval: Duration,
    pub shutdown_grace: Duration,
}

impl TriggerConfig {
    pub fn from_settings(cfg: &crate::config::SchedulerConfig) -> Self {
        Self {
            interval: Duration::from_secs(cfg.interval_secs),
            shutdown_grace: Duration::from_secs(cfg.shutdown_grace_secs),
        }
    }
}

#[derive(Debug, Default)]
struct TriggerCounters {
    ticks: AtomicU64,
    invocations: AtomicU64,
    skipped: AtomicU64,
    failures: AtomicU64,
    aborted: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TriggerStats {
    pub ticks: u64,
    pub invocations: u64,
    /// Ticks dropped because an invocation was still running.
    pub skipped: u64,
    /// Invocations that returned an error or panicked.
    pub failures: u64,
    /// Invocations cut off after the shutdown grace period.
    pub aborted: u64,
}

impl TriggerCounters {
    fn snapshot(&self) -> TriggerStats {
        TriggerStats {
            ticks: self.ticks.load(Ordering::SeqCst),
            invocations: self.invocations.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
            aborted: self.aborted.load(Ordering::SeqCst),
        }
    }
}

pub struct PeriodicTrigger {
    config: TriggerConfig,
    task: Arc<dyn PeriodicTask>,
}

impl PeriodicTrigger {
    pub fn new(config: TriggerConfig, task: Arc<dyn PeriodicTask>) -> Self {
        Self { config, task }
    }

    /// Spawn the trigger loop. It runs until `shutdown` is cancelled or
    /// [`TriggerHandle::stop`] is called.
    pub fn start(self, shutdown: CancellationToken) -> TriggerHandle {
        let counters = Arc::new(TriggerCounters::default());
        let join = tokio::spawn(run_loop(
            self.config,
            self.task,
            Arc::clone(&counters),
            shutdown.clone(),
        ));
        TriggerHandle {
            shutdown,
            join,
            counters,
        }
    }
}

/// Owner's side of a running trigger.
pub struct TriggerHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
    counters: Arc<TriggerCounters>,
}

impl TriggerHandle {
    pub fn stats(&self) -> TriggerStats {
        self.counters.snapshot()
    }

    /// Stop ticking and wait for the in-flight invocation (bounded by the
    /// grace period).
    pub async fn stop(self) -> TriggerStats {
        self.shutdown.cancel();
        if let Err(e) = self.join.await {
            error!(error = %e, "Periodic trigger loop ended abnormally");
        }
        self.counters.snapshot()
    }
}

async fn run_loop(
    config: TriggerConfig,
    task: Arc<dyn PeriodicTask>,
    counters: Arc<TriggerCounters>,
    shutdown: CancellationToken,
) {
    info!(task = task.name(), interval_secs = config.interval.as_secs_f64(), "Periodic trigger started");

    let mut ticker = tokio::time::interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut in_flight: Option<JoinHandle<anyhow::Result<()>>> = None;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            joined = async {
                match in_flight.as_mut() {
                    Some(running) => running.await,
                    None => std::future::pending().await,
                }
            }, if in_flight.is_some() => {
                in_flight = None;
                record_outcome(task.name(), &counters, joined);
            }
            _ = ticker.tick() => {
                let tick = counters.ticks.fetch_add(1, Ordering::SeqCst) + 1;
                if in_flight.is_some() {
                    counters.skipped.fetch_add(1, Ordering::SeqCst);
                    warn!(task = task.name(), tick, "Previous invocation still running, skipped tick");
                    continue;
                }
                counters.invocations.fetch_add(1, Ordering::SeqCst);
                debug!(task = task.name(), tick, "Invoking periodic task");
                let task = Arc::clone(&task);
                in_flight = Some(tokio::spawn(async move { task.run().await }));
            }
        }
    }

    info!(task = task.name(), "Periodic trigger stopping");
    if let Some(mut pending) = in_flight {
        match tokio::time::timeout(config.shutdown_grace, &mut pending).await {
            Ok(joined) => record_outcome(task.name(), &counters, joined),
            Err(_) => {
                pending.abort();
                counters.aborted.fetch_add(1, Ordering::SeqCst);
                warn!(
                    task = task.name(),
                    grace_secs = config.shutdown_grace.as_secs_f64(),
                    "In-flight invocation exceeded shutdown grace period, aborted"
                );
            }
        }
    }
}

fn record_outcome(
    name: &str,
    counters: &TriggerCounters,
    joined: Result<anyhow::Result<()>, JoinError>,
) {
    match joined {
        Ok(Ok(())) => debug!(task = name, "Periodic task finished"),
        Ok(Err(e)) => {
            counters.failures.fetch_add(1, Ordering::SeqCst);
            error!(task = name, error = %format!("{e:#}"), "Periodic task failed");
        }
        Err(e) if e.is_panic() => {
            counters.failures.fetch_add(1, Ordering::SeqCst);
            error!(task = name, "Periodic task panicked");
        }
        Err(e) => warn!(task = name, error = %e, "Periodic task cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Sleeps for `work` on every call and tracks concurrency.
    struct SlowTask {
        work: Duration,
        calls: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
        completed: AtomicUsize,
    }

    impl SlowTask {
        fn new(work: Duration) -> Arc<Self> {
            Arc::new(Self {
                work,
                calls: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PeriodicTask for SlowTask {
        fn name(&self) -> &str {
            "slow"
        }

        async fn run(&self) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Fails, then panics, then succeeds forever.
    struct FlakyTask {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PeriodicTask for FlakyTask {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn run(&self) -> anyhow::Result<()> {
            match self.calls.fetch_add(1, Ordering::SeqCst) {
                0 => anyhow::bail!("first call fails"),
                1 => panic!("second call panics"),
                _ => Ok(()),
            }
        }
    }

    fn config(interval_secs: u64, grace_secs: u64) -> TriggerConfig {
        TriggerConfig {
            interval: Duration::from_secs(interval_secs),
            shutdown_grace: Duration::from_secs(grace_secs),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_invocation_after_one_interval() {
        let task = SlowTask::new(Duration::from_millis(1));
        let handle = PeriodicTrigger::new(config(60, 5), task.clone()).start(CancellationToken::new());

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(task.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(task.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(task.calls.load(Ordering::SeqCst), 2);

        let stats = handle.stop().await;
        assert_eq!(stats.invocations, 2);
        assert_eq!(stats.skipped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_ticks_are_skipped() {
        // Ticks at 10, 20, 30, 40; each invocation takes 25s.
        // 10: invoke (done 35), 20: skip, 30: skip, 40: invoke (done 65).
        let task = SlowTask::new(Duration::from_secs(25));
        let handle = PeriodicTrigger::new(config(10, 30), task.clone()).start(CancellationToken::new());

        tokio::time::sleep(Duration::from_secs(45)).await;
        let mid = handle.stats();
        assert_eq!(mid.ticks, 4);
        assert_eq!(mid.invocations, 2);
        assert_eq!(mid.skipped, 2);

        let stats = handle.stop().await;
        assert_eq!(stats.invocations, 2);
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.aborted, 0);
        assert_eq!(task.max_running.load(Ordering::SeqCst), 1);
        assert_eq!(task.completed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_the_loop() {
        let task = Arc::new(FlakyTask {
            calls: AtomicUsize::new(0),
        });
        let handle = PeriodicTrigger::new(config(1, 1), task.clone()).start(CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(4_500)).await;
        let stats = handle.stop().await;
        assert_eq!(stats.invocations, 4);
        assert_eq!(stats.failures, 2);
        assert_eq!(task.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_within_grace() {
        let task = SlowTask::new(Duration::from_secs(3));
        let handle = PeriodicTrigger::new(config(10, 5), task.clone()).start(CancellationToken::new());

        tokio::time::sleep(Duration::from_secs(11)).await;
        let stats = handle.stop().await;
        assert_eq!(stats.aborted, 0);
        assert_eq!(task.completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_after_grace() {
        let task = SlowTask::new(Duration::from_secs(100));
        let handle = PeriodicTrigger::new(config(10, 5), task.clone()).start(CancellationToken::new());

        tokio::time::sleep(Duration::from_secs(11)).await;
        let started = Instant::now();
        let stats = handle.stop().await;
        assert_eq!(stats.aborted, 1);
        assert_eq!(task.completed.load(Ordering::SeqCst), 0);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_token_stops_ticking() {
        let task = SlowTask::new(Duration::from_millis(1));
        let token = CancellationToken::new();
        let handle = PeriodicTrigger::new(config(10, 5), task.clone()).start(token.clone());

        tokio::time::sleep(Duration::from_secs(15)).await;
        token.cancel();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(task.calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.stop().await.invocations, 1);
    }
}
