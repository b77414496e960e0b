//! Periodic-job driver for aggregation, materialization, analytics and
//! store maintenance.
//!
//! One task per job. Jobs never overlap themselves: the interval uses
//! skip-on-miss, so a run that overshoots its period simply loses the next
//! tick instead of stacking.

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, warn};

pub struct Scheduler {
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    /// Register a job that runs every `period`, starting one period from
    /// now. Errors are logged and the cadence keeps going; the next
    /// invocation is the retry.
    pub fn spawn_job<F, Fut>(&mut self, name: &'static str, period: Duration, mut job: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        let handle = tokio::spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first interval tick completes immediately; consume it so
            // the job waits a full period before its first run.
            tick.tick().await;

            loop {
                tick.tick().await;
                let started = Instant::now();

                if let Err(e) = job().await {
                    warn!(job = name, error = %e, "job failed; next run retries");
                }

                let elapsed = started.elapsed();
                if elapsed > period {
                    warn!(job = name, ?elapsed, ?period, "job overran; skipping next tick");
                } else {
                    debug!(job = name, ?elapsed, "job complete");
                }
            }
        });
        self.handles.push(handle);
    }

    pub fn job_count(&self) -> usize {
        self.handles.len()
    }

    pub fn abort_all(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn jobs_fire_on_cadence() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut scheduler = Scheduler::new();

        let c = counter.clone();
        scheduler.spawn_job("count", Duration::from_millis(20), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(110)).await;
        scheduler.abort_all();

        let runs = counter.load(Ordering::SeqCst);
        assert!((3..=6).contains(&runs), "unexpected run count {runs}");
    }

    #[tokio::test]
    async fn overrunning_job_never_overlaps_itself() {
        let in_flight = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));
        let mut scheduler = Scheduler::new();

        let inf = in_flight.clone();
        let max = max_seen.clone();
        scheduler.spawn_job("slow", Duration::from_millis(10), move || {
            let inf = inf.clone();
            let max = max.clone();
            async move {
                let now = inf.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(35)).await;
                inf.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.abort_all();

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_job_keeps_running() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut scheduler = Scheduler::new();

        let c = counter.clone();
        scheduler.spawn_job("flaky", Duration::from_millis(15), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("synthetic failure")
            }
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        scheduler.abort_all();

        assert!(counter.load(Ordering::SeqCst) >= 2);
    }
}
