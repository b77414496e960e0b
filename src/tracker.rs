//! Tracker runtime: one long-lived task per venue.
//!
//! The task owns the adapter connection, the in-memory tick buffer and the
//! snapshot timer. Lifecycle is
//! `Initialized -> Running -> { Disconnected -> Running | Failed | Stopped }`;
//! a drop schedules a fixed-backoff reconnect up to the attempt cap, after
//! which the tracker parks in `Failed` until an external start. The
//! snapshot timer is created once and survives reconnects.

use crate::adapters::{TickSink, VenueAdapter};
use crate::models::{TrackerState, TrackerStatusRow};
use crate::storage::{ReadStore, WriteStore};
use anyhow::Result;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tracing::{debug, error, info, warn};

const RECONNECT_HISTORY: usize = 10;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Base snapshot cadence. Pull venues snapshot on their poll interval
    /// when that is slower.
    pub snapshot_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 10,
            snapshot_interval: Duration::from_secs(15),
        }
    }
}

#[derive(Debug)]
enum TrackerCommand {
    Start,
    Stop,
}

#[derive(Debug, Default)]
struct SharedStatus {
    state: Option<TrackerState>,
    last_error: Option<String>,
    reconnect_count: i64,
    reconnect_history: VecDeque<i64>,
    last_snapshot_rows: usize,
    last_snapshot_at: Option<i64>,
}

/// In-memory tracker snapshot served by the per-venue debug endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerDebug {
    pub exchange: String,
    pub state: String,
    pub buffered_symbols: usize,
    pub last_message_at: Option<i64>,
    pub last_error: Option<String>,
    pub reconnect_count: i64,
    pub reconnect_history: Vec<i64>,
    pub last_snapshot_rows: usize,
    pub last_snapshot_at: Option<i64>,
    pub snapshot_interval_secs: u64,
}

/// Cloneable handle the API layer uses to inspect and control one tracker.
#[derive(Clone)]
pub struct TrackerHandle {
    venue: &'static str,
    cmd_tx: mpsc::Sender<TrackerCommand>,
    shared: Arc<RwLock<SharedStatus>>,
    sink: TickSink,
    snapshot_interval: Duration,
}

impl TrackerHandle {
    pub fn venue(&self) -> &'static str {
        self.venue
    }

    pub async fn start(&self) -> bool {
        self.cmd_tx.send(TrackerCommand::Start).await.is_ok()
    }

    pub async fn stop(&self) -> bool {
        self.cmd_tx.send(TrackerCommand::Stop).await.is_ok()
    }

    pub fn state(&self) -> TrackerState {
        self.shared
            .read()
            .state
            .unwrap_or(TrackerState::Initialized)
    }

    pub fn status_row(&self, now: i64) -> TrackerStatusRow {
        let shared = self.shared.read();
        TrackerStatusRow {
            exchange: self.venue.to_string(),
            state: shared
                .state
                .unwrap_or(TrackerState::Initialized)
                .as_str()
                .to_string(),
            last_message_at: non_zero(self.sink.last_message_ms()),
            last_error: shared.last_error.clone(),
            reconnect_count: shared.reconnect_count,
            updated_at: now,
        }
    }

    pub fn debug_snapshot(&self) -> TrackerDebug {
        let shared = self.shared.read();
        TrackerDebug {
            exchange: self.venue.to_string(),
            state: shared
                .state
                .unwrap_or(TrackerState::Initialized)
                .as_str()
                .to_string(),
            buffered_symbols: self.sink.len(),
            last_message_at: non_zero(self.sink.last_message_ms()),
            last_error: shared.last_error.clone(),
            reconnect_count: shared.reconnect_count,
            reconnect_history: shared.reconnect_history.iter().copied().collect(),
            last_snapshot_rows: shared.last_snapshot_rows,
            last_snapshot_at: shared.last_snapshot_at,
            snapshot_interval_secs: self.snapshot_interval.as_secs(),
        }
    }
}

fn non_zero(ms: i64) -> Option<i64> {
    if ms > 0 {
        Some(ms)
    } else {
        None
    }
}

pub struct Tracker {
    adapter: Arc<dyn VenueAdapter>,
    write: Arc<WriteStore>,
    read: Arc<ReadStore>,
    config: TrackerConfig,
    snapshot_interval: Duration,
    sink: TickSink,
    shared: Arc<RwLock<SharedStatus>>,
}

impl Tracker {
    /// Spawn the tracker task and return its handle. The tracker starts in
    /// `Initialized` and connects immediately.
    pub fn spawn(
        adapter: Arc<dyn VenueAdapter>,
        write: Arc<WriteStore>,
        read: Arc<ReadStore>,
        config: TrackerConfig,
    ) -> TrackerHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel::<TrackerCommand>(16);
        let sink = TickSink::new();
        let shared = Arc::new(RwLock::new(SharedStatus::default()));

        let snapshot_interval = match adapter.kind() {
            crate::adapters::AdapterKind::Subscription => config.snapshot_interval,
            crate::adapters::AdapterKind::Pull { poll_interval } => {
                poll_interval.max(config.snapshot_interval)
            }
        };

        let handle = TrackerHandle {
            venue: adapter.venue(),
            cmd_tx,
            shared: shared.clone(),
            sink: sink.clone(),
            snapshot_interval,
        };

        let tracker = Tracker {
            adapter,
            write,
            read,
            config,
            snapshot_interval,
            sink,
            shared,
        };
        tokio::spawn(async move {
            tracker.run(cmd_rx).await;
        });

        handle
    }

    async fn run(self, mut cmd_rx: mpsc::Receiver<TrackerCommand>) {
        let venue = self.adapter.venue();
        self.set_state(TrackerState::Initialized, None);

        let mut snapshot_tick = interval(self.snapshot_interval);
        snapshot_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut adapter_task: Option<JoinHandle<Result<()>>> = Some(self.spawn_adapter());
        let mut attempts: u32 = 0;
        self.set_state(TrackerState::Running, None);
        info!(venue, "tracker started");

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(TrackerCommand::Stop) => {
                            if let Some(task) = adapter_task.take() {
                                task.abort();
                            }
                            // Final in-flight ticks still land in one last
                            // snapshot before the tracker parks.
                            self.snapshot();
                            self.set_state(TrackerState::Stopped, None);
                            info!(venue, "tracker stopped");
                        }
                        Some(TrackerCommand::Start) => {
                            if adapter_task.is_none() {
                                attempts = 0;
                                adapter_task = Some(self.spawn_adapter());
                                self.set_state(TrackerState::Running, None);
                                info!(venue, "tracker restarted");
                            }
                        }
                        None => {
                            if let Some(task) = adapter_task.take() {
                                task.abort();
                            }
                            self.set_state(TrackerState::Stopped, None);
                            return;
                        }
                    }
                }
                _ = snapshot_tick.tick() => {
                    self.snapshot();
                }
                result = wait_adapter(&mut adapter_task) => {
                    adapter_task = None;
                    let reason = match result {
                        Ok(()) => "stream ended".to_string(),
                        Err(e) => e.to_string(),
                    };

                    attempts += 1;
                    self.record_reconnect();

                    if attempts > self.config.max_reconnect_attempts {
                        error!(venue, attempts, "reconnect attempts exhausted");
                        self.set_state(TrackerState::Failed, Some(reason));
                        continue;
                    }

                    warn!(venue, attempts, reason, "venue link lost; reconnecting");
                    self.set_state(TrackerState::Disconnected, Some(reason));
                    sleep(self.config.reconnect_delay).await;
                    adapter_task = Some(self.spawn_adapter());
                    self.set_state(TrackerState::Running, None);
                }
            }
        }
    }

    fn spawn_adapter(&self) -> JoinHandle<Result<()>> {
        let adapter = self.adapter.clone();
        let sink = self.sink.clone();
        tokio::spawn(async move { adapter.run(sink).await })
    }

    /// Drain the buffer and batch-insert. An empty buffer is a normal
    /// no-op; an insert failure marks the tracker `error` and drops the
    /// batch, because fresher observations supersede it anyway.
    fn snapshot(&self) {
        let ticks = self.sink.drain();
        let now = chrono::Utc::now().timestamp();

        if ticks.is_empty() {
            self.persist_status(now);
            return;
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut batch = Vec::with_capacity(ticks.len());
        for mut tick in ticks {
            tick.stamp(now_ms);
            batch.push(tick);
        }

        match self.write.insert_ticks(&batch) {
            Ok(n) => {
                let mut shared = self.shared.write();
                shared.last_snapshot_rows = n;
                shared.last_snapshot_at = Some(now);
                if shared.state == Some(TrackerState::Error) {
                    shared.state = Some(TrackerState::Running);
                    shared.last_error = None;
                }
                drop(shared);
                debug!(venue = self.adapter.venue(), rows = n, "snapshot flushed");
            }
            Err(e) => {
                warn!(venue = self.adapter.venue(), error = %e, "snapshot insert failed");
                let mut shared = self.shared.write();
                shared.state = Some(TrackerState::Error);
                shared.last_error = Some(e.to_string());
            }
        }

        self.persist_status(now);
    }

    fn set_state(&self, state: TrackerState, error: Option<String>) {
        {
            let mut shared = self.shared.write();
            shared.state = Some(state);
            if error.is_some() {
                shared.last_error = error;
            } else if state == TrackerState::Running {
                shared.last_error = None;
            }
        }
        self.persist_status(chrono::Utc::now().timestamp());
    }

    fn record_reconnect(&self) {
        let mut shared = self.shared.write();
        shared.reconnect_count += 1;
        shared
            .reconnect_history
            .push_back(chrono::Utc::now().timestamp());
        while shared.reconnect_history.len() > RECONNECT_HISTORY {
            shared.reconnect_history.pop_front();
        }
    }

    fn persist_status(&self, now: i64) {
        let row = {
            let shared = self.shared.read();
            TrackerStatusRow {
                exchange: self.adapter.venue().to_string(),
                state: shared
                    .state
                    .unwrap_or(TrackerState::Initialized)
                    .as_str()
                    .to_string(),
                last_message_at: non_zero(self.sink.last_message_ms()),
                last_error: shared.last_error.clone(),
                reconnect_count: shared.reconnect_count,
                updated_at: now,
            }
        };
        if let Err(e) = self.read.upsert_tracker_status(&row) {
            warn!(venue = self.adapter.venue(), error = %e, "failed to persist tracker status");
        }
    }
}

async fn wait_adapter(task: &mut Option<JoinHandle<Result<()>>>) -> Result<()> {
    match task.as_mut() {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("adapter task panicked: {e}")),
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::AdapterKind;
    use crate::models::RawTick;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Emits two ticks for the same symbol, then parks until aborted.
    struct ScriptedAdapter {
        runs: AtomicU32,
    }

    #[async_trait]
    impl VenueAdapter for ScriptedAdapter {
        fn venue(&self) -> &'static str {
            "scripted"
        }

        fn kind(&self) -> AdapterKind {
            AdapterKind::Subscription
        }

        async fn run(&self, sink: TickSink) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);

            let mut first = RawTick::new("scripted", "BTCUSDT");
            first.mark_price = "100".into();
            first.funding_rate = "0.0001".into();
            first.stamp(1000);
            sink.emit(first);

            let mut second = RawTick::new("scripted", "BTCUSDT");
            second.mark_price = "101".into();
            second.funding_rate = "0.00015".into();
            second.stamp(1500);
            sink.emit(second);

            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn fast_config() -> TrackerConfig {
        TrackerConfig {
            snapshot_interval: Duration::from_millis(50),
            ..TrackerConfig::default()
        }
    }

    fn stores() -> (tempfile::TempDir, Arc<WriteStore>, Arc<ReadStore>) {
        let dir = tempfile::tempdir().unwrap();
        let write = Arc::new(
            WriteStore::open(dir.path().join("w.db").to_str().unwrap()).unwrap(),
        );
        let read = Arc::new(
            ReadStore::open(dir.path().join("r.db").to_str().unwrap()).unwrap(),
        );
        (dir, write, read)
    }

    #[tokio::test]
    async fn snapshot_applies_last_write_wins() {
        let (_dir, write, read) = stores();
        let adapter = Arc::new(ScriptedAdapter {
            runs: AtomicU32::new(0),
        });
        let handle = Tracker::spawn(adapter, write.clone(), read.clone(), fast_config());

        tokio::time::sleep(Duration::from_millis(200)).await;

        // Both ticks collapsed into one row with the fresher values.
        let ticks = write.query_ticks(Some("scripted"), None, 0, i64::MAX, 100).unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].mark_price, "101");
        assert_eq!(ticks[0].funding_rate, "0.00015");
        assert_eq!(ticks[0].created_at, ticks[0].recorded_at / 1000);

        assert_eq!(handle.state(), TrackerState::Running);
        let status = read.all_tracker_status().unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].state, "running");
    }

    #[tokio::test]
    async fn stop_parks_tracker_and_persists_state() {
        let (_dir, write, read) = stores();
        let adapter = Arc::new(ScriptedAdapter {
            runs: AtomicU32::new(0),
        });
        let handle = Tracker::spawn(adapter, write, read.clone(), fast_config());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(handle.stop().await);
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(handle.state(), TrackerState::Stopped);
        let status = read.all_tracker_status().unwrap();
        assert_eq!(status[0].state, "stopped");

        // Start is accepted again after a stop.
        assert!(handle.start().await);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(handle.state(), TrackerState::Running);
    }

    #[tokio::test]
    async fn adapter_failure_schedules_reconnect() {
        struct FailingAdapter;

        #[async_trait]
        impl VenueAdapter for FailingAdapter {
            fn venue(&self) -> &'static str {
                "failing"
            }
            fn kind(&self) -> AdapterKind {
                AdapterKind::Subscription
            }
            async fn run(&self, _sink: TickSink) -> Result<()> {
                Err(anyhow::anyhow!("connection refused"))
            }
        }

        let (_dir, write, read) = stores();
        let handle = Tracker::spawn(
            Arc::new(FailingAdapter),
            write,
            read,
            TrackerConfig {
                reconnect_delay: Duration::from_millis(10),
                max_reconnect_attempts: 2,
                snapshot_interval: Duration::from_millis(50),
            },
        );

        tokio::time::sleep(Duration::from_millis(300)).await;

        // Two retries then failed, waiting for an external start.
        assert_eq!(handle.state(), TrackerState::Failed);
        let debug = handle.debug_snapshot();
        assert_eq!(debug.reconnect_count, 3);
        assert!(debug.last_error.is_some());
    }
}
