use crate::telemetry::collector::Collector;
use crate::telemetry::parser::{self, ParseInput};
use crate::telemetry::store::Persister;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    Idle,
    Running,
    Stopped,
}

/// How a single tick ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Stored { id: i64 },
    CollectionFailed,
    Rejected,
    PersistFailed,
    /// The tick panicked; caught at the join boundary.
    Aborted,
}

impl TickOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored { .. })
    }
}

impl fmt::Display for TickOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stored { id } => write!(f, "stored as row {id}"),
            Self::CollectionFailed => f.write_str("collection failed"),
            Self::Rejected => f.write_str("record rejected"),
            Self::PersistFailed => f.write_str("persist failed"),
            Self::Aborted => f.write_str("aborted"),
        }
    }
}

/// Counters reported when a run stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: u64,
    pub stored: u64,
    pub failed: u64,
}

impl RunSummary {
    fn record(&mut self, outcome: TickOutcome) {
        self.ticks += 1;
        if outcome.is_stored() {
            self.stored += 1;
        } else {
            self.failed += 1;
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler cannot start from state {0:?}")]
    AlreadyStarted(ScheduleState),
}

/// Collector, parser and persister wired together for one tick.
pub struct Pipeline {
    collector: Collector,
    persister: Persister,
}

impl Pipeline {
    pub fn new(collector: Collector, persister: Persister) -> Self {
        Self {
            collector,
            persister,
        }
    }

    /// Collect, parse and persist one sample. Blocking; never panics on a
    /// stage failure, every failure is logged and reported in the outcome.
    pub fn run_tick(&mut self) -> TickOutcome {
        let sample = match self.collector.collect() {
            Ok(sample) => sample,
            Err(e) => {
                tracing::error!(error = %e, "metrics collection failed, skipping tick");
                return TickOutcome::CollectionFailed;
            }
        };

        let Ok(record) = parser::parse(ParseInput::Raw(sample)) else {
            tracing::warn!("no logs to insert");
            return TickOutcome::Rejected;
        };

        match self.persister.persist(&record) {
            Ok(id) => {
                tracing::info!(id, timestamp = %record.collected_at, "inserted system log");
                TickOutcome::Stored { id }
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    backend = self.persister.backend(),
                    "failed to insert system log"
                );
                TickOutcome::PersistFailed
            }
        }
    }
}

/// Drives the pipeline on a fixed interval until cancelled.
///
/// Ticks run one at a time on the blocking pool. A tick that overruns the
/// interval delays the next one rather than overlapping it, and
/// cancellation is only observed between ticks.
pub struct Scheduler {
    pipeline: Arc<Mutex<Pipeline>>,
    period: Duration,
    state: watch::Sender<ScheduleState>,
}

impl Scheduler {
    pub fn new(pipeline: Pipeline, period: Duration) -> Self {
        let (state, _) = watch::channel(ScheduleState::Idle);
        Self {
            pipeline: Arc::new(Mutex::new(pipeline)),
            period,
            state,
        }
    }

    pub fn state(&self) -> ScheduleState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ScheduleState> {
        self.state.subscribe()
    }

    /// Run a single tick to completion.
    pub async fn tick(&self) -> TickOutcome {
        let pipeline = Arc::clone(&self.pipeline);
        match tokio::task::spawn_blocking(move || pipeline.lock().run_tick()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "tick aborted");
                TickOutcome::Aborted
            }
        }
    }

    /// Arm the timer and tick until `shutdown` is cancelled.
    ///
    /// The first tick fires one period after the call.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<RunSummary, SchedulerError> {
        let armed = self.state.send_if_modified(|state| {
            if *state == ScheduleState::Idle {
                *state = ScheduleState::Running;
                true
            } else {
                false
            }
        });
        if !armed {
            return Err(SchedulerError::AlreadyStarted(self.state()));
        }

        tracing::info!(
            interval_secs = self.period.as_secs_f64(),
            "scheduler started, press Ctrl+C to exit"
        );
        let mut timer = tokio::time::interval_at(Instant::now() + self.period, self.period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut summary = RunSummary::default();
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            let outcome = self.tick().await;
            tracing::debug!(%outcome, "tick finished");
            summary.record(outcome);
        }

        self.state.send_replace(ScheduleState::Stopped);
        tracing::info!(
            ticks = summary.ticks,
            stored = summary.stored,
            failed = summary.failed,
            "scheduler stopped"
        );
        Ok(summary)
    }

    /// Release the pipeline, and with it the store connection, on the
    /// blocking pool.
    pub async fn close(self) {
        let pipeline = self.pipeline;
        if let Err(e) = tokio::task::spawn_blocking(move || drop(pipeline)).await {
            tracing::warn!(error = %e, "closing pipeline failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::collector::tests::ScriptedSource;
    use crate::telemetry::collector::{CollectionError, MetricsSource, UsageSnapshot};
    use crate::telemetry::parser::CanonicalRecord;
    use crate::telemetry::store::tests::{sqlite_url, stored_rows, RecordingStore};
    use crate::telemetry::store::{PersistError, RecordStore};
    use chrono::DateTime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Notify;

    fn failing_source() -> Box<dyn MetricsSource> {
        Box::new(ScriptedSource::new([]))
    }

    fn recording_pipeline(
        source: Box<dyn MetricsSource>,
        fail_writes: bool,
    ) -> (Pipeline, Arc<AtomicUsize>) {
        let (store, inserts) = RecordingStore::new(fail_writes);
        let persister = Persister::with_store(Box::new(store)).unwrap();
        (Pipeline::new(Collector::new(source), persister), inserts)
    }

    fn sqlite_pipeline(tmp: &TempDir, source: Box<dyn MetricsSource>) -> Pipeline {
        Pipeline::new(
            Collector::new(source),
            Persister::open(&sqlite_url(tmp)).unwrap(),
        )
    }

    #[test]
    fn tick_persists_collected_sample() {
        let tmp = TempDir::new().unwrap();
        let mut pipeline = sqlite_pipeline(
            &tmp,
            Box::new(ScriptedSource::steady(25.0, 50.0, 75.0, 1)),
        );

        assert_eq!(pipeline.run_tick(), TickOutcome::Stored { id: 1 });
        drop(pipeline);

        let rows = stored_rows(&tmp);
        assert_eq!(rows.len(), 1);
        assert_eq!((rows[0].2, rows[0].3, rows[0].4), (25.0, 50.0, 75.0));
    }

    #[test]
    fn collection_failure_skips_parse_and_persist() {
        let (mut pipeline, inserts) = recording_pipeline(failing_source(), false);
        assert_eq!(pipeline.run_tick(), TickOutcome::CollectionFailed);
        assert_eq!(inserts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unparseable_sample_is_rejected_before_the_store() {
        let (store, inserts) = RecordingStore::new(false);
        let mut pipeline = Pipeline::new(
            Collector::with_clock(
                Box::new(ScriptedSource::steady(1.0, 2.0, 3.0, 2)),
                Box::new(|| "not a timestamp".to_string()),
            ),
            Persister::with_store(Box::new(store)).unwrap(),
        );
        assert_eq!(pipeline.run_tick(), TickOutcome::Rejected);
        assert_eq!(pipeline.run_tick(), TickOutcome::Rejected);
        assert_eq!(inserts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_ticks_count_as_failures() {
        let (store, inserts) = RecordingStore::new(false);
        let pipeline = Pipeline::new(
            Collector::with_clock(
                Box::new(ScriptedSource::steady(1.0, 2.0, 3.0, 1000)),
                Box::new(|| "2024-13-45T99:99:99".to_string()),
            ),
            Persister::with_store(Box::new(store)).unwrap(),
        );
        let scheduler = Arc::new(Scheduler::new(pipeline, Duration::from_millis(20)));
        let token = CancellationToken::new();

        let runner = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            let token = token.clone();
            async move { scheduler.start(token).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        let summary = runner.await.unwrap().unwrap();
        assert!(summary.ticks >= 1, "{summary:?}");
        assert_eq!(summary.failed, summary.ticks);
        assert_eq!(inserts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn persist_failure_does_not_poison_later_ticks() {
        let (mut pipeline, inserts) =
            recording_pipeline(Box::new(ScriptedSource::steady(1.0, 2.0, 3.0, 2)), true);
        assert_eq!(pipeline.run_tick(), TickOutcome::PersistFailed);
        assert_eq!(pipeline.run_tick(), TickOutcome::PersistFailed);
        assert_eq!(inserts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn consecutive_ticks_keep_their_own_timestamps() {
        let tmp = TempDir::new().unwrap();
        let mut pipeline = sqlite_pipeline(
            &tmp,
            Box::new(ScriptedSource::steady(10.0, 20.0, 30.0, 2)),
        );
        assert!(pipeline.run_tick().is_stored());
        std::thread::sleep(Duration::from_millis(20));
        assert!(pipeline.run_tick().is_stored());
        drop(pipeline);

        let rows = stored_rows(&tmp);
        assert_eq!(rows.len(), 2);
        let first = DateTime::parse_from_rfc3339(&rows[0].1).unwrap();
        let second = DateTime::parse_from_rfc3339(&rows[1].1).unwrap();
        assert!(second - first >= chrono::Duration::milliseconds(20));
    }

    #[tokio::test]
    async fn scheduled_ticks_through_blocking_pool() {
        let tmp = TempDir::new().unwrap();
        let scheduler = Scheduler::new(
            sqlite_pipeline(&tmp, Box::new(ScriptedSource::steady(1.0, 2.0, 3.0, 2))),
            Duration::from_secs(30),
        );
        assert_eq!(scheduler.tick().await, TickOutcome::Stored { id: 1 });
        assert_eq!(scheduler.tick().await, TickOutcome::Stored { id: 2 });
        scheduler.close().await;

        let rows = stored_rows(&tmp);
        assert_eq!(rows.len(), 2);
        assert_ne!(rows[0].1, rows[1].1);
    }

    #[tokio::test]
    async fn failed_collection_keeps_scheduler_running() {
        let (pipeline, inserts) = recording_pipeline(failing_source(), false);
        let scheduler = Arc::new(Scheduler::new(pipeline, Duration::from_millis(20)));
        let mut state = scheduler.subscribe();
        let token = CancellationToken::new();

        let runner = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            let token = token.clone();
            async move { scheduler.start(token).await }
        });

        state.wait_for(|s| *s == ScheduleState::Running).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(scheduler.state(), ScheduleState::Running);

        token.cancel();
        let summary = runner.await.unwrap().unwrap();
        assert!(summary.ticks >= 2, "{summary:?}");
        assert_eq!(summary.stored, 0);
        assert_eq!(summary.failed, summary.ticks);
        assert_eq!(inserts.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.state(), ScheduleState::Stopped);
    }

    #[tokio::test]
    async fn failed_writes_do_not_stop_the_schedule() {
        let (pipeline, inserts) =
            recording_pipeline(Box::new(ScriptedSource::steady(1.0, 1.0, 1.0, 1000)), true);
        let scheduler = Arc::new(Scheduler::new(pipeline, Duration::from_millis(20)));
        let token = CancellationToken::new();

        let runner = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            let token = token.clone();
            async move { scheduler.start(token).await }
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        token.cancel();

        let summary = runner.await.unwrap().unwrap();
        assert!(summary.ticks >= 2, "{summary:?}");
        assert_eq!(summary.failed, summary.ticks);
        assert_eq!(inserts.load(Ordering::SeqCst) as u64, summary.ticks);
    }

    #[tokio::test]
    async fn start_is_one_shot() {
        let (pipeline, _) = recording_pipeline(failing_source(), false);
        let scheduler = Scheduler::new(pipeline, Duration::from_secs(3600));
        assert_eq!(scheduler.state(), ScheduleState::Idle);

        let token = CancellationToken::new();
        token.cancel();
        let summary = scheduler.start(token.clone()).await.unwrap();
        // Cancelled before the first period elapsed: nothing ran.
        assert_eq!(summary, RunSummary::default());
        assert_eq!(scheduler.state(), ScheduleState::Stopped);

        assert!(matches!(
            scheduler.start(token).await,
            Err(SchedulerError::AlreadyStarted(ScheduleState::Stopped))
        ));
    }

    struct PanicOnce {
        panicked: bool,
    }

    impl MetricsSource for PanicOnce {
        fn snapshot(&mut self) -> Result<UsageSnapshot, CollectionError> {
            if !self.panicked {
                self.panicked = true;
                panic!("sensor driver exploded");
            }
            Ok(UsageSnapshot {
                cpu_percent: 1.0,
                memory_percent: 1.0,
                disk_percent: 1.0,
            })
        }
    }

    #[tokio::test]
    async fn panicking_tick_is_contained() {
        let (pipeline, inserts) =
            recording_pipeline(Box::new(PanicOnce { panicked: false }), false);
        let scheduler = Scheduler::new(pipeline, Duration::from_secs(30));
        assert_eq!(scheduler.tick().await, TickOutcome::Aborted);
        assert_eq!(scheduler.tick().await, TickOutcome::Stored { id: 1 });
        assert_eq!(inserts.load(Ordering::SeqCst), 1);
    }

    /// Store whose writes take a while, announcing when one begins.
    struct SlowStore {
        started: Arc<Notify>,
        completed: Arc<AtomicUsize>,
    }

    impl RecordStore for SlowStore {
        fn ensure_schema(&mut self) -> Result<(), PersistError> {
            Ok(())
        }

        fn insert(&mut self, _record: &CanonicalRecord) -> Result<i64, PersistError> {
            self.started.notify_one();
            std::thread::sleep(Duration::from_millis(200));
            let n = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(n as i64)
        }

        fn backend(&self) -> &'static str {
            "slow"
        }
    }

    #[tokio::test]
    async fn shutdown_lets_in_flight_tick_finish() {
        let started = Arc::new(Notify::new());
        let completed = Arc::new(AtomicUsize::new(0));
        let store = SlowStore {
            started: Arc::clone(&started),
            completed: Arc::clone(&completed),
        };
        let pipeline = Pipeline::new(
            Collector::new(Box::new(ScriptedSource::steady(1.0, 1.0, 1.0, 100))),
            Persister::with_store(Box::new(store)).unwrap(),
        );
        let scheduler = Arc::new(Scheduler::new(pipeline, Duration::from_millis(10)));
        let token = CancellationToken::new();

        let runner = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            let token = token.clone();
            async move { scheduler.start(token).await }
        });

        started.notified().await;
        token.cancel();
        let summary = runner.await.unwrap().unwrap();

        assert_eq!(summary.ticks, 1);
        assert_eq!(summary.stored, 1);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }
}
