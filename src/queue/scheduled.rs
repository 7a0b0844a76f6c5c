//! Single-flight scheduled drain.
//!
//! Runs a queue's drain once at start, then on a fixed interval and on
//! every offline-to-online transition. A firing is a no-op while offline,
//! while the job is not ready, or while a previous pass is still running.
//! Passes are never cancelled once started.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::remote::ConnectivityMonitor;

/// Tally of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Entries left for a later pass without being attempted in full.
    pub skipped: usize,
    pub failed_ids: Vec<String>,
}

impl DrainReport {
    pub fn record_success(&mut self) {
        self.attempted += 1;
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self, id: impl Into<String>) {
        self.attempted += 1;
        self.failed += 1;
        self.failed_ids.push(id.into());
    }

    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
    AlreadyRunning,
    NotReady,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Skipped(SkipReason),
    Completed(DrainReport),
}

impl PassOutcome {
    pub fn report(&self) -> Option<&DrainReport> {
        match self {
            PassOutcome::Completed(report) => Some(report),
            PassOutcome::Skipped(_) => None,
        }
    }
}

/// One queue's "attempt everything pending now" routine.
#[async_trait]
pub trait DrainJob: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Extra precondition checked before every pass, such as authentication.
    fn is_ready(&self) -> bool {
        true
    }

    /// Attempt every pending entry, one at a time. Must not fail as a whole:
    /// per-entry failures are recorded in the report.
    async fn drain(&self) -> DrainReport;
}

pub struct ScheduledDrain<J> {
    job: Arc<J>,
    connectivity: Arc<ConnectivityMonitor>,
    interval: Duration,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<J: DrainJob> ScheduledDrain<J> {
    pub fn new(
        job: Arc<J>,
        connectivity: Arc<ConnectivityMonitor>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            job,
            connectivity,
            interval,
            running: AtomicBool::new(false),
        })
    }

    pub fn job(&self) -> &Arc<J> {
        &self.job
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one pass now, unless a guard declines it.
    pub async fn run_pass(&self) -> PassOutcome {
        let queue = self.job.name();
        if !self.connectivity.is_online() {
            debug!(queue, "offline, skipping drain pass");
            return PassOutcome::Skipped(SkipReason::Offline);
        }
        if !self.job.is_ready() {
            debug!(queue, "not ready, skipping drain pass");
            return PassOutcome::Skipped(SkipReason::NotReady);
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(queue, "previous pass still running, skipping");
            return PassOutcome::Skipped(SkipReason::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);

        let report = self.job.drain().await;
        info!(
            queue,
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "drain pass finished"
        );
        PassOutcome::Completed(report)
    }

    /// Start firing: immediately, every interval, and on reconnect.
    pub fn start(self: &Arc<Self>) -> ScheduleHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(this.interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut connectivity = this.connectivity.subscribe();
            let mut was_online = connectivity.borrow_and_update().is_online();
            loop {
                tokio::select! {
                    _ = ticks.tick() => this.fire(),
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = connectivity.borrow_and_update().is_online();
                        if online && !was_online {
                            this.fire();
                        }
                        was_online = online;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!(queue = this.job.name(), "drain schedule stopped");
        });
        ScheduleHandle { shutdown, task }
    }

    /// Each pass runs on its own task so a slow pass never delays the
    /// schedule; the running flag turns overlapping firings into no-ops.
    fn fire(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_pass().await;
        });
    }
}

#[derive(Debug)]
pub struct ScheduleHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ScheduleHandle {
    /// Stop scheduling new passes. A pass already running finishes on its own.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await
            && e.is_panic()
        {
            error!("drain schedule panicked");
        }
    }
}
