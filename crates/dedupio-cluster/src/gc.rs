//! Garbage collection entry point and its cron trigger

use crate::directory::ClusterDirectory;
use crate::error::{ClusterError, ClusterResult};
use crate::gc_lock::GcCoordinationLock;
use crate::removal::{ChunkRemovalBroadcast, RemovalRequest};
use crate::transport::RequestOptions;
use chrono::{DateTime, Utc};
use cron::Schedule;
use dedupio_common::{EventHandle, EventKind, EventOutcome, ProgressEvent};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Which chunks a sweep may remove
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SweepPolicy {
    /// Chunks referenced within this window are kept
    pub min_age: Duration,
    /// Bypass the soft-delete grace period
    pub force: bool,
}

impl Default for SweepPolicy {
    fn default() -> Self {
        Self {
            min_age: Duration::from_secs(6 * 60 * 60),
            force: false,
        }
    }
}

/// Runs sweeps under the exclusive GC lock
pub struct GarbageCollector {
    lock: GcCoordinationLock,
    directory: Arc<dyn ClusterDirectory>,
    policy: SweepPolicy,
    options: RequestOptions,
}

impl GarbageCollector {
    pub fn new(
        lock: GcCoordinationLock,
        directory: Arc<dyn ClusterDirectory>,
        policy: SweepPolicy,
    ) -> Self {
        Self {
            lock,
            directory,
            policy,
            options: RequestOptions::default(),
        }
    }

    /// Response policy used for the removal broadcast
    #[must_use]
    pub const fn with_request_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    /// One sweep. Only the coordinator broadcasts; other members return a
    /// warning event without touching any store.
    pub async fn run_sweep(&self) -> ClusterResult<ProgressEvent> {
        let _guard = self.lock.acquire_exclusive().await;

        let min_age = i64::try_from(self.policy.min_age.as_millis()).unwrap_or(i64::MAX);
        let older_than = Utc::now().timestamp_millis().saturating_sub(min_age);
        let event = EventHandle::new(
            EventKind::Gc,
            format!("remove chunks older than {older_than}"),
        );

        if !self.directory.is_coordinator() {
            info!("Not the coordinator, skipping chunk removal");
            event.end(EventOutcome::warning("skipped: not the coordinator"));
            return Ok(event.snapshot());
        }

        info!(
            "Starting chunk removal (older_than={}, force={})",
            older_than, self.policy.force
        );
        let broadcast =
            ChunkRemovalBroadcast::new(self.directory.dispatcher()).with_options(self.options);
        let request = RemovalRequest::new(older_than, self.policy.force, event.clone());

        match broadcast.run(&request).await {
            Ok(removed) => {
                event.add_actions(removed);
                event.end(EventOutcome::success(format!("removed {removed} chunks")));
                Ok(event.snapshot())
            }
            Err(e) => {
                event.end(EventOutcome::error("chunk removal failed", &e));
                Err(e)
            }
        }
    }
}

/// Cron trigger for [`GarbageCollector::run_sweep`]
pub struct GcScheduler {
    schedule: Schedule,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl GcScheduler {
    /// Parse a six-field cron expression (seconds first) and start firing
    pub fn start(expression: &str, gc: Arc<GarbageCollector>) -> ClusterResult<Self> {
        let schedule = Schedule::from_str(expression)
            .map_err(|e| ClusterError::Schedule(format!("'{expression}': {e}")))?;
        if let Some(first) = schedule.upcoming(Utc).next() {
            info!("GC scheduled with '{}', first run at {}", expression, first);
        } else {
            warn!("GC schedule '{}' never fires", expression);
        }

        let (stop, mut stopped) = watch::channel(false);
        let task_schedule = schedule.clone();
        let task = tokio::spawn(async move {
            loop {
                let Some(next) = task_schedule.upcoming(Utc).next() else {
                    break;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    () = tokio::time::sleep(wait) => {}
                    _ = stopped.changed() => break,
                }

                match gc.run_sweep().await {
                    Ok(event) => info!(
                        "Scheduled GC finished: {} chunks removed",
                        event.action_count
                    ),
                    Err(e) => error!("Scheduled GC failed: {}", e),
                }
            }
            info!("GC schedule stopped");
        });

        Ok(Self {
            schedule,
            stop,
            task: Some(task),
        })
    }

    /// Next fire time
    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.schedule.upcoming(Utc).next()
    }

    /// Unschedule. A sweep already running completes.
    pub fn stop(&mut self) {
        let _ = self.stop.send(true);
        self.task = None;
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for GcScheduler {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}
