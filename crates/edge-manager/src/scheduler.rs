//! Task dispatch and the worker pool.
//!
//! A dispatcher walks the enabled tasks on every tick and offers the due ones
//! to a bounded queue without blocking; a full queue skips the task until the
//! next tick. A fixed pool of workers drains the queue, one task at a time
//! each.

use crate::config::SchedulerSettings;
use crate::handlers::HandlerRegistry;
use crate::lifecycle::Lifecycle;
use crate::metrics::MetricsRegistry;
use crate::ports::TaskStore;
use crate::schedule;
use crate::types::{ManagedTask, TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use common::{Component, Error, Result};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of one dispatcher pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickSummary {
    /// Due tasks not already queued or running
    pub eligible: usize,
    pub queued: usize,
    /// Dropped because the queue was full
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub workers: usize,
    pub active_workers: usize,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub processed_count: u64,
    pub failed_count: u64,
    pub skipped_count: u64,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// State shared by the dispatcher and the workers.
struct Shared {
    settings: SchedulerSettings,
    tasks: Arc<dyn TaskStore>,
    handlers: HandlerRegistry,
    queue_tx: mpsc::Sender<ManagedTask>,
    queue_rx: tokio::sync::Mutex<mpsc::Receiver<ManagedTask>>,
    /// Queued or executing
    in_flight: Mutex<HashSet<TaskId>>,
    /// Pending manual triggers
    triggers: Mutex<HashSet<TaskId>>,
    active_workers: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    last_run_at: Mutex<Option<DateTime<Utc>>>,
    metrics: Option<Arc<MetricsRegistry>>,
}

pub struct TaskScheduler {
    shared: Arc<Shared>,
    lifecycle: Lifecycle,
}

impl TaskScheduler {
    pub fn new(
        settings: SchedulerSettings,
        tasks: Arc<dyn TaskStore>,
        handlers: HandlerRegistry,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(settings.queue_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                settings,
                tasks,
                handlers,
                queue_tx,
                queue_rx: tokio::sync::Mutex::new(queue_rx),
                in_flight: Mutex::new(HashSet::new()),
                triggers: Mutex::new(HashSet::new()),
                active_workers: AtomicUsize::new(0),
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
                last_run_at: Mutex::new(None),
                metrics,
            }),
            lifecycle: Lifecycle::new(Component::Scheduler),
        }
    }

    /// Run the dispatcher and the worker pool until cancelled.
    ///
    /// Workers finish or abandon their current task before this returns;
    /// tasks still in the queue stay there for the next start.
    pub async fn run(&self, scope: &CancellationToken) -> Result<()> {
        let running = self.lifecycle.begin(scope)?;
        let token = running.token.clone();
        let settings = &self.shared.settings;
        info!(
            workers = settings.workers,
            queue_capacity = settings.queue_capacity,
            interval_ms = settings.interval.as_millis() as u64,
            "Task scheduler started"
        );

        let mut workers = JoinSet::new();
        for worker_id in 0..settings.workers.max(1) {
            workers.spawn(worker(self.shared.clone(), worker_id, token.clone()));
        }

        let mut ticker = interval(settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.shared.schedule_tick().await;
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Scheduler worker ended abnormally");
            }
        }

        info!("Task scheduler stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.lifecycle.stop();
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    /// One dispatcher pass.
    pub async fn schedule_tick(&self) -> TickSummary {
        self.shared.schedule_tick().await
    }

    /// Request a run of `id` on the next tick. Returns false when a trigger
    /// is already pending.
    pub fn trigger(&self, id: TaskId) -> bool {
        let added = self
            .shared
            .triggers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        debug!(task_id = id, added, "Task triggered");
        added
    }

    pub fn pending_triggers(&self) -> Vec<TaskId> {
        let mut ids: Vec<_> = self
            .shared
            .triggers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn status(&self) -> SchedulerStatus {
        let shared = &self.shared;
        SchedulerStatus {
            running: self.is_running(),
            workers: shared.settings.workers,
            active_workers: shared.active_workers.load(Ordering::Relaxed),
            queue_depth: shared.queue_depth(),
            queue_capacity: shared.queue_tx.max_capacity(),
            processed_count: shared.processed.load(Ordering::Relaxed),
            failed_count: shared.failed.load(Ordering::Relaxed),
            skipped_count: shared.skipped.load(Ordering::Relaxed),
            last_run_at: *shared
                .last_run_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }
}

/// A busy worker slot and the in-flight entry of its task. Both are given
/// back on drop, so a worker aborted mid-task does not strand the task.
struct WorkerClaim<'a> {
    shared: &'a Shared,
    id: TaskId,
}

impl<'a> WorkerClaim<'a> {
    fn new(shared: &'a Shared, id: TaskId) -> Self {
        shared.active_workers.fetch_add(1, Ordering::Relaxed);
        Self { shared, id }
    }
}

impl Drop for WorkerClaim<'_> {
    fn drop(&mut self) {
        self.shared.release(self.id);
        self.shared.active_workers.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn worker(shared: Arc<Shared>, worker_id: usize, token: CancellationToken) {
    debug!(worker_id, "Scheduler worker started");
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = shared.next_queued() => next,
        };
        let Some(task) = next else { break };
        shared.execute(task, &token).await;
    }
    debug!(worker_id, "Scheduler worker stopped");
}

impl Shared {
    fn queue_depth(&self) -> usize {
        self.queue_tx.max_capacity() - self.queue_tx.capacity()
    }

    async fn next_queued(&self) -> Option<ManagedTask> {
        self.queue_rx.lock().await.recv().await
    }

    async fn schedule_tick(&self) -> TickSummary {
        let start = Instant::now();
        let now = Utc::now();
        let mut summary = TickSummary::default();
        *self.last_run_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);

        let tasks = match self.tasks.list_enabled().await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Failed to list enabled tasks");
                return summary;
            }
        };

        for task in tasks {
            let id = task.id;
            let triggered = self
                .triggers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&id);

            match schedule::is_due(&task, now, self.settings.continuous_gap, triggered) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(task_id = id, task = %task.name, error = %e, "Task is not schedulable");
                    continue;
                }
            }

            if !self
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id)
            {
                continue;
            }
            summary.eligible += 1;

            match self.queue_tx.try_send(task) {
                Ok(()) => {
                    summary.queued += 1;
                    if triggered {
                        self.triggers
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&id);
                    }
                }
                Err(TrySendError::Full(task)) => {
                    self.release(id);
                    summary.skipped += 1;
                    self.skipped.fetch_add(1, Ordering::Relaxed);
                    if let Some(ref m) = self.metrics {
                        m.record_task_skipped();
                    }
                    warn!(
                        task_id = id,
                        task = %task.name,
                        "Task queue full, skipping until next tick"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    self.release(id);
                    warn!("Task queue closed, ending dispatch pass");
                    break;
                }
            }
        }

        if let Some(ref m) = self.metrics {
            m.set_queue_depth(self.queue_depth());
            m.record_tick("scheduler", start.elapsed());
        }
        if summary.eligible > 0 {
            debug!(
                eligible = summary.eligible,
                queued = summary.queued,
                skipped = summary.skipped,
                "Dispatch pass complete"
            );
        }
        summary
    }

    fn release(&self, id: TaskId) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    async fn execute(&self, task: ManagedTask, token: &CancellationToken) {
        let start = Instant::now();
        let _claim = WorkerClaim::new(self, task.id);
        if let Some(ref m) = self.metrics {
            m.set_queue_depth(self.queue_depth());
        }

        if let Err(e) = self.tasks.update_status(task.id, TaskStatus::Running).await {
            warn!(task_id = task.id, error = %e, "Failed to mark task running");
        }

        let result = tokio::select! {
            result = self.attempt(&task) => result,
            _ = token.cancelled() => Err(Error::task("execute_task", "cancelled during shutdown")),
        };

        let status = match &result {
            Ok(()) => TaskStatus::Completed,
            Err(_) => TaskStatus::Failed,
        };
        if let Err(e) = self.tasks.update_status(task.id, status).await {
            warn!(task_id = task.id, error = %e, "Failed to record task status");
        }
        if let Err(e) = self.tasks.update_last_run(task.id, Utc::now()).await {
            warn!(task_id = task.id, error = %e, "Failed to record task last run");
        }

        let elapsed = start.elapsed();
        match &result {
            Ok(()) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                info!(
                    task_id = task.id,
                    task = %task.name,
                    action = %task.action,
                    duration_ms = elapsed.as_millis() as u64,
                    "Task completed"
                );
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    task_id = task.id,
                    task = %task.name,
                    action = %task.action,
                    error = %e,
                    "Task failed"
                );
            }
        }
        if let Some(ref m) = self.metrics {
            m.record_task(task.action.as_str(), result.is_ok(), elapsed);
        }
    }

    /// Run the action's handler under the retry policy, each attempt bounded
    /// by the task timeout. A panicking handler fails the task only.
    async fn attempt(&self, task: &ManagedTask) -> Result<()> {
        let handler = self.handlers.get(task.action).ok_or_else(|| {
            Error::task(
                "execute_task",
                format!("no handler registered for action {}", task.action),
            )
        })?;
        let limit = self.settings.task_timeout;

        self.settings
            .retry
            .run(task.action.as_str(), |_| {
                let handler = handler.clone();
                async move {
                    let guarded = AssertUnwindSafe(handler.execute(task)).catch_unwind();
                    match timeout(limit, guarded).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(_)) => Err(Error::task(
                            "execute_task",
                            format!("handler for task {} panicked", task.id),
                        )),
                        Err(_) => Err(Error::timeout(Component::Scheduler, "execute_task", limit)),
                    }
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::TaskHandler;
    use crate::memory::MemoryTaskStore;
    use crate::types::{TaskAction, TaskKind};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Succeed;

    #[async_trait]
    impl TaskHandler for Succeed {
        async fn execute(&self, _task: &ManagedTask) -> Result<()> {
            Ok(())
        }
    }

    struct Panics;

    #[async_trait]
    impl TaskHandler for Panics {
        async fn execute(&self, _task: &ManagedTask) -> Result<()> {
            panic!("handler bug");
        }
    }

    /// Never finishes writing a task's final status.
    struct StuckWriteBack {
        inner: Arc<MemoryTaskStore>,
        stuck: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl TaskStore for StuckWriteBack {
        async fn list_enabled(&self) -> Result<Vec<ManagedTask>> {
            self.inner.list_enabled().await
        }

        async fn update_status(&self, id: TaskId, status: TaskStatus) -> Result<()> {
            if status != TaskStatus::Running {
                self.stuck.store(true, Ordering::SeqCst);
                std::future::pending::<()>().await;
            }
            self.inner.update_status(id, status).await
        }

        async fn update_last_run(&self, id: TaskId, at: DateTime<Utc>) -> Result<()> {
            self.inner.update_last_run(id, at).await
        }

        async fn stats(&self) -> Result<crate::types::TaskStats> {
            self.inner.stats().await
        }
    }

    fn scheduler(store: Arc<MemoryTaskStore>, capacity: usize) -> TaskScheduler {
        let mut handlers = HandlerRegistry::new();
        handlers.register(TaskAction::Inference, Arc::new(Succeed));
        handlers.register(TaskAction::ModelUpdate, Arc::new(Panics));
        let settings = SchedulerSettings {
            queue_capacity: capacity,
            ..SchedulerSettings::default()
        };
        TaskScheduler::new(settings, store, handlers, None)
    }

    fn continuous(id: TaskId, action: TaskAction) -> ManagedTask {
        ManagedTask::new(id, format!("task-{}", id), TaskKind::Continuous, action)
    }

    #[tokio::test]
    async fn test_in_flight_tasks_are_not_requeued() {
        let store = Arc::new(MemoryTaskStore::new());
        store.insert(continuous(1, TaskAction::Inference));
        let scheduler = scheduler(store, 10);

        assert_eq!(scheduler.schedule_tick().await.queued, 1);
        let second = scheduler.schedule_tick().await;
        assert_eq!(second, TickSummary::default());
        assert_eq!(scheduler.status().queue_depth, 1);
    }

    #[tokio::test]
    async fn test_trigger_is_consumed_when_queued() {
        let store = Arc::new(MemoryTaskStore::new());
        store.insert(ManagedTask::new(5, "manual", TaskKind::Triggered, TaskAction::Inference));
        let scheduler = scheduler(store, 10);

        assert_eq!(scheduler.schedule_tick().await.queued, 0);
        assert!(scheduler.trigger(5));
        assert!(!scheduler.trigger(5));
        assert_eq!(scheduler.schedule_tick().await.queued, 1);
        assert!(scheduler.pending_triggers().is_empty());
    }

    #[tokio::test]
    async fn test_execute_records_outcome() {
        let store = Arc::new(MemoryTaskStore::new());
        store.insert(continuous(1, TaskAction::Inference));
        store.insert(continuous(2, TaskAction::ModelUpdate));
        store.insert(continuous(3, TaskAction::DataCleanup));
        let scheduler = scheduler(store.clone(), 10);
        let token = CancellationToken::new();

        for task in [1, 2, 3].map(|id| store.get(id).unwrap()) {
            scheduler.shared.execute(task, &token).await;
        }

        assert_eq!(store.get(1).unwrap().status, TaskStatus::Completed);
        assert!(store.get(1).unwrap().last_run.is_some());
        // Panicking and unregistered handlers fail only their own task
        assert_eq!(store.get(2).unwrap().status, TaskStatus::Failed);
        assert_eq!(store.get(3).unwrap().status, TaskStatus::Failed);

        let status = scheduler.status();
        assert_eq!(status.processed_count, 1);
        assert_eq!(status.failed_count, 2);
        assert_eq!(status.active_workers, 0);
    }

    #[tokio::test]
    async fn test_run_drains_queue_and_stops() {
        let store = Arc::new(MemoryTaskStore::new());
        store.insert(continuous(1, TaskAction::Inference));
        let scheduler = Arc::new(scheduler(store.clone(), 10));
        let token = CancellationToken::new();

        let runner = {
            let scheduler = scheduler.clone();
            let token = token.clone();
            tokio::spawn(async move { scheduler.run(&token).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.get(1).unwrap().status != TaskStatus::Completed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(scheduler.is_running());
        token.cancel();
        runner.await.unwrap().unwrap();
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.status().processed_count, 1);
    }

    #[tokio::test]
    async fn test_aborted_worker_releases_its_task() {
        let inner = Arc::new(MemoryTaskStore::new());
        inner.insert(continuous(1, TaskAction::Inference));
        let store = Arc::new(StuckWriteBack {
            inner: inner.clone(),
            stuck: std::sync::atomic::AtomicBool::new(false),
        });

        let mut handlers = HandlerRegistry::new();
        handlers.register(TaskAction::Inference, Arc::new(Succeed));
        let settings = SchedulerSettings {
            interval: Duration::from_millis(10),
            ..SchedulerSettings::default()
        };
        let scheduler = Arc::new(TaskScheduler::new(settings, store.clone(), handlers, None));
        let token = CancellationToken::new();
        let runner = {
            let scheduler = scheduler.clone();
            let token = token.clone();
            tokio::spawn(async move { scheduler.run(&token).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while !store.stuck.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(scheduler.status().active_workers, 1);

        // The worker cannot finish, so shutdown ends in an abort
        token.cancel();
        runner.abort();
        assert!(runner.await.unwrap_err().is_cancelled());

        tokio::time::timeout(Duration::from_secs(5), async {
            while scheduler.status().active_workers != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!scheduler.is_running());

        inner.update_status(1, TaskStatus::Failed).await.unwrap();
        let tick = scheduler.schedule_tick().await;
        assert_eq!(tick.eligible, 1);
        assert_eq!(tick.queued, 1);
    }
}
