//! Background refresh of cached keys.
//!
//! At most one task per key exists at a time, and at most
//! `max_concurrent_updates` tasks hold a worker permit. A schedule call that
//! finds its key busy or no permit free is dropped; the next read re-checks.
//! Task failures stay here: they are retried, counted and logged, never
//! returned to the request that triggered them.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use lru::LruCache;
use metrics::{counter, gauge};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::clock::Clock;
use super::config::CacheConfig;
use super::entry::CacheEntry;
use super::error::FetchError;
use super::lock::mutex_lock;
use super::store::StorePriority;
use super::strategy::CacheStrategy;
use super::writer::{CacheWriter, CommitOutcome, WriteTarget};

const SOURCE: &str = "cache::scheduler";
const METRIC_SCHEDULED_TOTAL: &str = "tickvault_refresh_scheduled_total";
const METRIC_DROPPED_TOTAL: &str = "tickvault_refresh_dropped_total";
const METRIC_OUTCOME_TOTAL: &str = "tickvault_refresh_outcome_total";
const METRIC_RUNNING: &str = "tickvault_refresh_running";

/// Re-fetches a value off the request path.
pub type RefreshFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, FetchError>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Bookkeeping for one refresh. Dropped once the task is terminal.
#[derive(Debug, Clone)]
pub struct BackgroundTask {
    pub task_id: Uuid,
    pub cache_key: String,
    pub strategy: CacheStrategy,
    pub priority: StorePriority,
    pub created_at: OffsetDateTime,
    pub scheduled_at: OffsetDateTime,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: TaskStatus,
    pub last_error: Option<String>,
}

pub struct RefreshRequest {
    pub storage_key: String,
    pub strategy: CacheStrategy,
    pub market: Option<String>,
    pub priority: StorePriority,
    pub fetch: RefreshFn,
    /// The cached entry being refreshed, for change detection.
    pub previous: Option<CacheEntry>,
}

impl fmt::Debug for RefreshRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshRequest")
            .field("storage_key", &self.storage_key)
            .field("strategy", &self.strategy)
            .field("market", &self.market)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled(Uuid),
    /// A task for the key is already pending or running.
    Duplicate,
    /// Every worker permit is taken.
    Saturated,
    ShuttingDown,
}

impl ScheduleOutcome {
    pub fn is_scheduled(&self) -> bool {
        matches!(self, Self::Scheduled(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub scheduled: u64,
    pub dropped_duplicate: u64,
    pub dropped_saturated: u64,
    pub dropped_shutdown: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Every task finished inside the drain window.
    pub drained: bool,
    /// Tasks still running when the window closed.
    pub abandoned: usize,
}

#[derive(Default)]
struct Counters {
    scheduled: AtomicU64,
    dropped_duplicate: AtomicU64,
    dropped_saturated: AtomicU64,
    dropped_shutdown: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            dropped_duplicate: self.dropped_duplicate.load(Ordering::Relaxed),
            dropped_saturated: self.dropped_saturated.load(Ordering::Relaxed),
            dropped_shutdown: self.dropped_shutdown.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }
}

pub struct BackgroundRefreshScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    writer: Arc<CacheWriter>,
    clock: Arc<dyn Clock>,
    tasks: DashMap<String, BackgroundTask>,
    permits: Arc<Semaphore>,
    last_scheduled: Mutex<LruCache<String, OffsetDateTime>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    accepting: AtomicBool,
    max_retries: u32,
    fetch_timeout: Duration,
    skip_unchanged_writes: bool,
    counters: Counters,
}

impl BackgroundRefreshScheduler {
    pub fn new(config: &CacheConfig, writer: Arc<CacheWriter>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                writer,
                clock,
                tasks: DashMap::new(),
                permits: Arc::new(Semaphore::new(config.max_concurrent_updates.max(1))),
                last_scheduled: Mutex::new(LruCache::new(config.history_capacity_non_zero())),
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
                accepting: AtomicBool::new(true),
                max_retries: config.max_retries.max(1),
                fetch_timeout: config.fetch_timeout(),
                skip_unchanged_writes: config.skip_unchanged_writes,
                counters: Counters::default(),
            }),
        }
    }

    /// Start a refresh for `request.storage_key` unless one is already in
    /// flight, every permit is taken, or the scheduler is shutting down.
    /// Never waits.
    pub fn schedule(&self, request: RefreshRequest) -> ScheduleOutcome {
        let inner = &self.inner;
        if !inner.accepting.load(Ordering::Acquire) {
            inner.dropped("shutdown", &inner.counters.dropped_shutdown, &request.storage_key);
            return ScheduleOutcome::ShuttingDown;
        }

        let vacant = match inner.tasks.entry(request.storage_key.clone()) {
            Entry::Occupied(_) => {
                inner.dropped("duplicate", &inner.counters.dropped_duplicate, &request.storage_key);
                return ScheduleOutcome::Duplicate;
            }
            Entry::Vacant(vacant) => vacant,
        };

        let permit = match Arc::clone(&inner.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                drop(vacant);
                inner.dropped("saturated", &inner.counters.dropped_saturated, &request.storage_key);
                return ScheduleOutcome::Saturated;
            }
        };

        let now = inner.clock.now();
        let task_id = Uuid::new_v4();
        vacant.insert(BackgroundTask {
            task_id,
            cache_key: request.storage_key.clone(),
            strategy: request.strategy,
            priority: request.priority,
            created_at: now,
            scheduled_at: now,
            retry_count: 0,
            max_retries: inner.max_retries,
            status: TaskStatus::Pending,
            last_error: None,
        });
        mutex_lock(&inner.last_scheduled, SOURCE, "schedule").put(request.storage_key.clone(), now);

        inner.counters.scheduled.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_SCHEDULED_TOTAL).increment(1);
        debug!(key = %request.storage_key, %task_id, "Scheduled background refresh");

        inner
            .tracker
            .spawn(run_task(Arc::clone(inner), task_id, request, permit));
        ScheduleOutcome::Scheduled(task_id)
    }

    /// When a refresh for `key` was last scheduled, if still remembered.
    pub fn last_scheduled(&self, key: &str) -> Option<OffsetDateTime> {
        mutex_lock(&self.inner.last_scheduled, SOURCE, "last_scheduled")
            .peek(key)
            .copied()
    }

    pub fn is_scheduled(&self, key: &str) -> bool {
        self.inner.tasks.contains_key(key)
    }

    pub fn task(&self, key: &str) -> Option<BackgroundTask> {
        self.inner.tasks.get(key).map(|task| task.value().clone())
    }

    /// Tasks currently in `Running`.
    pub fn running_count(&self) -> usize {
        self.inner
            .tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Running)
            .count()
    }

    /// Tasks that are pending or running.
    pub fn in_flight(&self) -> usize {
        self.inner.tasks.len()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.counters.snapshot()
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    /// Stop accepting work, then wait up to `timeout` for in-flight tasks.
    /// Whatever is left is cancelled at its next suspension point.
    #[instrument(skip(self))]
    pub async fn drain_and_shutdown(&self, timeout: Duration) -> DrainReport {
        let inner = &self.inner;
        inner.accepting.store(false, Ordering::Release);
        inner.tracker.close();

        let drained = tokio::time::timeout(timeout, inner.tracker.wait())
            .await
            .is_ok();
        let abandoned = if drained { 0 } else { inner.tasks.len() };
        if !drained {
            inner.cancel.cancel();
            warn!(abandoned, ?timeout, "Refresh drain window closed with tasks still running");
        } else {
            info!("Background refresh scheduler drained");
        }

        DrainReport { drained, abandoned }
    }
}

impl Inner {
    fn dropped(&self, reason: &'static str, counter: &AtomicU64, key: &str) {
        counter.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_DROPPED_TOTAL, "reason" => reason).increment(1);
        debug!(key, reason, "Dropped background refresh");
    }

    fn update_task(&self, key: &str, task_id: Uuid, update: impl FnOnce(&mut BackgroundTask)) {
        if let Some(mut task) = self.tasks.get_mut(key) {
            if task.task_id == task_id {
                update(&mut task);
            }
        }
    }
}

/// Frees the worker permit and removes the task entry once the worker
/// ends, however it ends. The permit goes first so a caller that sees the
/// key gone can schedule again.
struct TaskGuard {
    inner: Arc<Inner>,
    key: String,
    task_id: Uuid,
    permit: Option<OwnedSemaphorePermit>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        drop(self.permit.take());
        let task_id = self.task_id;
        self.inner
            .tasks
            .remove_if(&self.key, |_, task| task.task_id == task_id);
        gauge!(METRIC_RUNNING).decrement(1.0);
    }
}

enum Attempt {
    Fetched(Value),
    Failed(String),
    Cancelled,
}

#[instrument(level = "debug", skip(inner, request, permit), fields(key = %request.storage_key))]
async fn run_task(
    inner: Arc<Inner>,
    task_id: Uuid,
    request: RefreshRequest,
    permit: OwnedSemaphorePermit,
) {
    let key = request.storage_key.as_str();
    gauge!(METRIC_RUNNING).increment(1.0);
    let _guard = TaskGuard {
        inner: Arc::clone(&inner),
        key: key.to_owned(),
        task_id,
        permit: Some(permit),
    };
    inner.update_task(key, task_id, |task| task.status = TaskStatus::Running);

    loop {
        let attempt = tokio::select! {
            _ = inner.cancel.cancelled() => Attempt::Cancelled,
            result = tokio::time::timeout(inner.fetch_timeout, (request.fetch)()) => match result {
                Ok(Ok(value)) => Attempt::Fetched(value),
                Ok(Err(err)) => Attempt::Failed(err.to_string()),
                Err(_) => Attempt::Failed(format!("fetch timed out after {:?}", inner.fetch_timeout)),
            },
        };

        match attempt {
            Attempt::Fetched(value) => {
                finish_with_value(&inner, task_id, &request, &value).await;
                return;
            }
            Attempt::Cancelled => {
                mark_failed(&inner, key, task_id, "abandoned at shutdown".to_string());
                return;
            }
            Attempt::Failed(reason) => {
                let mut retry_count = 0;
                inner.update_task(key, task_id, |task| {
                    task.retry_count += 1;
                    task.last_error = Some(reason.clone());
                    retry_count = task.retry_count;
                });

                if retry_count < inner.max_retries {
                    inner.counters.retried.fetch_add(1, Ordering::Relaxed);
                    counter!(METRIC_OUTCOME_TOTAL, "outcome" => "retried").increment(1);
                    debug!(key, retry_count, error = %reason, "Retrying background refresh");
                    inner.update_task(key, task_id, |task| {
                        task.scheduled_at = inner.clock.now();
                    });
                    continue;
                }

                mark_failed(&inner, key, task_id, reason);
                return;
            }
        }
    }
}

async fn finish_with_value(inner: &Inner, task_id: Uuid, request: &RefreshRequest, value: &Value) {
    let key = request.storage_key.as_str();
    let target = WriteTarget {
        storage_key: key,
        strategy: request.strategy,
        market: request.market.as_deref(),
        priority: request.priority,
    };

    match inner
        .writer
        .commit(
            &target,
            value,
            request.previous.as_ref(),
            inner.skip_unchanged_writes,
        )
        .await
    {
        Ok(outcome) => {
            inner.update_task(key, task_id, |task| task.status = TaskStatus::Completed);
            inner.counters.completed.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_OUTCOME_TOTAL, "outcome" => "completed").increment(1);
            debug!(
                key,
                ttl = outcome.ttl(),
                unchanged = matches!(outcome, CommitOutcome::Unchanged { .. }),
                warm = outcome.write().warm,
                "Background refresh completed"
            );
        }
        Err(err) => mark_failed(inner, key, task_id, format!("refreshed value not storable: {err}")),
    }
}

fn mark_failed(inner: &Inner, key: &str, task_id: Uuid, reason: String) {
    warn!(key, error = %reason, "Background refresh failed");
    inner.update_task(key, task_id, |task| {
        task.status = TaskStatus::Failed;
        task.last_error = Some(reason);
    });
    inner.counters.failed.fetch_add(1, Ordering::Relaxed);
    counter!(METRIC_OUTCOME_TOTAL, "outcome" => "failed").increment(1);
}
