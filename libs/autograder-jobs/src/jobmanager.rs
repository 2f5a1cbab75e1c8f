/// Job Manager - Bounded-Concurrency Work Engine
///
/// **Core Responsibility:**
/// Run one work function over a list of work items with at most `pool_size`
/// invocations in flight, and report per-item results.
///
/// **Run Lifecycle:**
/// 1. Validate configuration (nothing happens if this fails)
/// 2. Acquire the job lock key, if any (serializes jobs sharing the key)
/// 3. Ask the retrieval hook for already-known results (cache short-circuit)
/// 4. Dispatch the rest across a fixed pool of workers
/// 5. Either wait for every item, or return the cached subset immediately and
///    let the batch finish in the background
///
/// **Error Semantics:**
/// - Setup failures (validation, lock cancellation, retrieval) are terminal
///   and returned as `Err(JobError)`
/// - A failing or panicking work item lands in `work_errors`; its siblings
///   keep running
///
/// Every submitted item ends up in exactly one of `result_items`,
/// `remaining_items` (no-wait mode) or `work_errors`.

use crate::lockmanager::{KeyedLockGuard, LockManager};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type WorkFn<K, V> =
    Arc<dyn Fn(K, CancellationToken) -> BoxFuture<'static, anyhow::Result<V>> + Send + Sync>;
pub type RetrieveFn<K, V> =
    Arc<dyn Fn(Vec<K>) -> BoxFuture<'static, anyhow::Result<HashMap<K, V>>> + Send + Sync>;
pub type WorkItemKeyFn<K> = Arc<dyn Fn(&K) -> String + Send + Sync>;

/// Terminal job failure. The whole run was aborted.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job configuration: {0}")]
    Configuration(String),

    #[error("job was cancelled while waiting for lock '{0}'")]
    Cancelled(String),

    #[error("failed to retrieve known results: {0:#}")]
    Retrieve(anyhow::Error),

    #[error("background job did not finish: {0}")]
    Background(String),
}

/// Failure of a single work item. Does not abort the batch.
#[derive(Debug)]
pub struct WorkError<K> {
    pub item: K,
    pub key: String,
    pub error: anyhow::Error,
    pub elapsed: Duration,
}

/// Caller-facing knobs shared by every job type
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Block until every item is resolved.
    ///
    /// Even when false, `run` still waits for a busy job lock key before it
    /// returns, since the cache lookup and the remaining items are computed
    /// under it. That wait gives up when `cancel` fires.
    pub wait_for_completion: bool,
    /// Cancellation source of the caller (usually request scoped)
    pub cancel: CancellationToken,
    /// Keep the caller's cancellation even when not waiting.
    /// By default a non-waiting job is handed a detached token so the batch
    /// survives the request that started it.
    pub retain_original_context: bool,
}

impl JobOptions {
    pub fn waiting() -> Self {
        Self {
            wait_for_completion: true,
            ..Default::default()
        }
    }

    /// Token the job actually runs under
    pub fn effective_cancel(&self) -> CancellationToken {
        if self.wait_for_completion || self.retain_original_context {
            self.cancel.clone()
        } else {
            CancellationToken::new()
        }
    }
}

/// Result of running a job
#[derive(Debug)]
pub struct JobOutput<K, V> {
    pub result_items: HashMap<K, V>,
    /// Items dispatched but not yet resolved (no-wait mode only)
    pub remaining_items: Vec<K>,
    pub work_errors: Vec<WorkError<K>>,
    /// Handle to the detached batch in no-wait mode. Dropping it does not stop the batch.
    pub background: Option<BackgroundJob<K, V>>,
}

impl<K, V> JobOutput<K, V> {
    fn empty() -> Self {
        Self {
            result_items: HashMap::new(),
            remaining_items: Vec::new(),
            work_errors: Vec::new(),
            background: None,
        }
    }
}

/// Batch still running after a non-waiting `run` returned
#[derive(Debug)]
pub struct BackgroundJob<K, V> {
    handle: JoinHandle<JobOutput<K, V>>,
    cancel: CancellationToken,
}

impl<K, V> BackgroundJob<K, V> {
    /// Wait for the batch and collect what it produced
    pub async fn wait(self) -> Result<JobOutput<K, V>, JobError> {
        self.handle
            .await
            .map_err(|e| JobError::Background(e.to_string()))
    }

    /// Signal the work functions to stop early
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// A generic unit of scheduled work over items `K` producing values `V`
pub struct Job<K, V> {
    pub options: JobOptions,
    pub lock_key: Option<String>,
    pub pool_size: usize,
    pub work_items: Vec<K>,
    work_fn: Option<WorkFn<K, V>>,
    retrieve_fn: Option<RetrieveFn<K, V>>,
    work_item_key_fn: Option<WorkItemKeyFn<K>>,
    locks: Arc<LockManager>,
}

impl<K, V> Job<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Send + 'static,
{
    pub fn new(locks: Arc<LockManager>, work_items: Vec<K>) -> Self {
        Self {
            options: JobOptions::default(),
            lock_key: None,
            pool_size: 1,
            work_items,
            work_fn: None,
            retrieve_fn: None,
            work_item_key_fn: None,
            locks,
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_lock_key(mut self, lock_key: impl Into<String>) -> Self {
        self.lock_key = Some(lock_key.into());
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// The work function receives the job's effective cancellation token
    pub fn with_work_fn<F, Fut>(mut self, work_fn: F) -> Self
    where
        F: Fn(K, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        self.work_fn = Some(Arc::new(move |item: K, cancel: CancellationToken| {
            work_fn(item, cancel).boxed()
        }));
        self
    }

    /// Called once with the full item list; returned items skip the work function
    pub fn with_retrieve_fn<F, Fut>(mut self, retrieve_fn: F) -> Self
    where
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<HashMap<K, V>>> + Send + 'static,
    {
        self.retrieve_fn = Some(Arc::new(move |items: Vec<K>| retrieve_fn(items).boxed()));
        self
    }

    /// Per-item key. Items sharing a key are serialized (never coalesced).
    pub fn with_work_item_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&K) -> String + Send + Sync + 'static,
    {
        self.work_item_key_fn = Some(Arc::new(key_fn));
        self
    }

    pub fn validate(&self) -> Result<(), JobError> {
        if self.pool_size < 1 {
            return Err(JobError::Configuration(format!(
                "pool size must be at least 1, got {}",
                self.pool_size
            )));
        }

        if self.work_fn.is_none() {
            return Err(JobError::Configuration("no work function set".to_string()));
        }

        if let Some(key) = &self.lock_key {
            if key.is_empty() {
                return Err(JobError::Configuration("lock key is set but empty".to_string()));
            }
        }

        Ok(())
    }

    pub async fn run(self) -> Result<JobOutput<K, V>, JobError> {
        self.validate()?;

        let Job {
            options,
            lock_key,
            pool_size,
            work_items,
            work_fn,
            retrieve_fn,
            work_item_key_fn,
            locks,
        } = self;

        let work_fn = work_fn.ok_or_else(|| JobError::Configuration("no work function set".to_string()))?;
        let cancel = options.effective_cancel();
        let start = Instant::now();

        // Waiting for the lock happens in the caller's task, so the caller's
        // token governs it. A detached job still takes a free lock right away.
        let job_guard = match &lock_key {
            Some(key) => {
                let free = if options.wait_for_completion {
                    None
                } else {
                    locks.try_lock(key)
                };
                let guard = match free {
                    Some(guard) => Some(guard),
                    None => locks.lock_cancellable(key, &options.cancel).await,
                };
                Some(guard.ok_or_else(|| JobError::Cancelled(key.clone()))?)
            }
            None => None,
        };

        let mut output = JobOutput::empty();

        if let Some(retrieve_fn) = &retrieve_fn {
            let known = retrieve_fn(work_items.clone())
                .await
                .map_err(JobError::Retrieve)?;

            let requested: HashSet<&K> = work_items.iter().collect();
            output.result_items = known
                .into_iter()
                .filter(|(item, _)| requested.contains(item))
                .collect();
        }

        let mut seen = HashSet::new();
        let todo: Vec<K> = work_items
            .into_iter()
            .filter(|item| !output.result_items.contains_key(item) && seen.insert(item.clone()))
            .collect();

        info!(
            lock_key = lock_key.as_deref().unwrap_or(""),
            pool_size = pool_size,
            cached = output.result_items.len(),
            todo = todo.len(),
            wait = options.wait_for_completion,
            "Starting job"
        );

        let pool = Arc::new(WorkerPool {
            pool_size,
            work_fn,
            work_item_key_fn,
            locks,
            cancel: cancel.clone(),
        });

        if options.wait_for_completion {
            let batch = pool.run(todo).await;
            drop(job_guard);

            output.result_items.extend(batch.results);
            output.work_errors = batch.errors;

            info!(
                results = output.result_items.len(),
                work_errors = output.work_errors.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Job completed"
            );

            return Ok(output);
        }

        if todo.is_empty() {
            return Ok(output);
        }

        output.remaining_items = todo.clone();

        let handle = tokio::spawn(async move {
            // Held until the whole background batch is done
            let _job_guard: Option<KeyedLockGuard> = job_guard;

            let batch = pool.run(todo).await;

            info!(
                results = batch.results.len(),
                work_errors = batch.errors.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Background job completed"
            );

            JobOutput {
                result_items: batch.results,
                remaining_items: Vec::new(),
                work_errors: batch.errors,
                background: None,
            }
        });

        output.background = Some(BackgroundJob { handle, cancel });

        Ok(output)
    }
}

struct Batch<K, V> {
    results: HashMap<K, V>,
    errors: Vec<WorkError<K>>,
}

impl<K: Eq + Hash, V> Batch<K, V> {
    fn new() -> Self {
        Self {
            results: HashMap::new(),
            errors: Vec::new(),
        }
    }

    fn merge(&mut self, other: Batch<K, V>) {
        self.results.extend(other.results);
        self.errors.extend(other.errors);
    }
}

struct WorkerPool<K, V> {
    pool_size: usize,
    work_fn: WorkFn<K, V>,
    work_item_key_fn: Option<WorkItemKeyFn<K>>,
    locks: Arc<LockManager>,
    cancel: CancellationToken,
}

impl<K, V> WorkerPool<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Send + 'static,
{
    async fn run(self: Arc<Self>, items: Vec<K>) -> Batch<K, V> {
        let mut batch = Batch::new();
        if items.is_empty() {
            return batch;
        }

        let worker_count = self.pool_size.min(items.len());
        let queue = Arc::new(Mutex::new(VecDeque::from(items)));

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            let pool = self.clone();
            let queue = queue.clone();
            workers.spawn(async move { pool.worker_loop(worker_id, queue).await });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(part) => batch.merge(part),
                Err(e) => error!(error = %e, "Job worker task failed"),
            }
        }

        batch
    }

    async fn worker_loop(&self, worker_id: usize, queue: Arc<Mutex<VecDeque<K>>>) -> Batch<K, V> {
        let mut batch = Batch::new();

        loop {
            let next = queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();

            let Some(item) = next else {
                break;
            };

            let start = Instant::now();

            let key = match &self.work_item_key_fn {
                Some(key_fn) => match panic::catch_unwind(AssertUnwindSafe(|| key_fn(&item))) {
                    Ok(key) => key,
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        let key = format!("{:?}", item);
                        error!(worker = worker_id, key = %key, panic = %message, "Work item key function panicked");
                        batch.errors.push(WorkError {
                            item,
                            key,
                            error: anyhow::anyhow!("work item key function panicked: {}", message),
                            elapsed: start.elapsed(),
                        });
                        continue;
                    }
                },
                None => format!("{:?}", item),
            };

            let _item_guard = match &self.work_item_key_fn {
                Some(_) => match self.locks.lock_cancellable(&key, &self.cancel).await {
                    Some(guard) => Some(guard),
                    None => {
                        batch.errors.push(WorkError {
                            item,
                            key,
                            error: anyhow::anyhow!("job cancelled before the item could start"),
                            elapsed: start.elapsed(),
                        });
                        continue;
                    }
                },
                None => None,
            };

            if self.cancel.is_cancelled() {
                batch.errors.push(WorkError {
                    item,
                    key,
                    error: anyhow::anyhow!("job cancelled before the item could start"),
                    elapsed: start.elapsed(),
                });
                continue;
            }

            // The closure itself may panic before handing back a future
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| {
                (self.work_fn)(item.clone(), self.cancel.clone())
            })) {
                Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
                Err(panic) => Err(panic),
            };
            let elapsed = start.elapsed();

            match outcome {
                Ok(Ok(value)) => {
                    debug!(
                        worker = worker_id,
                        key = %key,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Work item completed"
                    );
                    batch.results.insert(item, value);
                }
                Ok(Err(e)) => {
                    warn!(
                        worker = worker_id,
                        key = %key,
                        elapsed_ms = elapsed.as_millis() as u64,
                        error = %e,
                        "Work item failed"
                    );
                    batch.errors.push(WorkError {
                        item,
                        key,
                        error: e,
                        elapsed,
                    });
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(worker = worker_id, key = %key, panic = %message, "Work item panicked");
                    batch.errors.push(WorkError {
                        item,
                        key,
                        error: anyhow::anyhow!("work function panicked: {}", message),
                        elapsed,
                    });
                }
            }
        }

        batch
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
