use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use {
    async_trait::async_trait,
    futures::FutureExt,
    rand::Rng,
    tokio::{sync::Notify, task::JoinHandle},
    tracing::{debug, info, warn},
};

use ferry_config::schema::{OverflowPolicy, UsageRecordConfig};

/// One usage-recording task. Tasks are plain data so workers never touch
/// any request context.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub request_id: String,
    pub user_id: String,
    pub api_key_id: String,
    pub account_id: String,
    pub model: String,
    pub transport: &'static str,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub upstream_ms: u64,
    pub first_token_ms: Option<u64>,
}

/// Sink for usage records. Durability is the recorder's problem (and so is
/// idempotence); the pool guarantees exactly one execution per submission.
#[async_trait]
pub trait UsageRecorder: Send + Sync {
    async fn record(&self, record: &UsageRecord) -> anyhow::Result<()>;
}

/// Default recorder: a structured log line.
pub struct LogRecorder;

#[async_trait]
impl UsageRecorder for LogRecorder {
    async fn record(&self, record: &UsageRecord) -> anyhow::Result<()> {
        info!(
            component = "usage",
            request_id = %record.request_id,
            user_id = %record.user_id,
            api_key_id = %record.api_key_id,
            account_id = %record.account_id,
            model = %record.model,
            transport = record.transport,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            upstream_ms = record.upstream_ms,
            time_to_first_token_ms = record.first_token_ms,
            "usage recorded"
        );
        Ok(())
    }
}

/// How a submission was absorbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    AcceptedAsync,
    AcceptedSampledDrop,
    Dropped,
}

struct Inner {
    queue: Mutex<VecDeque<UsageRecord>>,
    queued: Notify,
    recorder: Arc<dyn UsageRecorder>,
    cfg: UsageRecordConfig,
    shutting_down: AtomicBool,
}

impl Inner {
    /// Run one task under the pool timeout with panic recovery. Request
    /// handling must never be destabilized by a recorder.
    async fn execute(&self, record: UsageRecord) {
        let timeout = self.cfg.task_timeout();
        let fut = std::panic::AssertUnwindSafe(self.recorder.record(&record)).catch_unwind();
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(Ok(()))) => {},
            Ok(Ok(Err(err))) => {
                warn!(request_id = %record.request_id, error = %err, "usage record failed");
            },
            Ok(Err(_panic)) => {
                warn!(request_id = %record.request_id, "usage recorder panicked");
            },
            Err(_) => {
                warn!(request_id = %record.request_id, "usage record timed out");
            },
        }
    }

    fn pop(&self) -> Option<UsageRecord> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

/// Bounded worker pool absorbing post-request usage-recording tasks.
///
/// A full queue never blocks a request: the submission is handed back to
/// the caller, who runs it synchronously under the same timeout. After
/// [`UsageRecordPool::shutdown`], every submission behaves that way.
pub struct UsageRecordPool {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl UsageRecordPool {
    #[must_use]
    pub fn new(cfg: UsageRecordConfig, recorder: Arc<dyn UsageRecorder>) -> Self {
        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::with_capacity(cfg.queue_size)),
            queued: Notify::new(),
            recorder,
            cfg,
            shutting_down: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(inner.cfg.worker_count);
        for worker_id in 0..inner.cfg.worker_count {
            let inner = Arc::clone(&inner);
            workers.push(tokio::spawn(async move {
                loop {
                    if let Some(record) = inner.pop() {
                        inner.execute(record).await;
                        continue;
                    }
                    if inner.shutting_down.load(Ordering::Acquire) {
                        debug!(worker_id, "usage worker draining done");
                        return;
                    }
                    inner.queued.notified().await;
                }
            }));
        }

        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// Submit a task. Returns the mode and, when the pool could not take
    /// it asynchronously, the task the caller must run synchronously:
    /// the submitted one (`Dropped`) or a displaced queued one
    /// (`AcceptedSampledDrop`).
    pub fn submit(&self, record: UsageRecord) -> (SubmitMode, Option<UsageRecord>) {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return (SubmitMode::Dropped, Some(record));
        }

        let mut queue = self
            .inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if queue.len() < self.inner.cfg.queue_size {
            queue.push_back(record);
            drop(queue);
            self.inner.queued.notify_one();
            return (SubmitMode::AcceptedAsync, None);
        }

        match self.inner.cfg.overflow_policy {
            OverflowPolicy::Drop => {
                drop(queue);
                (SubmitMode::Dropped, Some(record))
            },
            OverflowPolicy::SampleDrop => {
                // A zero-length queue has nothing to displace.
                if queue.is_empty() {
                    drop(queue);
                    return (SubmitMode::Dropped, Some(record));
                }
                // Displace a random queued task; the submitter runs the
                // victim synchronously so it is still executed exactly once.
                let victim_idx = rand::rng().random_range(0..queue.len());
                let victim = queue.remove(victim_idx);
                queue.push_back(record);
                drop(queue);
                self.inner.queued.notify_one();
                (SubmitMode::AcceptedSampledDrop, victim)
            },
        }
    }

    /// Run one task synchronously, under the pool timeout with panic
    /// recovery. This is the fallback path for `Dropped` and the victim
    /// of `AcceptedSampledDrop`.
    pub async fn run_sync(&self, record: UsageRecord) {
        self.inner.execute(record).await;
    }

    /// Submit, falling back to synchronous execution when needed. Exactly
    /// one task is executed per call, async or sync, never both.
    pub async fn submit_or_run(&self, record: UsageRecord) -> SubmitMode {
        let (mode, fallback) = self.submit(record);
        if let Some(task) = fallback {
            self.run_sync(task).await;
        }
        mode
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drain the queue and stop workers. In-flight tasks finish; new
    /// submissions fall back to synchronous execution.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        self.inner.queued.notify_waiters();
        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            guard.drain(..).collect()
        };
        for worker in workers {
            if worker.await.is_err() {
                warn!("usage worker ended abnormally");
            }
        }
        // Anything still queued (e.g. zero-worker pools) is executed here
        // so no submission is lost.
        while let Some(record) = self.inner.pop() {
            self.inner.execute(record).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    struct CountingRecorder {
        executed: AtomicUsize,
    }

    #[async_trait]
    impl UsageRecorder for CountingRecorder {
        async fn record(&self, _record: &UsageRecord) -> anyhow::Result<()> {
            self.executed.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }
    }

    struct PanickingRecorder;

    #[async_trait]
    impl UsageRecorder for PanickingRecorder {
        async fn record(&self, _record: &UsageRecord) -> anyhow::Result<()> {
            panic!("recorder exploded");
        }
    }

    fn record(id: &str) -> UsageRecord {
        UsageRecord {
            request_id: id.into(),
            user_id: "u1".into(),
            api_key_id: "k1".into(),
            account_id: "a1".into(),
            model: "gpt-4.1".into(),
            transport: "http",
            input_tokens: Some(10),
            output_tokens: Some(20),
            upstream_ms: 120,
            first_token_ms: Some(80),
        }
    }

    fn cfg(workers: usize, queue: usize, policy: OverflowPolicy) -> UsageRecordConfig {
        UsageRecordConfig {
            worker_count: workers,
            queue_size: queue,
            task_timeout_seconds: 1,
            overflow_policy: policy,
        }
    }

    #[tokio::test]
    async fn async_submission_is_executed_by_a_worker() {
        let recorder = Arc::new(CountingRecorder {
            executed: AtomicUsize::new(0),
        });
        let pool = UsageRecordPool::new(cfg(1, 8, OverflowPolicy::Drop), recorder.clone());

        let mode = pool.submit_or_run(record("r1")).await;
        assert_eq!(mode, SubmitMode::AcceptedAsync);

        // The worker picks it up shortly.
        for _ in 0..100 {
            if recorder.executed.load(Ordering::Acquire) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(recorder.executed.load(Ordering::Acquire), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn overflow_with_drop_policy_runs_synchronously() {
        let recorder = Arc::new(CountingRecorder {
            executed: AtomicUsize::new(0),
        });
        // No workers: the queue fills and stays full.
        let pool = UsageRecordPool::new(cfg(0, 1, OverflowPolicy::Drop), recorder.clone());

        assert_eq!(pool.submit_or_run(record("r1")).await, SubmitMode::AcceptedAsync);
        for i in 0..50 {
            let mode = pool.submit_or_run(record(&format!("r{i}"))).await;
            assert_eq!(mode, SubmitMode::Dropped);
        }
        // Every overflow submission was executed synchronously; the queued
        // one is still pending.
        assert_eq!(recorder.executed.load(Ordering::Acquire), 50);
        assert_eq!(pool.queue_len(), 1);
        pool.shutdown().await;
        // Shutdown drained the remaining queued task.
        assert_eq!(recorder.executed.load(Ordering::Acquire), 51);
    }

    #[tokio::test]
    async fn overflow_with_sample_drop_displaces_a_queued_task() {
        let recorder = Arc::new(CountingRecorder {
            executed: AtomicUsize::new(0),
        });
        let pool = UsageRecordPool::new(cfg(0, 1, OverflowPolicy::SampleDrop), recorder.clone());

        assert_eq!(pool.submit_or_run(record("old")).await, SubmitMode::AcceptedAsync);
        let mode = pool.submit_or_run(record("new")).await;
        assert_eq!(mode, SubmitMode::AcceptedSampledDrop);

        // The displaced task ran synchronously; the new task is queued.
        assert_eq!(recorder.executed.load(Ordering::Acquire), 1);
        assert_eq!(pool.queue_len(), 1);
        pool.shutdown().await;
        assert_eq!(recorder.executed.load(Ordering::Acquire), 2);
    }

    #[tokio::test]
    async fn recorder_panic_is_contained() {
        let pool = UsageRecordPool::new(cfg(0, 1, OverflowPolicy::Drop), Arc::new(PanickingRecorder));
        // Does not propagate the panic.
        pool.run_sync(record("r1")).await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_makes_submissions_synchronous() {
        let recorder = Arc::new(CountingRecorder {
            executed: AtomicUsize::new(0),
        });
        let pool = UsageRecordPool::new(cfg(1, 8, OverflowPolicy::Drop), recorder.clone());
        pool.shutdown().await;

        let mode = pool.submit_or_run(record("r1")).await;
        assert_eq!(mode, SubmitMode::Dropped);
        assert_eq!(recorder.executed.load(Ordering::Acquire), 1);
    }
}
