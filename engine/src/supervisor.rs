// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Admission rejection: the request queue is full. Nothing was mutated;
    /// the caller should back off.
    #[error("maximum request queue size exceeded")]
    QueueFull,

    /// Another caller is mid-restart. Retried internally, never surfaced to
    /// the original caller.
    #[error("process already restarting")]
    AlreadyRestarting,

    /// The caller's context was cancelled before the operation finished.
    #[error("operation canceled before completion")]
    Canceled,

    #[error("start process: {0}")]
    Launch(#[source] anyhow::Error),

    #[error("stop process: {0}")]
    Shutdown(#[source] anyhow::Error),

    #[error("restart process: {0}")]
    Restart(#[source] Box<SupervisorError>),

    /// A supervised operation died on its background task.
    #[error("supervised operation panicked: {0}")]
    Panicked(String),

    /// The task's own failure. Transparent: some engines embed diagnostics
    /// in their error text and downstream mapping needs it verbatim.
    #[error(transparent)]
    Task(anyhow::Error),
}

/// An external, long-lived worker engine operated by the supervisor.
///
/// The supervisor never probes `healthy` before the first `start` nor while
/// a restart is in flight, so implementations may assume an already-started,
/// non-restarting instance.
#[async_trait]
pub trait ManagedProcess: Send + Sync {
    /// Bring the external engine up.
    async fn start(&self) -> anyhow::Result<()>;

    /// Bring it down.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Cheap liveness probe.
    async fn healthy(&self) -> bool;
}

/// Mediates all concurrent access to a single [`ManagedProcess`]: admission
/// control, single-flight mutual exclusion, lazy startup, health-triggered
/// and usage-triggered restarts, plus lock-free counters for observability.
///
/// Cloning is cheap and hands out another handle onto the same supervised
/// instance.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    process: Arc<dyn ManagedProcess>,
    max_requests: i64,
    max_queue_size: i64,
    lock: Semaphore,
    started: AtomicBool,
    restarting: AtomicBool,
    req_counter: AtomicI64,
    queue_size: AtomicI64,
    restarts: AtomicI64,
}

impl ProcessSupervisor {
    /// `max_requests` recycles the process after that many handled requests;
    /// `max_queue_size` bounds the number of callers allowed to wait for the
    /// process lock. Zero disables either limit.
    pub fn new(process: Arc<dyn ManagedProcess>, max_requests: i64, max_queue_size: i64) -> Self {
        Self {
            inner: Arc::new(Inner {
                process,
                max_requests,
                max_queue_size,
                lock: Semaphore::new(1),
                started: AtomicBool::new(false),
                restarting: AtomicBool::new(false),
                req_counter: AtomicI64::new(0),
                queue_size: AtomicI64::new(0),
                restarts: AtomicI64::new(0),
            }),
        }
    }

    /// Start the managed process.
    pub async fn launch(&self) -> Result<(), SupervisorError> {
        self.inner.launch().await
    }

    /// Stop the managed process. The supervisor stays reusable: a later
    /// `launch` (explicit or lazy) brings the process back up.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        self.inner.shutdown().await
    }

    /// Health of the managed process. A process that has never been started,
    /// or is mid-recovery, is not reported as broken; callers must not treat
    /// either as a failure signal.
    pub async fn healthy(&self) -> bool {
        if !self.inner.started.load(Ordering::SeqCst) {
            return true;
        }
        if self.inner.restarting.load(Ordering::SeqCst) {
            return true;
        }

        self.inner.process.healthy().await
    }

    /// Execute `task` against the managed process.
    ///
    /// The call is admitted only while the waiting queue is below its bound,
    /// then waits for exclusive access to the process, starting or restarting
    /// it first when needed. Every wait races against `ctx`; on cancellation
    /// the caller is unblocked promptly, but an operation that already
    /// started keeps running detached. At most one task touches the process
    /// at any instant.
    pub async fn run<F>(&self, ctx: &CancellationToken, task: F) -> Result<(), SupervisorError>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let inner = &self.inner;

        if inner.max_queue_size > 0
            && inner.queue_size.load(Ordering::SeqCst) >= inner.max_queue_size
        {
            return Err(SupervisorError::QueueFull);
        }

        inner.queue_size.fetch_add(1, Ordering::SeqCst);

        let mut task = Some(task);
        loop {
            match self.attempt(ctx, &mut task).await {
                Err(SupervisorError::AlreadyRestarting) => {
                    debug!("process is already restarting, re-acquiring the process lock");
                    inner.queue_size.fetch_add(1, Ordering::SeqCst);
                }
                result => return result,
            }
        }
    }

    /// Number of callers currently waiting for the process lock.
    pub fn req_queue_size(&self) -> i64 {
        self.inner.queue_size.load(Ordering::SeqCst)
    }

    /// Number of successful restarts since the supervisor was created.
    pub fn restarts_count(&self) -> i64 {
        self.inner.restarts.load(Ordering::SeqCst)
    }

    async fn attempt<F>(
        &self,
        ctx: &CancellationToken,
        task: &mut Option<F>,
    ) -> Result<(), SupervisorError>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let inner = &self.inner;

        let _permit = tokio::select! {
            permit = inner.lock.acquire() => match permit {
                Ok(permit) => permit,
                // The semaphore is never closed.
                Err(_) => return Err(SupervisorError::Canceled),
            },
            _ = ctx.cancelled() => {
                debug!("failed to acquire the process lock before the deadline");
                inner.queue_size.fetch_sub(1, Ordering::SeqCst);
                return Err(SupervisorError::Canceled);
            }
        };

        debug!("process lock acquired");
        inner.queue_size.fetch_sub(1, Ordering::SeqCst);

        if !inner.started.load(Ordering::SeqCst) {
            let inner = Arc::clone(inner);
            run_with_deadline(ctx, async move { inner.launch().await }).await?;
        }

        if !self.healthy().await {
            debug!("process is unhealthy, restarting before handling the task");
            let inner = Arc::clone(inner);
            run_with_deadline(ctx, async move { inner.restart().await }).await?;
        }

        if inner.max_requests > 0
            && inner.req_counter.load(Ordering::SeqCst) >= inner.max_requests
        {
            debug!("maximum request limit reached, restarting before handling the task");
            let inner = Arc::clone(inner);
            run_with_deadline(ctx, async move { inner.restart().await }).await?;
        }

        inner.req_counter.fetch_add(1, Ordering::SeqCst);

        // Retries only happen before the task is consumed.
        let Some(task) = task.take() else {
            return Err(SupervisorError::Panicked("task already consumed".into()));
        };

        let result =
            run_with_deadline(ctx, async move { task.await.map_err(SupervisorError::Task) }).await;
        debug!("process lock released");

        result
    }
}

impl Inner {
    async fn launch(&self) -> Result<(), SupervisorError> {
        debug!("start process");
        self.process.start().await.map_err(SupervisorError::Launch)?;

        self.started.store(true, Ordering::SeqCst);
        debug!("process successfully started");

        Ok(())
    }

    async fn shutdown(&self) -> Result<(), SupervisorError> {
        debug!("shutdown process");
        self.process.stop().await.map_err(SupervisorError::Shutdown)?;

        debug!("process successfully shut down");

        Ok(())
    }

    async fn restart(&self) -> Result<(), SupervisorError> {
        if self
            .restarting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SupervisorError::AlreadyRestarting);
        }
        let _guard = ClearOnDrop(&self.restarting);

        debug!("restart process");

        if let Err(err) = self.shutdown().await {
            // Chances are the process is already dead.
            debug!(error = %err, "stop process before restart");
        }

        match self.launch().await {
            Ok(()) => {
                self.req_counter.store(0, Ordering::SeqCst);
                self.restarts.fetch_add(1, Ordering::SeqCst);
                debug!("process successfully restarted");
                Ok(())
            }
            Err(err) => Err(SupervisorError::Restart(Box::new(err))),
        }
    }
}

/// Clears the flag on every exit path, including a panic on the background
/// task running the restart.
struct ClearOnDrop<'a>(&'a AtomicBool);

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Race `operation` against the caller's context. Losing the race unblocks
/// the caller but does not abort the operation: it keeps running on its own
/// task. Force-cancelling could kill the engine mid-task on behalf of an
/// unrelated timeout.
async fn run_with_deadline<F>(
    ctx: &CancellationToken,
    operation: F,
) -> Result<(), SupervisorError>
where
    F: Future<Output = Result<(), SupervisorError>> + Send + 'static,
{
    let handle = tokio::spawn(operation);

    tokio::select! {
        joined = handle => match joined {
            Ok(result) => result,
            Err(err) => Err(SupervisorError::Panicked(err.to_string())),
        },
        _ = ctx.cancelled() => Err(SupervisorError::Canceled),
    }
}
