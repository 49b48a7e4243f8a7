//! Pod-op executor: a process-wide bounded pool that every Kubernetes
//! client call is routed through, surfaced as an async API.
//!
//! Uses `tokio::task::spawn_blocking` for the actual thread hop — `tokio`'s
//! blocking pool is already bounded — but wraps it in a `Semaphore` sized
//! to a specific, configurable bound, since a bare `spawn_blocking` doesn't
//! expose a queued-operation count the embedder can observe.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OnceCell, Semaphore};

use crate::config;
use crate::errors::{PodError, Result, SandboxError};

static EXECUTOR: OnceCell<PodOpExecutor> = OnceCell::const_new();

/// The process-wide pod-op executor. Sizing is decided once, at the first
/// call to [`PodOpExecutor::global`]; later callers passing a different
/// `explicit_max_pod_ops` are ignored.
pub struct PodOpExecutor {
    semaphore: Arc<Semaphore>,
    queued: AtomicUsize,
    capacity: usize,
}

impl PodOpExecutor {
    fn with_capacity(capacity: usize) -> Self {
        PodOpExecutor {
            semaphore: Arc::new(Semaphore::new(capacity)),
            queued: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Returns the singleton executor, initializing it on first call.
    pub async fn global(explicit_max_pod_ops: Option<usize>) -> Result<&'static PodOpExecutor> {
        EXECUTOR
            .get_or_try_init(|| async move {
                let capacity = config::max_pod_ops(explicit_max_pod_ops)?;
                Ok::<_, SandboxError>(PodOpExecutor::with_capacity(capacity))
            })
            .await
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of operations currently queued or running against this
    /// pool.
    pub fn queued_count(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Runs a blocking Kubernetes client call on the bounded pool.
    pub async fn run_blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.queued.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("pod-op semaphore is never closed");
        let outcome = tokio::task::spawn_blocking(f).await;
        drop(permit);
        self.queued.fetch_sub(1, Ordering::SeqCst);
        match outcome {
            Ok(result) => result,
            Err(join_err) => Err(PodError::new(format!("pod operation task panicked: {join_err}")).into()),
        }
    }

    /// Bounds concurrency for a Kubernetes call that is natively
    /// asynchronous (e.g. `kube::Api::exec`/`get`, which talk to the API
    /// server over `hyper` rather than blocking a thread). Unlike
    /// [`run_blocking`](Self::run_blocking) this awaits `f` directly on the
    /// calling task instead of hopping to the blocking pool — there is no
    /// thread to hop to, only a permit to hold while the request is
    /// in-flight.
    pub async fn run_async<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.queued.fetch_add(1, Ordering::SeqCst);
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("pod-op semaphore is never closed");
        let result = f().await;
        self.queued.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_blocking_work_and_returns_its_result() {
        let executor = PodOpExecutor::with_capacity(2);
        let result = executor.run_blocking(|| Ok(2 + 2)).await.unwrap();
        assert_eq!(result, 4);
        assert_eq!(executor.queued_count(), 0);
    }

    #[tokio::test]
    async fn run_async_awaits_directly_without_a_thread_hop() {
        let executor = PodOpExecutor::with_capacity(1);
        let result = executor.run_async(|| async { Ok(21 * 2) }).await.unwrap();
        assert_eq!(result, 42);
        assert_eq!(executor.queued_count(), 0);
    }

    #[tokio::test]
    async fn propagates_errors_from_the_blocking_closure() {
        let executor = PodOpExecutor::with_capacity(1);
        let result: Result<()> = executor
            .run_blocking(|| Err(PodError::new("boom").into()))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn bounds_concurrency_to_capacity() {
        let executor = Arc::new(PodOpExecutor::with_capacity(2));
        assert_eq!(executor.capacity(), 2);

        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_observed = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..6 {
            let executor = executor.clone();
            let in_flight = in_flight.clone();
            let max_observed = max_observed.clone();
            handles.push(tokio::spawn(async move {
                executor
                    .run_blocking(move || {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_observed.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(max_observed.load(Ordering::SeqCst) <= 2);
    }
}
