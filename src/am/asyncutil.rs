use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Counts tasks spawned by the daemon so shutdown can report what is still
/// in flight. Tasks decrement the active count through an RAII guard, so
/// panics and cancellations are accounted for too.
#[derive(Debug, Clone, Default)]
pub struct TaskTracker {
    active: Arc<AtomicUsize>,
    spawned_total: Arc<AtomicUsize>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn total_spawned(&self) -> usize {
        self.spawned_total.load(Ordering::SeqCst)
    }

    pub fn spawn<F, T>(&self, fut: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.guard();
        tokio::spawn(async move {
            let _guard = guard;
            fut.await
        })
    }

    /// Lifecycle operations block (process waits, filesystem, git); they go
    /// to the blocking pool, tracked the same way.
    pub fn spawn_blocking<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.guard();
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            f()
        })
    }

    fn guard(&self) -> TaskGuard {
        self.spawned_total.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
        TaskGuard { counter: Arc::clone(&self.active) }
    }
}

#[derive(Debug)]
struct TaskGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
