use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use crate::gc::CollectStats;
use crate::runtime::Runtime;

/// A runtime shareable across threads: one mutex over the whole core.
/// Reference counts stay plain words because every mutation happens under
/// the lock — the single-writer discipline made structural instead of
/// promised.
pub struct SharedRuntime {
    inner: Mutex<Runtime>,
    staged: Condvar,
    shutdown: AtomicBool,
}

// SAFETY: `Runtime` is non-Send only because values can carry `OpaquePtr`
// payloads. The core never dereferences those pointers; they are opaque
// cargo for the embedder, and all access to the runtime behind this
// wrapper is serialized by the mutex.
unsafe impl Send for SharedRuntime {}
unsafe impl Sync for SharedRuntime {}

impl SharedRuntime {
    pub fn new(runtime: Runtime) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(runtime),
            staged: Condvar::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Run a closure against the locked runtime. If the closure leaves
    /// staged work behind, the drain worker is woken.
    pub fn with<R>(&self, f: impl FnOnce(&mut Runtime) -> R) -> R {
        let mut rt = self.inner.lock();
        let result = f(&mut rt);
        if !rt.gc().is_empty() {
            self.staged.notify_one();
        }
        result
    }

    /// Stop-the-world collection under the lock.
    pub fn collect(&self) -> CollectStats {
        self.inner.lock().collect()
    }

    /// Mark and sweep with teardown staged for the worker, then wake it.
    pub fn collect_deferred(&self) -> CollectStats {
        let mut rt = self.inner.lock();
        let stats = rt.collect_deferred();
        self.staged.notify_one();
        stats
    }

    /// Drain staged work on the calling thread.
    pub fn drain(&self) -> usize {
        self.inner.lock().drain_pending()
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().gc().pending()
    }

    fn signal_shutdown(&self) {
        // Taking the lock serializes the store with the worker's
        // check-then-wait, so the wakeup cannot be lost.
        let _rt = self.inner.lock();
        self.shutdown.store(true, Ordering::Release);
        self.staged.notify_all();
    }
}

/// Background thread that drains the staging buffers whenever a mutator
/// or a deferred collection leaves work behind. Dropping the worker
/// finishes outstanding work and joins the thread.
pub struct DrainWorker {
    shared: Arc<SharedRuntime>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DrainWorker {
    pub fn spawn(shared: Arc<SharedRuntime>) -> Self {
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("drain-worker".into())
            .spawn(move || Self::run(&worker_shared))
            .ok();
        debug_assert!(handle.is_some(), "drain worker thread failed to spawn");
        Self { shared, handle }
    }

    fn run(shared: &SharedRuntime) {
        debug!("drain worker up");
        loop {
            let mut rt = shared.inner.lock();
            while rt.gc().is_empty() && !shared.shutdown.load(Ordering::Acquire) {
                shared.staged.wait(&mut rt);
            }
            if rt.gc().is_empty() {
                break;
            }
            let drained = rt.drain_pending();
            drop(rt);
            trace!("drain worker processed {drained} staged entries");
        }
        debug!("drain worker down");
    }

    /// Finish outstanding work and stop the thread.
    pub fn stop(mut self) {
        self.join();
    }

    fn join(&mut self) {
        self.shared.signal_shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("drain worker panicked");
            }
        }
    }
}

impl Drop for DrainWorker {
    fn drop(&mut self) {
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectKind;
    use std::time::Duration;

    fn wait_until(shared: &SharedRuntime, mut done: impl FnMut(&mut Runtime) -> bool) -> bool {
        for _ in 0..400 {
            if shared.with(&mut done) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn state_persists_across_locked_sections() {
        let shared = SharedRuntime::new(Runtime::new());
        let obj = shared.with(|rt| rt.alloc_object(ObjectKind::Instance).unwrap());
        let alive = shared.with(|rt| rt.objects().contains(obj));
        assert!(alive);
    }

    #[test]
    fn the_worker_drains_work_staged_by_mutators() {
        let shared = SharedRuntime::new(Runtime::new());
        let worker = DrainWorker::spawn(Arc::clone(&shared));

        shared.with(|rt| {
            let text = rt.alloc_string("staged");
            rt.release(text);
        });

        assert!(
            wait_until(&shared, |rt| rt.strings().live() == 0),
            "worker never freed the staged string"
        );
        worker.stop();
    }

    #[test]
    fn deferred_collections_hand_teardown_to_the_worker() {
        let shared = SharedRuntime::new(Runtime::new());
        let worker = DrainWorker::spawn(Arc::clone(&shared));

        shared.with(|rt| {
            let obj = rt.alloc_object(ObjectKind::Instance).unwrap();
            let text = rt.alloc_string("owned by obj");
            rt.set(obj, "s", &text).unwrap();
            rt.release(text);
        });
        let stats = shared.collect_deferred();
        assert_eq!(stats.freed, 1);

        assert!(
            wait_until(&shared, |rt| {
                rt.strings().live() == 0 && rt.gc().is_empty()
            }),
            "worker never finished the staged teardown"
        );
        worker.stop();
    }

    #[test]
    fn stopping_an_idle_worker_does_not_hang() {
        let shared = SharedRuntime::new(Runtime::new());
        let worker = DrainWorker::spawn(Arc::clone(&shared));
        worker.stop();
        assert_eq!(shared.pending(), 0);
    }
}
