//! Shared worker pool with loader retargeting
//!
//! Library code running on pooled threads resolves resources through a
//! thread-local reference to the active runtime loader. Pool threads are
//! long-lived, so after a reload each thread still points at the previous
//! generation; [`WorkerPool::retarget`] fixes every thread up using a
//! count-down-and-release rendezvous. The rendezvous wait is bounded by a
//! configurable timeout: a worker tied up in external code cannot be
//! retargeted, and that surfaces as an observable partial outcome rather
//! than a silent one.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::loader::RuntimeLoader;

thread_local! {
    static ACTIVE_LOADER: RefCell<Option<Arc<RuntimeLoader>>> = const { RefCell::new(None) };
}

/// Bounds the rendezvous wait during a retarget.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetargetPolicy {
    pub timeout: Duration,
}

impl Default for RetargetPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

/// What a retarget actually achieved. `timed_out` means at least one worker
/// thread did not confirm within the policy's timeout; such a thread still
/// picks up the new loader when it eventually reaches its rendezvous job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetargetOutcome {
    pub expected: usize,
    pub confirmed: usize,
    pub timed_out: bool,
}

type Job = Box<dyn FnOnce() + Send>;

struct PoolShared {
    queue: Mutex<PoolQueue>,
    available: Condvar,
}

struct PoolQueue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

/// A fixed pool of long-lived worker threads.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    parallelism: usize,
}

impl WorkerPool {
    pub fn new(parallelism: usize) -> Self {
        let parallelism = parallelism.max(1);
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(PoolQueue {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        });
        let threads = (0..parallelism)
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("reforge-worker-{i}"))
                    .spawn(move || worker_loop(shared))
                    .unwrap_or_else(|e| panic!("failed to spawn worker thread: {e}"))
            })
            .collect();
        Self {
            shared,
            threads: Mutex::new(threads),
            parallelism,
        }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Submit a job. Returns false if the pool is shut down.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> bool {
        let mut queue = self.lock_queue();
        if queue.shutdown {
            return false;
        }
        queue.jobs.push_back(Box::new(job));
        drop(queue);
        self.shared.available.notify_one();
        true
    }

    /// The loader the current thread was last retargeted to. Only meaningful
    /// on pool threads.
    pub fn current_loader() -> Option<Arc<RuntimeLoader>> {
        ACTIVE_LOADER.with(|slot| slot.borrow().clone())
    }

    /// Point every worker thread's loader reference at `loader`.
    ///
    /// One rendezvous job per worker is submitted; each job sets its
    /// thread's loader slot, confirms arrival, and blocks until released, so
    /// no worker can service two rendezvous jobs. The wait for confirmations
    /// is bounded by the policy timeout.
    pub fn retarget(&self, loader: &Arc<RuntimeLoader>, policy: &RetargetPolicy) -> RetargetOutcome {
        let rendezvous = Arc::new(Rendezvous::new(self.parallelism));
        for _ in 0..self.parallelism {
            let loader = Arc::clone(loader);
            let rendezvous = Arc::clone(&rendezvous);
            self.submit(move || {
                ACTIVE_LOADER.with(|slot| *slot.borrow_mut() = Some(loader));
                rendezvous.arrive_and_wait();
            });
        }

        let confirmed = rendezvous.await_arrivals(policy.timeout);
        rendezvous.release();

        let outcome = RetargetOutcome {
            expected: self.parallelism,
            confirmed,
            timed_out: confirmed < self.parallelism,
        };
        if outcome.timed_out {
            warn!(
                confirmed = outcome.confirmed,
                expected = outcome.expected,
                timeout = ?policy.timeout,
                "worker pool retarget timed out; unconfirmed threads keep their previous loader until they idle"
            );
        } else {
            debug!(threads = outcome.confirmed, loader = %loader.name(), "worker pool retargeted");
        }
        outcome
    }

    /// Stop accepting jobs, drain the queue, and join every worker.
    pub fn shutdown(&self) {
        {
            let mut queue = self.lock_queue();
            if queue.shutdown {
                return;
            }
            queue.shutdown = true;
        }
        self.shared.available.notify_all();
        let threads = std::mem::take(&mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in threads {
            if handle.join().is_err() {
                warn!("worker thread panicked before shutdown");
            }
        }
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, PoolQueue> {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let job = {
            let mut queue = shared.queue.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break Some(job);
                }
                if queue.shutdown {
                    break None;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        match job {
            Some(job) => job(),
            None => return,
        }
    }
}

/// Count-down + release barrier for the retarget protocol.
struct Rendezvous {
    state: Mutex<RendezvousState>,
    arrived_cv: Condvar,
    release_cv: Condvar,
    expected: usize,
}

struct RendezvousState {
    arrived: usize,
    released: bool,
}

impl Rendezvous {
    fn new(expected: usize) -> Self {
        Self {
            state: Mutex::new(RendezvousState {
                arrived: 0,
                released: false,
            }),
            arrived_cv: Condvar::new(),
            release_cv: Condvar::new(),
            expected,
        }
    }

    fn arrive_and_wait(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.arrived += 1;
        self.arrived_cv.notify_all();
        while !state.released {
            state = self
                .release_cv
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wait up to `timeout` for all expected arrivals; returns how many
    /// actually arrived.
    fn await_arrivals(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while state.arrived < self.expected {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, result) = self
                .arrived_cv
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
            if result.timed_out() {
                break;
            }
        }
        state.arrived
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.released = true;
        self.release_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{ClassPathMode, GeneratedArtifacts, LoaderManager};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn test_loader() -> Arc<RuntimeLoader> {
        let manager = LoaderManager::new(ClassPathMode::Isolated);
        manager
            .install_generation(GeneratedArtifacts::new())
            .unwrap()
            .active
    }

    #[test]
    fn test_jobs_run_on_pool_threads() {
        let pool = WorkerPool::new(2);
        let (tx, rx) = mpsc::channel();
        for i in 0..4 {
            let tx = tx.clone();
            assert!(pool.submit(move || tx.send(i).unwrap()));
        }
        let mut seen: Vec<i32> = (0..4).map(|_| rx.recv().unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
        pool.shutdown();
    }

    #[test]
    fn test_retarget_reaches_every_worker() {
        let pool = WorkerPool::new(3);
        let loader = test_loader();
        let outcome = pool.retarget(&loader, &RetargetPolicy::default());
        assert_eq!(outcome.confirmed, 3);
        assert!(!outcome.timed_out);

        // every worker thread now resolves through the new generation
        let counted = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for _ in 0..3 {
            let counted = Arc::clone(&counted);
            let expected = Arc::clone(&loader);
            let tx = tx.clone();
            pool.submit(move || {
                if let Some(current) = WorkerPool::current_loader() {
                    if Arc::ptr_eq(&current, &expected) {
                        counted.fetch_add(1, Ordering::SeqCst);
                    }
                }
                tx.send(()).unwrap();
            });
        }
        for _ in 0..3 {
            rx.recv().unwrap();
        }
        assert_eq!(counted.load(Ordering::SeqCst), 3);
        pool.shutdown();
    }

    #[test]
    fn test_retarget_times_out_when_a_worker_is_tied_up() {
        let pool = WorkerPool::new(2);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        // tie up one worker in "external" blocking work
        pool.submit(move || {
            release_rx.recv().ok();
        });
        // give the blocking job time to be picked up
        std::thread::sleep(Duration::from_millis(50));

        let loader = test_loader();
        let outcome = pool.retarget(
            &loader,
            &RetargetPolicy {
                timeout: Duration::from_millis(100),
            },
        );
        assert!(outcome.timed_out);
        assert_eq!(outcome.confirmed, 1);
        assert_eq!(outcome.expected, 2);

        release_tx.send(()).unwrap();
        pool.shutdown();
    }

    #[test]
    fn test_submit_after_shutdown_is_rejected() {
        let pool = WorkerPool::new(1);
        pool.shutdown();
        assert!(!pool.submit(|| {}));
    }
}
