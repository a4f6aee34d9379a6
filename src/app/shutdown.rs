//! Ordered shutdown task registry
//!
//! Steps and the running application register close work here. Teardown runs
//! every task exactly once, last registered first, and a failing task never
//! prevents the remaining ones from running: each failure is logged and
//! swallowed.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, error};

type Task = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct ShutdownContext {
    tasks: Mutex<Vec<(String, Task)>>,
    ran: AtomicBool,
}

impl ShutdownContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a close task. Tasks registered after [`run_all`] has begun
    /// are dropped with a warning rather than silently leaking.
    ///
    /// [`run_all`]: ShutdownContext::run_all
    pub fn register(&self, name: impl Into<String>, task: impl FnOnce() + Send + 'static) {
        let name = name.into();
        if self.ran.load(Ordering::SeqCst) {
            error!(task = %name, "shutdown task registered after teardown started; dropping it");
            return;
        }
        self.lock().push((name, Box::new(task)));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Run every registered task, in reverse registration order. Only the
    /// first caller performs the work; panicking tasks are caught, logged
    /// and do not stop the remaining tasks.
    pub fn run_all(&self) {
        if self.ran.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = std::mem::take(&mut *self.lock());
        debug!(count = tasks.len(), "running shutdown tasks");
        while let Some((name, task)) = tasks.pop() {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(task = %name, detail, "shutdown task failed");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(String, Task)>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_tasks_run_in_reverse_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let context = ShutdownContext::new();
        for i in 0..3 {
            let order = Arc::clone(&order);
            context.register(format!("task-{i}"), move || {
                order.lock().unwrap().push(i);
            });
        }
        context.run_all();
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn test_run_all_is_one_shot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let context = ShutdownContext::new();
        {
            let calls = Arc::clone(&calls);
            context.register("count", move || {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        context.run_all();
        context.run_all();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_task_does_not_stop_the_rest() {
        let survived = Arc::new(AtomicUsize::new(0));
        let context = ShutdownContext::new();
        {
            let survived = Arc::clone(&survived);
            context.register("first", move || {
                survived.fetch_add(1, Ordering::SeqCst);
            });
        }
        context.register("boom", || panic!("intentional"));
        context.run_all();
        // "boom" ran (and failed) before "first"
        assert_eq!(survived.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_registration_is_dropped() {
        let context = ShutdownContext::new();
        context.run_all();
        context.register("late", || {});
        assert!(context.is_empty());
    }
}
