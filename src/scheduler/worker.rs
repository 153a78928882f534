use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::context::ContextGuard;
use crate::error::RuntimeError;
use crate::task::Task;

use super::SchedulerCore;

/// Double-ended task queue shared between one owning worker and the
/// scheduler. The scheduler (or a future thief) uses the front; the
/// owning worker consumes from the back.
pub(crate) struct LocalQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
    depth: AtomicUsize,
}

struct QueueState<T> {
    deque: VecDeque<T>,
    should_run: bool,
}

impl<T> LocalQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                deque: VecDeque::new(),
                should_run: true,
            }),
            available: Condvar::new(),
            depth: AtomicUsize::new(0),
        }
    }

    /// Inserts at the front. Used by the scheduler to hand over an
    /// assigned item.
    pub fn push_assigned(&self, item: T) {
        let mut state = self.state.lock();
        state.deque.push_front(item);
        self.depth.fetch_add(1, Ordering::Relaxed);
        self.available.notify_one();
    }

    /// Removes from the back, blocking while the queue is empty. Returns
    /// `None` once the queue has been stopped, even if items remain.
    pub fn pop_local(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if !state.should_run {
                return None;
            }
            if let Some(item) = state.deque.pop_back() {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                return Some(item);
            }
            self.available.wait(&mut state);
        }
    }

    /// Removes from the front without blocking.
    #[allow(dead_code)]
    pub fn steal(&self) -> Option<T> {
        let mut state = self.state.lock();
        let item = state.deque.pop_front();
        if item.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        item
    }

    /// Depth hint for placement. Immediately stale and may be off by one
    /// relative to any real queue length.
    pub fn estimated_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Stops the queue, dropping any items still waiting in it.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.should_run = false;
        state.deque.clear();
        self.depth.store(0, Ordering::Relaxed);
        self.available.notify_all();
    }
}

/// A worker owning one local queue of assigned tasks.
pub(crate) struct WorkerThread {
    index: usize,
    queue: LocalQueue<Task>,
}

impl WorkerThread {
    pub fn new(index: usize) -> Self {
        WorkerThread {
            index,
            queue: LocalQueue::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn queue(&self) -> &LocalQueue<Task> {
        &self.queue
    }

    /// Worker loop; runs on a dedicated thread until stopped. Binds the
    /// scheduler context for the thread's whole lifetime so that task
    /// bodies can spawn.
    pub fn run(&self, core: Arc<SchedulerCore>) {
        let _context = ContextGuard::enter(Arc::clone(&core));
        while let Some(task) = self.queue.pop_local() {
            match task.run() {
                Ok(()) => {}
                Err(RuntimeError::SchedulerStopped) => break,
                Err(err) => {
                    log::error!(
                        "worker {}: unexpected error while running {:?}: {}",
                        self.index,
                        task,
                        err
                    );
                    core.report_error(err);
                    core.stop();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn owner_takes_oldest_thief_takes_newest() {
        let queue = LocalQueue::new();
        queue.push_assigned(1);
        queue.push_assigned(2);
        queue.push_assigned(3);
        assert_eq!(queue.estimated_depth(), 3);
        assert_eq!(queue.pop_local(), Some(1));
        assert_eq!(queue.steal(), Some(3));
        assert_eq!(queue.pop_local(), Some(2));
        assert_eq!(queue.estimated_depth(), 0);
        assert_eq!(queue.steal(), None);
    }

    #[test]
    fn stopped_queue_abandons_items() {
        let queue = LocalQueue::new();
        queue.push_assigned(7);
        queue.stop();
        assert_eq!(queue.pop_local(), None);
    }

    #[test]
    fn blocking_pop_wakes_on_push() {
        let queue = Arc::new(LocalQueue::new());
        let popper = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop_local())
        };
        thread::sleep(Duration::from_millis(20));
        queue.push_assigned(5);
        assert_eq!(popper.join().unwrap(), Some(5));
    }
}
