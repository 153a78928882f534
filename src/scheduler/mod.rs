use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::{Receiver, Sender};
use derivative::Derivative;
use parking_lot::{Condvar, Mutex};

use crate::context::{ContextGuard, SchedulerContext};
use crate::device::all_devices;
use crate::error::RuntimeError;
use crate::requirements::{DeviceSetRequirements, DeviceVec, Requirements};
use crate::resources::ResourcePool;
use crate::task::{Task, TaskId, TaskState};

mod builder;
mod worker;

pub use builder::SchedulerBuilder;
use worker::WorkerThread;

const ASSIGNMENT_FAILURE_WARNING_LIMIT: u32 = 32;

/// Fields guarded by the scheduler monitor.
struct SchedulerState {
    /// Global allocation queue. Push site is the front, pop site the
    /// back, so arrival order is FIFO; re-enqueued unassignable tasks go
    /// back to the push site and may be overtaken.
    allocation_queue: VecDeque<Task>,
    /// Live task count plus one for the scope. Reaching zero stops the
    /// scheduler.
    active_tasks: usize,
    should_run: bool,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) struct SchedulerCore {
    #[derivative(Debug = "ignore")]
    state: Mutex<SchedulerState>,
    #[derivative(Debug = "ignore")]
    monitor: Condvar,
    /// Actual hardware occupancy; acquired at run start, blocking.
    committed: ResourcePool,
    /// Admission window ahead of execution; probed without blocking.
    reserved: ResourcePool,
    #[derivative(Debug = "ignore")]
    workers: Vec<WorkerThread>,
    period: Duration,
    max_worker_queue_depth: usize,
    #[derivative(Debug = "ignore")]
    err_sender: Sender<RuntimeError>,
    #[derivative(Debug = "ignore")]
    err_receiver: Receiver<RuntimeError>,
    next_task_id: AtomicU64,
}

impl SchedulerCore {
    pub fn committed(&self) -> &ResourcePool {
        &self.committed
    }

    pub fn reserved(&self) -> &ResourcePool {
        &self.reserved
    }

    pub fn next_task_id(&self) -> TaskId {
        TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn incr_active_tasks(&self) {
        self.state.lock().active_tasks += 1;
    }

    pub fn decr_active_tasks(&self) {
        let done = {
            let mut state = self.state.lock();
            state.active_tasks -= 1;
            state.active_tasks == 0
        };
        if done {
            self.stop();
        }
    }

    /// Puts a ready task on the allocation queue.
    pub fn enqueue_task(&self, task: Task) {
        let mut state = self.state.lock();
        state.allocation_queue.push_front(task);
        self.monitor.notify_all();
    }

    /// Takes the oldest queued task, blocking while the queue is empty.
    /// Returns `None` on shutdown.
    fn dequeue_task(&self) -> Option<Task> {
        let mut state = self.state.lock();
        loop {
            if !state.should_run {
                return None;
            }
            if let Some(task) = state.allocation_queue.pop_back() {
                return Some(task);
            }
            self.monitor.wait(&mut state);
        }
    }

    pub fn report_error(&self, err: RuntimeError) {
        let _ = self.err_sender.send(err);
    }

    /// Idempotent shutdown: wakes the allocation queue, every worker and
    /// every pool waiter.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if !state.should_run {
                return;
            }
            state.should_run = false;
            state.allocation_queue.clear();
        }
        self.monitor.notify_all();
        for worker in &self.workers {
            worker.queue().stop();
        }
        self.committed.close();
        self.reserved.close();
    }

    fn running(&self) -> bool {
        self.state.lock().should_run
    }

    fn wait_for_shutdown(&self) {
        let mut state = self.state.lock();
        while state.should_run {
            self.monitor.wait(&mut state);
        }
    }

    /// Non-blocking reservation of `ndevices` devices out of the
    /// candidate list, all-or-nothing per device. Partially reserved
    /// devices are released on failure.
    fn try_reserve(
        &self,
        req: &DeviceSetRequirements,
    ) -> Result<Option<DeviceSetRequirements>, RuntimeError> {
        let mut selected: DeviceVec = DeviceVec::new();
        for device in req.devices() {
            if selected.len() == req.ndevices() {
                break;
            }
            match self.reserved.allocate(device, req.resources(), false) {
                Ok(true) => selected.push(device.clone()),
                Ok(false) => {}
                Err(err) => {
                    for device in &selected {
                        let _ = self.reserved.deallocate(device, req.resources());
                    }
                    return Err(err);
                }
            }
        }
        if selected.len() == req.ndevices() {
            Ok(Some(req.narrowed(selected)))
        } else {
            for device in &selected {
                self.reserved.deallocate(device, req.resources())?;
            }
            Ok(None)
        }
    }

    /// Tries to narrow the task's requirement to an exact device set by
    /// reserving admission resources, walking candidates in declared
    /// order. Returns whether the task is ready for worker placement.
    fn try_assign(&self, task: &Task) -> Result<bool, RuntimeError> {
        let mut shared = task.shared();
        if shared.assigned {
            return Ok(true);
        }
        let mut chosen = None;
        for candidate in shared.req.possibilities() {
            if let Some(exact) = self.try_reserve(&candidate)? {
                chosen = Some(exact);
                break;
            }
        }
        match chosen {
            Some(exact) => {
                log::info!("{}: assigned to {:?}", task.id(), exact.devices());
                shared.req = Requirements::DeviceSet(exact);
                shared.assigned = true;
                shared.assignment_tries = 0;
                Ok(true)
            }
            None => {
                shared.assignment_tries += 1;
                if shared.assignment_tries > ASSIGNMENT_FAILURE_WARNING_LIMIT {
                    log::warn!(
                        "{}: {} consecutive assignment failures; the requested resources \
                         may not be satisfiable on this machine.\ncommitted: {:?}\nreserved: {:?}",
                        task.id(),
                        shared.assignment_tries,
                        self.committed,
                        self.reserved
                    );
                }
                Ok(false)
            }
        }
    }

    /// Hands an assigned task to the worker with the smallest estimated
    /// queue depth (ties break to the lowest index), backing off while
    /// every queue is full.
    fn place_on_worker(&self, task: Task) {
        loop {
            if !self.running() {
                return;
            }
            let worker = self
                .workers
                .iter()
                .min_by_key(|worker| worker.queue().estimated_depth());
            let worker = match worker {
                Some(worker) => worker,
                None => return,
            };
            if worker.queue().estimated_depth() < self.max_worker_queue_depth {
                log::debug!("{}: enqueued on worker {}", task.id(), worker.index());
                worker.queue().push_assigned(task);
                return;
            }
            thread::sleep(self.period);
        }
    }

    fn schedule_task(&self, task: Task) -> Result<(), RuntimeError> {
        log::debug!("{}: assigning", task.id());
        match self.try_assign(&task) {
            Ok(true) => {
                self.place_on_worker(task);
                Ok(())
            }
            Ok(false) => {
                self.enqueue_task(task);
                thread::sleep(self.period);
                Ok(())
            }
            Err(err @ RuntimeError::InvalidResource { .. })
            | Err(err @ RuntimeError::UnknownDevice(_)) => {
                log::warn!("{}: impossible resource request: {}", task.id(), err);
                task.set_state(TaskState::Failed(err));
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Assignment loop; runs on the dedicated scheduler thread.
    fn assignment_loop(&self) {
        while let Some(task) = self.dequeue_task() {
            if let Err(err) = self.schedule_task(task) {
                log::error!("scheduler: unexpected error during assignment: {}", err);
                self.report_error(err);
                self.stop();
                return;
            }
        }
    }
}

/// The task-parallel runtime: a fixed pool of workers fed by a two-stage
/// scheduler (admission against the reserved pool, then shortest-queue
/// dispatch). A scheduler is a scoped resource; see [`Scheduler::scope`].
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Scheduler {
    core: Arc<SchedulerCore>,
    #[derivative(Debug = "ignore")]
    threads: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// A scheduler with `n_threads` workers and default configuration.
    pub fn new(n_threads: usize) -> Scheduler {
        SchedulerBuilder::new().n_threads(n_threads).build()
    }

    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    pub(crate) fn start(config: SchedulerBuilder) -> Scheduler {
        let devices = all_devices();
        let (err_sender, err_receiver) = crossbeam::unbounded();
        let workers = (0..config.n_threads).map(WorkerThread::new).collect();
        let core = Arc::new(SchedulerCore {
            state: Mutex::new(SchedulerState {
                allocation_queue: VecDeque::new(),
                // One count held by the scope until it exits.
                active_tasks: 1,
                should_run: true,
            }),
            monitor: Condvar::new(),
            committed: ResourcePool::new(&devices, 1.0),
            reserved: ResourcePool::new(&devices, config.max_worker_queue_depth as f64),
            workers,
            period: config.period,
            max_worker_queue_depth: config.max_worker_queue_depth,
            err_sender,
            err_receiver,
            next_task_id: AtomicU64::new(0),
        });

        let mut threads = Vec::with_capacity(config.n_threads + 1);
        for index in 0..config.n_threads {
            let core = Arc::clone(&core);
            let handle = thread::Builder::new()
                .name(format!("ratchet-worker-{}", index))
                .spawn(move || core.workers[index].run(Arc::clone(&core)))
                .expect("failed to spawn worker thread");
            threads.push(handle);
        }
        {
            let core = Arc::clone(&core);
            let handle = thread::Builder::new()
                .name("ratchet-scheduler".to_owned())
                .spawn(move || core.assignment_loop())
                .expect("failed to spawn scheduler thread");
            threads.push(handle);
        }
        Scheduler { core, threads }
    }

    /// Enters the scheduler scope, runs `f` with the context bound to the
    /// calling thread, then blocks until every spawned task is terminal
    /// and the scheduler has shut down.
    ///
    /// The first collected error is returned; remaining errors are logged
    /// and dropped. A scheduler has exactly one scope.
    pub fn scope<F, R>(self, f: F) -> Result<R, RuntimeError>
    where
        F: FnOnce(&SchedulerContext) -> R,
    {
        {
            let state = self.core.state.lock();
            if state.active_tasks != 1 {
                return Err(RuntimeError::ScopeAlreadyEntered);
            }
        }
        let context = SchedulerContext {
            core: Arc::clone(&self.core),
        };
        let output = {
            let _guard = ContextGuard::enter(Arc::clone(&self.core));
            f(&context)
        };
        self.core.decr_active_tasks();
        self.core.wait_for_shutdown();

        let mut first = None;
        while let Ok(err) = self.core.err_receiver.try_recv() {
            if first.is_none() {
                first = Some(err);
            } else {
                log::error!("scheduler: additional error dropped at scope exit: {}", err);
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(output),
        }
    }

    /// Stops the scheduler without waiting for queued work. Idempotent.
    pub fn stop(&self) {
        self.core.stop();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.core.stop();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("scheduler: a runtime thread panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_scheduler_traits() {
        static_assertions::assert_impl_all!(Scheduler: Send, Sync);
        static_assertions::assert_impl_all!(Task: Send, Sync, Clone);
    }

    #[test]
    fn builder_defaults() {
        let builder = SchedulerBuilder::new();
        assert_eq!(builder.n_threads, 4);
        assert_eq!(builder.period, Duration::from_millis(10));
        assert_eq!(builder.max_worker_queue_depth, 2);
    }

    #[test]
    fn repeated_stop_is_idempotent() {
        let scheduler = Scheduler::builder().n_threads(1).build();
        scheduler.stop();
        scheduler.stop();
    }
}
