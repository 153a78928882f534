use std::any::Any;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;

use crate::context::DeviceBinding;
use crate::device::Device;
use crate::error::{BodyError, RuntimeError};
use crate::requirements::Requirements;
use crate::scheduler::SchedulerCore;

/// Value produced by a completed task. Downcast through `std::any`.
pub type TaskValue = Arc<dyn Any + Send + Sync>;

/// One step of a task body. Receives the task's own handle; arguments are
/// captured by the closure.
pub type TaskBody = Box<dyn FnOnce(&Task) -> Result<TaskStep, BodyError> + Send>;

/// Opaque task identity used for logging and bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Outcome of one body step.
pub enum TaskStep {
    /// The task is finished, optionally with a value.
    Done(Option<TaskValue>),
    /// Suspend until every task in `dependencies` is terminal, then run
    /// `resume`. The scheduler treats this like a freshly waiting task;
    /// devices are re-assigned from scratch.
    Await {
        dependencies: Vec<Task>,
        resume: TaskBody,
    },
}

impl TaskStep {
    pub fn done() -> TaskStep {
        TaskStep::Done(None)
    }

    pub fn done_with<V: Any + Send + Sync>(value: V) -> TaskStep {
        TaskStep::Done(Some(Arc::new(value)))
    }

    pub fn await_then<F>(dependencies: Vec<Task>, resume: F) -> TaskStep
    where
        F: FnOnce(&Task) -> Result<TaskStep, BodyError> + Send + 'static,
    {
        TaskStep::Await {
            dependencies,
            resume: Box::new(resume),
        }
    }
}

/// Current position of a task in its lifecycle. `Completed` and `Failed`
/// are terminal.
pub(crate) enum TaskState {
    Running {
        body: Option<TaskBody>,
        /// Fresh dependency set carried by a continuation; consumed at
        /// the next scheduling step.
        dependencies: Option<Vec<Task>>,
    },
    Completed(Option<TaskValue>),
    Failed(RuntimeError),
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed(_) | TaskState::Failed(_))
    }
}

impl fmt::Debug for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TaskState::Running { dependencies, .. } => {
                let fresh = dependencies.as_ref().map(|deps| deps.len()).unwrap_or(0);
                write!(f, "Running({} fresh dependencies)", fresh)
            }
            TaskState::Completed(Some(_)) => write!(f, "Completed(<value>)"),
            TaskState::Completed(None) => write!(f, "Completed"),
            TaskState::Failed(err) => write!(f, "Failed({})", err),
        }
    }
}

/// Fields guarded by the task mutex.
pub(crate) struct TaskShared {
    pub state: TaskState,
    pub remaining_deps: usize,
    pub dependees: SmallVec<[Task; 4]>,
    pub req: Requirements,
    pub assigned: bool,
    pub assignment_tries: u32,
}

struct TaskInner {
    id: TaskId,
    sched: Arc<SchedulerCore>,
    shared: Mutex<TaskShared>,
}

/// Handle to a spawned task. Clones share the same underlying task.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    pub(crate) fn new(
        sched: Arc<SchedulerCore>,
        body: TaskBody,
        dependencies: Vec<Task>,
        id: TaskId,
        req: Requirements,
    ) -> Task {
        sched.incr_active_tasks();
        let task = Task {
            inner: Arc::new(TaskInner {
                id,
                sched,
                shared: Mutex::new(TaskShared {
                    state: TaskState::Running {
                        body: Some(body),
                        dependencies: None,
                    },
                    remaining_deps: 0,
                    dependees: SmallVec::new(),
                    req,
                    assigned: false,
                    assignment_tries: 0,
                }),
            }),
        };
        {
            let mut shared = task.inner.shared.lock();
            task.install_dependencies(&mut shared, dependencies);
            log::debug!(
                "{}: created ({} unmet dependencies)",
                task.inner.id,
                shared.remaining_deps
            );
            task.check_ready(&shared);
        }
        task
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// The completed value, or the stored error for a failed task. A task
    /// that is not yet terminal yields `Ok(None)`; callers are expected
    /// to depend on the task before asking.
    pub fn result(&self) -> Result<Option<TaskValue>, RuntimeError> {
        match &self.inner.shared.lock().state {
            TaskState::Completed(value) => Ok(value.clone()),
            TaskState::Failed(err) => Err(err.clone()),
            TaskState::Running { .. } => Ok(None),
        }
    }

    pub(crate) fn shared(&self) -> MutexGuard<TaskShared> {
        self.inner.shared.lock()
    }

    /// Sets the remaining-dependency counter and registers on each
    /// dependency, counting the already-terminal ones immediately.
    /// Caller holds the task mutex.
    fn install_dependencies(&self, shared: &mut TaskShared, dependencies: Vec<Task>) {
        shared.remaining_deps = dependencies.len();
        for dep in &dependencies {
            if !dep.add_dependee(self.clone()) {
                shared.remaining_deps -= 1;
            }
        }
    }

    /// Registers `dependee` for completion notification, unless this task
    /// is already terminal.
    pub(crate) fn add_dependee(&self, dependee: Task) -> bool {
        let mut shared = self.inner.shared.lock();
        if shared.state.is_terminal() {
            false
        } else {
            shared.dependees.push(dependee);
            true
        }
    }

    pub(crate) fn complete_dependency(&self) {
        let mut shared = self.inner.shared.lock();
        shared.remaining_deps -= 1;
        self.check_ready(&shared);
    }

    /// Enqueues on the scheduler's allocation queue once the counter hits
    /// zero. The counter reaches zero exactly once per ready generation,
    /// so the task is enqueued at most once. Caller holds the task mutex.
    fn check_ready(&self, shared: &TaskShared) {
        if shared.remaining_deps == 0 {
            log::info!("{}: ready, scheduling", self.inner.id);
            self.inner.sched.enqueue_task(self.clone());
        }
    }

    /// Runs one body step on the calling worker thread.
    ///
    /// Acquires committed resources on every assigned device (blocking),
    /// binds the devices to the thread for the body's duration, and on
    /// every exit path releases committed and reserved resources and
    /// clears the assignment before publishing the new state.
    pub(crate) fn run(&self) -> Result<(), RuntimeError> {
        let (body, req) = {
            let mut shared = self.inner.shared.lock();
            let req = match shared.req.as_exact() {
                Some(exact) if shared.assigned => exact.clone(),
                _ => return Err(RuntimeError::NotRunnable),
            };
            let body = match &mut shared.state {
                TaskState::Running { body, .. } => {
                    body.take().ok_or(RuntimeError::NotRunnable)?
                }
                _ => return Err(RuntimeError::NotRunnable),
            };
            (body, req)
        };

        let sched = &self.inner.sched;
        let mut held: SmallVec<[Device; 2]> = SmallVec::new();
        for device in req.devices() {
            match sched.committed().allocate(device, req.resources(), true) {
                Ok(_) => held.push(device.clone()),
                Err(err) => {
                    for device in &held {
                        let _ = sched.committed().deallocate(device, req.resources());
                    }
                    for device in req.devices() {
                        let _ = sched.reserved().deallocate(device, req.resources());
                    }
                    return Err(err);
                }
            }
        }

        let outcome = {
            let _binding = DeviceBinding::enter(req.devices());
            panic::catch_unwind(AssertUnwindSafe(|| body(self)))
        };

        let new_state = match outcome {
            Ok(Ok(TaskStep::Done(value))) => TaskState::Completed(value),
            Ok(Ok(TaskStep::Await {
                dependencies,
                resume,
            })) => TaskState::Running {
                body: Some(resume),
                dependencies: Some(dependencies),
            },
            Ok(Err(err)) => TaskState::Failed(RuntimeError::user(err)),
            Err(payload) => TaskState::Failed(RuntimeError::panicked(payload)),
        };

        for device in req.devices() {
            sched.committed().deallocate(device, req.resources())?;
            sched.reserved().deallocate(device, req.resources())?;
        }
        self.inner.shared.lock().assigned = false;
        self.set_state(new_state);
        Ok(())
    }

    /// Publishes a state transition.
    ///
    /// A failure is forwarded to the scheduler's error collector. A fresh
    /// `Running` state installs its dependency set and re-runs the ready
    /// check. A terminal state notifies every dependee outside the task
    /// mutex and releases this task's active count.
    pub(crate) fn set_state(&self, new_state: TaskState) {
        log::info!("{}: -> {:?}", self.inner.id, new_state);
        if let TaskState::Failed(err) = &new_state {
            self.inner.sched.report_error(err.clone());
        }
        let notified = {
            let mut shared = self.inner.shared.lock();
            shared.state = new_state;
            let fresh = match &mut shared.state {
                TaskState::Running { dependencies, .. } => dependencies.take(),
                _ => None,
            };
            if let Some(dependencies) = fresh {
                self.install_dependencies(&mut shared, dependencies);
                self.check_ready(&shared);
                None
            } else if shared.state.is_terminal() {
                Some(mem::take(&mut shared.dependees))
            } else {
                None
            }
        };
        if let Some(dependees) = notified {
            for dependee in dependees {
                dependee.complete_dependency();
            }
            self.inner.sched.decr_active_tasks();
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.shared.try_lock() {
            Some(shared) => write!(
                f,
                "Task({}, state={:?}, unmet={})",
                self.inner.id, shared.state, shared.remaining_deps
            ),
            None => write!(f, "Task({}, <locked>)", self.inner.id),
        }
    }
}
