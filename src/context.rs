//! Thread-local bindings for the current scheduler and the devices
//! assigned to the running task. Handles are passed explicitly inside
//! the runtime; these stacks exist only at the public API boundary.

use std::cell::RefCell;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::device::Device;
use crate::error::{BodyError, RuntimeError};
use crate::requirements::Requirements;
use crate::scheduler::SchedulerCore;
use crate::task::{Task, TaskBody, TaskId, TaskStep};

thread_local! {
    static SCHEDULER_STACK: RefCell<Vec<Arc<SchedulerCore>>> = RefCell::new(Vec::new());
    static DEVICE_STACK: RefCell<Vec<SmallVec<[Device; 2]>>> = RefCell::new(Vec::new());
}

/// Handle to the scheduler owning the current scope. Cloneable; spawning
/// through it is valid for as long as the scope is open.
#[derive(Clone, Debug)]
pub struct SchedulerContext {
    pub(crate) core: Arc<SchedulerCore>,
}

impl SchedulerContext {
    /// Spawns a task with an explicit id. The task waits for
    /// `dependencies`, then runs `body` on devices satisfying `req`.
    pub fn spawn_task<F>(
        &self,
        body: F,
        dependencies: Vec<Task>,
        taskid: TaskId,
        req: impl Into<Requirements>,
    ) -> Task
    where
        F: FnOnce(&Task) -> Result<TaskStep, BodyError> + Send + 'static,
    {
        Task::new(
            Arc::clone(&self.core),
            Box::new(body) as TaskBody,
            dependencies,
            taskid,
            req.into(),
        )
    }

    /// Spawns a task with a scheduler-allocated id.
    pub fn spawn<F>(&self, dependencies: Vec<Task>, req: impl Into<Requirements>, body: F) -> Task
    where
        F: FnOnce(&Task) -> Result<TaskStep, BodyError> + Send + 'static,
    {
        let taskid = self.core.next_task_id();
        self.spawn_task(body, dependencies, taskid, req)
    }
}

/// The scheduler bound to the calling thread: the enclosing scope on a
/// user thread, or the owning scheduler inside a task body.
pub fn current_context() -> Result<SchedulerContext, RuntimeError> {
    SCHEDULER_STACK.with(|stack| {
        stack
            .borrow()
            .last()
            .cloned()
            .map(|core| SchedulerContext { core })
            .ok_or(RuntimeError::NoSchedulerInContext)
    })
}

/// The devices assigned to the task running on the calling thread.
pub fn current_devices() -> Result<Vec<Device>, RuntimeError> {
    DEVICE_STACK.with(|stack| {
        stack
            .borrow()
            .last()
            .map(|devices| devices.iter().cloned().collect())
            .ok_or(RuntimeError::NoDeviceInContext)
    })
}

/// Spawns through the current scheduler context.
pub fn spawn<F>(
    dependencies: Vec<Task>,
    req: impl Into<Requirements>,
    body: F,
) -> Result<Task, RuntimeError>
where
    F: FnOnce(&Task) -> Result<TaskStep, BodyError> + Send + 'static,
{
    Ok(current_context()?.spawn(dependencies, req, body))
}

/// Spawns with an explicit id through the current scheduler context.
pub fn spawn_task<F>(
    body: F,
    dependencies: Vec<Task>,
    taskid: TaskId,
    req: impl Into<Requirements>,
) -> Result<Task, RuntimeError>
where
    F: FnOnce(&Task) -> Result<TaskStep, BodyError> + Send + 'static,
{
    Ok(current_context()?.spawn_task(body, dependencies, taskid, req))
}

pub(crate) struct ContextGuard;

impl ContextGuard {
    pub fn enter(core: Arc<SchedulerCore>) -> ContextGuard {
        SCHEDULER_STACK.with(|stack| stack.borrow_mut().push(core));
        ContextGuard
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        SCHEDULER_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

pub(crate) struct DeviceBinding;

impl DeviceBinding {
    pub fn enter(devices: &[Device]) -> DeviceBinding {
        DEVICE_STACK.with(|stack| stack.borrow_mut().push(devices.iter().cloned().collect()));
        DeviceBinding
    }
}

impl Drop for DeviceBinding {
    fn drop(&mut self) {
        DEVICE_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_fail_outside_any_scope() {
        assert!(matches!(
            current_context().unwrap_err(),
            RuntimeError::NoSchedulerInContext
        ));
        assert!(matches!(
            current_devices().unwrap_err(),
            RuntimeError::NoDeviceInContext
        ));
    }
}
