use std::any::Any;
use std::error::Error;
use std::sync::Arc;

use thiserror::Error;

/// Error type produced by user task bodies.
pub type BodyError = Box<dyn Error + Send + Sync>;

/// Errors surfaced by the runtime, either through [`Task::result`] or at
/// scheduler scope exit.
///
/// [`Task::result`]: crate::Task::result
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    /// A task body returned an error. Stored on the task and forwarded to
    /// the scheduler's error collector.
    #[error("task failed: {0}")]
    UserTask(Arc<BodyError>),
    /// A task body panicked. The payload is reduced to its message.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// A request named a resource the device does not have.
    #[error("device `{device}` has no resource `{resource}`")]
    InvalidResource { device: String, resource: String },
    /// A request named a device the pool does not track.
    #[error("device `{0}` is not tracked by this pool")]
    UnknownDevice(String),
    /// Resource accounting left its `0..=capacity` bounds. Fatal: the
    /// scheduler stops.
    #[error("accounting for resource `{resource}` on device `{device}` went out of bounds")]
    ResourceInvariant { device: String, resource: String },
    #[error("no scheduler is available in this context")]
    NoSchedulerInContext,
    #[error("no devices are bound in this context")]
    NoDeviceInContext,
    #[error("a scheduler can only enter a single scope")]
    ScopeAlreadyEntered,
    /// Shutdown was observed by a blocking primitive.
    #[error("the scheduler is shutting down")]
    SchedulerStopped,
    /// A task was handed to a worker in a state it cannot run from.
    #[error("task is not in a runnable state")]
    NotRunnable,
}

impl RuntimeError {
    pub(crate) fn user(err: BodyError) -> Self {
        RuntimeError::UserTask(Arc::new(err))
    }

    pub(crate) fn panicked(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "opaque panic payload".to_owned()
        };
        RuntimeError::Panicked(message)
    }
}
