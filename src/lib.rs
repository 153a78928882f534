//! A heterogeneous task-parallel runtime.
//!
//! Tasks declare per-device resource requirements; a two-stage scheduler
//! narrows each requirement to a concrete device set against a reserved
//! admission pool, then dispatches onto a fixed pool of worker threads,
//! which acquire the committed occupancy pool before running the body.
//! Tasks may depend on other tasks and may suspend on a fresh dependency
//! set mid-body (a continuation), resuming once those tasks finish.
//!
//! ```no_run
//! use ratchet::{register_device, resources, DeviceSetRequirements, Scheduler, TaskStep};
//!
//! let cpu = register_device("cpu:0", resources! { "cores" => 4.0 });
//! let req = DeviceSetRequirements::new(resources! { "cores" => 1.0 }, 1, vec![cpu]);
//! Scheduler::new(2)
//!     .scope(|ctx| {
//!         ctx.spawn(vec![], req, |_task| {
//!             println!("hello from a task");
//!             Ok(TaskStep::done())
//!         });
//!     })
//!     .unwrap();
//! ```

mod context;
mod device;
mod error;
mod requirements;
mod resources;
mod scheduler;
mod task;

pub use context::{current_context, current_devices, spawn, spawn_task, SchedulerContext};
pub use device::{all_devices, register_device, Device, ResourceMap};
pub use error::{BodyError, RuntimeError};
pub use requirements::{DeviceSetRequirements, OptionsRequirements, Possibilities, Requirements};
pub use scheduler::{Scheduler, SchedulerBuilder};
pub use task::{Task, TaskBody, TaskId, TaskStep, TaskValue};

/// Builds a [`ResourceMap`] from `name => amount` pairs.
#[macro_export]
macro_rules! resources {
    () => { $crate::ResourceMap::default() };
    ($($name:expr => $amount:expr),+ $(,)?) => {{
        let mut map = $crate::ResourceMap::default();
        $( map.insert(::std::string::String::from($name), $amount as f64); )+
        map
    }};
}
