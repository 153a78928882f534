use std::fmt;

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

use crate::device::{Device, ResourceMap};
use crate::error::RuntimeError;

/// Tolerance for float drift when checking the capacity bound.
const CAPACITY_SLACK: f64 = 1e-9;

/// Thread-safe multi-resource accounting for a set of devices.
///
/// Availability starts at `capacity * multiplier` per resource and must
/// stay within `0..=capacity * multiplier` at all times. The committed
/// pool (multiplier 1) models actual occupancy; the reserved pool
/// (multiplier = max worker queue depth) models the admission window.
pub(crate) struct ResourcePool {
    multiplier: f64,
    state: Mutex<PoolState>,
    available: Condvar,
}

struct PoolState {
    entries: HashMap<usize, PoolEntry>,
    closed: bool,
}

struct PoolEntry {
    device: Device,
    avail: ResourceMap,
}

impl ResourcePool {
    pub fn new(devices: &[Device], multiplier: f64) -> Self {
        let entries = devices
            .iter()
            .map(|device| {
                let avail = device
                    .resources()
                    .iter()
                    .map(|(name, amount)| (name.clone(), amount * multiplier))
                    .collect();
                (
                    device.id(),
                    PoolEntry {
                        device: device.clone(),
                        avail,
                    },
                )
            })
            .collect();
        Self {
            multiplier,
            state: Mutex::new(PoolState {
                entries,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Atomically acquires every resource in `resources` on `device`.
    ///
    /// All-or-nothing: either every named resource is decremented under
    /// one critical section, or none is. With `blocking` the call waits
    /// on the pool until the request is satisfiable and only fails if the
    /// pool is closed; otherwise insufficiency yields `Ok(false)`.
    pub fn allocate(
        &self,
        device: &Device,
        resources: &ResourceMap,
        blocking: bool,
    ) -> Result<bool, RuntimeError> {
        let mut state = self.state.lock();
        loop {
            {
                let entry = state
                    .entries
                    .get_mut(&device.id())
                    .ok_or_else(|| RuntimeError::UnknownDevice(device.name().to_owned()))?;
                let mut satisfied = true;
                for (name, amount) in resources {
                    let avail =
                        entry
                            .avail
                            .get(name)
                            .ok_or_else(|| RuntimeError::InvalidResource {
                                device: device.name().to_owned(),
                                resource: name.clone(),
                            })?;
                    if *avail < *amount {
                        satisfied = false;
                        break;
                    }
                }
                if satisfied {
                    for (name, amount) in resources {
                        if let Some(avail) = entry.avail.get_mut(name) {
                            *avail -= *amount;
                        }
                    }
                    return Ok(true);
                }
            }
            if !blocking {
                return Ok(false);
            }
            if state.closed {
                return Err(RuntimeError::SchedulerStopped);
            }
            self.available.wait(&mut state);
        }
    }

    /// Releases previously acquired resources. Never blocks; wakes every
    /// waiter. Exceeding `capacity * multiplier` is a fatal accounting
    /// violation.
    pub fn deallocate(&self, device: &Device, resources: &ResourceMap) -> Result<(), RuntimeError> {
        let multiplier = self.multiplier;
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(&device.id())
            .ok_or_else(|| RuntimeError::UnknownDevice(device.name().to_owned()))?;
        for (name, amount) in resources {
            let invalid = || RuntimeError::InvalidResource {
                device: device.name().to_owned(),
                resource: name.clone(),
            };
            let capacity = entry.device.resource(name).ok_or_else(invalid)?;
            let avail = entry.avail.get_mut(name).ok_or_else(invalid)?;
            *avail += *amount;
            if *avail > capacity * multiplier + CAPACITY_SLACK {
                return Err(RuntimeError::ResourceInvariant {
                    device: device.name().to_owned(),
                    resource: name.clone(),
                });
            }
        }
        self.available.notify_all();
        Ok(())
    }

    /// Marks the pool shut and wakes all blocked allocations so they can
    /// observe shutdown.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.available.notify_all();
    }

    #[cfg(test)]
    fn available(&self, device: &Device, resource: &str) -> Option<f64> {
        self.state
            .lock()
            .entries
            .get(&device.id())
            .and_then(|entry| entry.avail.get(resource).copied())
    }
}

impl fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.state.lock();
        let mut map = f.debug_map();
        for entry in state.entries.values() {
            map.entry(&entry.device.name(), &entry.avail);
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::register_device;
    use crate::resources;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn device(name: &str) -> Device {
        register_device(name, resources! { "cores" => 4.0, "memory" => 16.0 })
    }

    #[test]
    fn allocate_deallocate_round_trip() {
        let d = device("pool-test:roundtrip");
        let pool = ResourcePool::new(&[d.clone()], 1.0);
        let req = resources! { "cores" => 2.0, "memory" => 8.0 };
        assert_eq!(pool.allocate(&d, &req, false).unwrap(), true);
        assert_eq!(pool.available(&d, "cores"), Some(2.0));
        pool.deallocate(&d, &req).unwrap();
        assert_eq!(pool.available(&d, "cores"), Some(4.0));
        assert_eq!(pool.available(&d, "memory"), Some(16.0));
    }

    #[test]
    fn insufficient_allocation_is_all_or_nothing() {
        let d = device("pool-test:atomic");
        let pool = ResourcePool::new(&[d.clone()], 1.0);
        // memory is insufficient, so cores must be untouched too
        let req = resources! { "cores" => 1.0, "memory" => 32.0 };
        assert_eq!(pool.allocate(&d, &req, false).unwrap(), false);
        assert_eq!(pool.available(&d, "cores"), Some(4.0));
    }

    #[test]
    fn unknown_resource_is_fatal() {
        let d = device("pool-test:unknown-resource");
        let pool = ResourcePool::new(&[d.clone()], 1.0);
        let err = pool
            .allocate(&d, &resources! { "gpus" => 1.0 }, false)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidResource { .. }));
    }

    #[test]
    fn unknown_device_is_fatal() {
        let tracked = device("pool-test:tracked");
        let stranger = device("pool-test:stranger");
        let pool = ResourcePool::new(&[tracked], 1.0);
        let err = pool
            .allocate(&stranger, &resources! { "cores" => 1.0 }, false)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownDevice(_)));
    }

    #[test]
    fn over_deallocation_violates_accounting() {
        let d = device("pool-test:overdealloc");
        let pool = ResourcePool::new(&[d.clone()], 1.0);
        let err = pool
            .deallocate(&d, &resources! { "cores" => 1.0 })
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ResourceInvariant { .. }));
    }

    #[test]
    fn multiplier_scales_capacity() {
        let d = device("pool-test:multiplier");
        let pool = ResourcePool::new(&[d.clone()], 2.0);
        assert_eq!(
            pool.allocate(&d, &resources! { "cores" => 8.0 }, false).unwrap(),
            true
        );
        assert_eq!(pool.available(&d, "cores"), Some(0.0));
    }

    #[test]
    fn blocked_allocation_wakes_on_deallocate() {
        let d = device("pool-test:wakeup");
        let pool = Arc::new(ResourcePool::new(&[d.clone()], 1.0));
        let req = resources! { "cores" => 4.0 };
        assert!(pool.allocate(&d, &resources! { "cores" => 2.0 }, false).unwrap());

        let waiter = {
            let pool = Arc::clone(&pool);
            let d = d.clone();
            let req = req.clone();
            thread::spawn(move || pool.allocate(&d, &req, true))
        };
        thread::sleep(Duration::from_millis(20));
        pool.deallocate(&d, &resources! { "cores" => 2.0 }).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), true);
    }

    #[test]
    fn close_releases_blocked_allocations() {
        let d = device("pool-test:close");
        let pool = Arc::new(ResourcePool::new(&[d.clone()], 1.0));
        let waiter = {
            let pool = Arc::clone(&pool);
            let d = d.clone();
            thread::spawn(move || pool.allocate(&d, &resources! { "cores" => 8.0 }, true))
        };
        thread::sleep(Duration::from_millis(20));
        pool.close();
        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, RuntimeError::SchedulerStopped));
    }
}
