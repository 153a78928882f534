use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use hashbrown::HashMap;
use lazy_static::lazy_static;
use parking_lot::Mutex;

/// Named, additive resource quantities (e.g. `{cores: 4, memory: 8e9}`).
pub type ResourceMap = HashMap<String, f64>;

/// An abstract execution target carrying named resource capacities.
///
/// Devices are immutable, cheap to clone, and compared by registry
/// identity.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    id: usize,
    name: String,
    resources: ResourceMap,
}

impl Device {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Capacity per named resource.
    pub fn resources(&self) -> &ResourceMap {
        &self.inner.resources
    }

    pub fn resource(&self, name: &str) -> Option<f64> {
        self.inner.resources.get(name).copied()
    }

    pub(crate) fn id(&self) -> usize {
        self.inner.id
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Device {}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Device({})", self.inner.name)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.inner.name)
    }
}

lazy_static! {
    /// Process-wide device inventory.
    static ref REGISTRY: Mutex<Vec<Device>> = Mutex::new(Vec::new());
}

/// Returns the device registered under `name`, creating it with the given
/// capacities if it does not exist yet. An existing registration wins.
pub fn register_device(name: impl Into<String>, resources: ResourceMap) -> Device {
    let name = name.into();
    let mut registry = REGISTRY.lock();
    if let Some(existing) = registry.iter().find(|d| d.name() == name) {
        return existing.clone();
    }
    let device = Device {
        inner: Arc::new(DeviceInner {
            id: registry.len(),
            name,
            resources,
        }),
    };
    registry.push(device.clone());
    device
}

/// The static device inventory. Schedulers snapshot this at construction.
pub fn all_devices() -> Vec<Device> {
    REGISTRY.lock().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_idempotent() {
        let a = register_device("registry-test:a", crate::resources! { "cores" => 2.0 });
        let b = register_device("registry-test:a", crate::resources! { "cores" => 16.0 });
        assert_eq!(a, b);
        assert_eq!(b.resource("cores"), Some(2.0));
    }

    #[test]
    fn inventory_contains_registered_devices() {
        let d = register_device("registry-test:b", crate::resources! { "cores" => 1.0 });
        assert!(all_devices().contains(&d));
    }
}
