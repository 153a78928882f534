use smallvec::SmallVec;

use crate::device::{Device, ResourceMap};

pub(crate) type DeviceVec = SmallVec<[Device; 2]>;

/// Resource demands against an explicit list of candidate devices, of
/// which `ndevices` must be acquired.
#[derive(Clone, Debug)]
pub struct DeviceSetRequirements {
    resources: ResourceMap,
    ndevices: usize,
    devices: DeviceVec,
}

impl DeviceSetRequirements {
    /// # Panics
    /// If `ndevices` is zero or exceeds the candidate list.
    pub fn new(resources: ResourceMap, ndevices: usize, devices: Vec<Device>) -> Self {
        assert!(ndevices >= 1, "a requirement must ask for at least one device");
        assert!(
            devices.len() >= ndevices,
            "fewer candidate devices than requested"
        );
        Self {
            resources,
            ndevices,
            devices: devices.into_iter().collect(),
        }
    }

    pub fn resources(&self) -> &ResourceMap {
        &self.resources
    }

    pub fn ndevices(&self) -> usize {
        self.ndevices
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// True once the candidate list has been narrowed to exactly the
    /// requested device count.
    pub fn exact(&self) -> bool {
        self.devices.len() == self.ndevices
    }

    pub(crate) fn narrowed(&self, selected: DeviceVec) -> Self {
        debug_assert_eq!(selected.len(), self.ndevices);
        Self {
            resources: self.resources.clone(),
            ndevices: self.ndevices,
            devices: selected,
        }
    }
}

/// A disjunction of candidate device sets, tried in declared order. The
/// scheduler keeps the first option it can fully satisfy.
#[derive(Clone, Debug)]
pub struct OptionsRequirements {
    resources: ResourceMap,
    ndevices: usize,
    options: Vec<Vec<Device>>,
}

impl OptionsRequirements {
    /// # Panics
    /// If `options` is empty or any option is smaller than `ndevices`.
    pub fn new(resources: ResourceMap, ndevices: usize, options: Vec<Vec<Device>>) -> Self {
        assert!(ndevices >= 1, "a requirement must ask for at least one device");
        assert!(!options.is_empty(), "an options requirement needs at least one option");
        assert!(
            options.iter().all(|option| option.len() >= ndevices),
            "an option offers fewer candidate devices than requested"
        );
        Self {
            resources,
            ndevices,
            options,
        }
    }
}

/// A task's resource requirement, either a concrete candidate set or a
/// disjunction of them. The scheduler only ever walks `possibilities()`.
#[derive(Clone, Debug)]
pub enum Requirements {
    DeviceSet(DeviceSetRequirements),
    Options(OptionsRequirements),
}

impl Requirements {
    /// Candidate device sets in the order the scheduler should try them.
    pub fn possibilities(&self) -> Possibilities {
        let inner = match self {
            Requirements::DeviceSet(req) => PossibilitiesInner::Single(Some(req)),
            Requirements::Options(req) => PossibilitiesInner::Options { req, next: 0 },
        };
        Possibilities { inner }
    }

    pub(crate) fn as_exact(&self) -> Option<&DeviceSetRequirements> {
        match self {
            Requirements::DeviceSet(req) if req.exact() => Some(req),
            _ => None,
        }
    }
}

impl From<DeviceSetRequirements> for Requirements {
    fn from(req: DeviceSetRequirements) -> Self {
        Requirements::DeviceSet(req)
    }
}

impl From<OptionsRequirements> for Requirements {
    fn from(req: OptionsRequirements) -> Self {
        Requirements::Options(req)
    }
}

pub struct Possibilities<'a> {
    inner: PossibilitiesInner<'a>,
}

enum PossibilitiesInner<'a> {
    Single(Option<&'a DeviceSetRequirements>),
    Options {
        req: &'a OptionsRequirements,
        next: usize,
    },
}

impl<'a> Iterator for Possibilities<'a> {
    type Item = DeviceSetRequirements;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            PossibilitiesInner::Single(slot) => slot.take().cloned(),
            PossibilitiesInner::Options { req, next } => {
                let devices = req.options.get(*next)?;
                *next += 1;
                Some(DeviceSetRequirements {
                    resources: req.resources.clone(),
                    ndevices: req.ndevices,
                    devices: devices.iter().cloned().collect(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::register_device;
    use crate::resources;

    fn devices(n: usize) -> Vec<Device> {
        (0..n)
            .map(|i| register_device(format!("req-test:{}", i), resources! { "cores" => 1.0 }))
            .collect()
    }

    #[test]
    fn device_set_exactness() {
        let devs = devices(3);
        let wide = DeviceSetRequirements::new(resources! { "cores" => 1.0 }, 1, devs.clone());
        assert!(!wide.exact());
        let exact = DeviceSetRequirements::new(resources! { "cores" => 1.0 }, 3, devs);
        assert!(exact.exact());
    }

    #[test]
    fn possibilities_preserve_declared_order() {
        let devs = devices(3);
        let req = Requirements::from(OptionsRequirements::new(
            resources! { "cores" => 1.0 },
            1,
            vec![vec![devs[2].clone()], vec![devs[0].clone(), devs[1].clone()]],
        ));
        let options: Vec<_> = req.possibilities().collect();
        assert_eq!(options.len(), 2);
        assert_eq!(options[0].devices(), &[devs[2].clone()][..]);
        assert_eq!(options[1].devices(), &[devs[0].clone(), devs[1].clone()][..]);
    }

    #[test]
    fn device_set_is_its_own_single_possibility() {
        let devs = devices(2);
        let req = Requirements::from(DeviceSetRequirements::new(
            resources! { "cores" => 1.0 },
            1,
            devs,
        ));
        assert_eq!(req.possibilities().count(), 1);
    }
}
