//! Device/resource bookkeeping for provisioning and teardown.
//!
//! Every device the control plane asks the hypervisor (or the host network
//! layer) to attach or detach is recorded as pending until its confirmation
//! event arrives. A phase is complete when nothing is pending.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Identity of one tracked device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceKey {
    /// Container rootfs image, by container index.
    Container(usize),
    Volume(String),
    BlockDevice(String),
    /// Network interface, by interface index.
    Network(usize),
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKey::Container(i) => write!(f, "container#{}", i),
            DeviceKey::Volume(name) => write!(f, "volume:{}", name),
            DeviceKey::BlockDevice(name) => write!(f, "blockdev:{}", name),
            DeviceKey::Network(i) => write!(f, "interface#{}", i),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSet {
    pub containers: BTreeSet<usize>,
    pub volumes: BTreeSet<String>,
    pub blockdevs: BTreeSet<String>,
    pub networks: BTreeSet<usize>,
}

impl DeviceSet {
    fn insert(&mut self, key: &DeviceKey) -> bool {
        match key {
            DeviceKey::Container(i) => self.containers.insert(*i),
            DeviceKey::Volume(n) => self.volumes.insert(n.clone()),
            DeviceKey::BlockDevice(n) => self.blockdevs.insert(n.clone()),
            DeviceKey::Network(i) => self.networks.insert(*i),
        }
    }

    fn remove(&mut self, key: &DeviceKey) -> bool {
        match key {
            DeviceKey::Container(i) => self.containers.remove(i),
            DeviceKey::Volume(n) => self.volumes.remove(n),
            DeviceKey::BlockDevice(n) => self.blockdevs.remove(n),
            DeviceKey::Network(i) => self.networks.remove(i),
        }
    }

    pub fn contains(&self, key: &DeviceKey) -> bool {
        match key {
            DeviceKey::Container(i) => self.containers.contains(i),
            DeviceKey::Volume(n) => self.volumes.contains(n),
            DeviceKey::BlockDevice(n) => self.blockdevs.contains(n),
            DeviceKey::Network(i) => self.networks.contains(i),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
            && self.volumes.is_empty()
            && self.blockdevs.is_empty()
            && self.networks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.containers.len() + self.volumes.len() + self.blockdevs.len() + self.networks.len()
    }

    fn clear(&mut self) {
        *self = DeviceSet::default();
    }
}

/// Result of confirming a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// The key was not pending; nothing changed.
    NotPending,
    Added {
        /// The last pending network interface just attached.
        networks_settled: bool,
    },
    Removed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceTracker {
    adding: DeviceSet,
    deleting: DeviceSet,
    finished: DeviceSet,
}

impl DeviceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_adding(&mut self, key: DeviceKey) {
        self.deleting.remove(&key);
        self.finished.remove(&key);
        self.adding.insert(&key);
    }

    pub fn mark_deleting(&mut self, key: DeviceKey) {
        self.adding.remove(&key);
        self.finished.remove(&key);
        self.deleting.insert(&key);
    }

    /// Move a pending key to `finished`.
    ///
    /// Confirming a key that is not pending (a duplicate or late event) is
    /// logged and otherwise ignored.
    pub fn confirm(&mut self, key: &DeviceKey) -> Confirmation {
        if self.adding.contains(key) {
            let networks_before = self.adding.networks.len();
            self.adding.remove(key);
            self.finished.insert(key);
            let networks_settled = matches!(key, DeviceKey::Network(_))
                && networks_before == 1
                && self.adding.networks.is_empty();
            return Confirmation::Added { networks_settled };
        }

        if self.deleting.remove(key) {
            self.finished.insert(key);
            return Confirmation::Removed;
        }

        tracing::debug!(device = %key, "Ignoring confirmation for device that is not pending");
        Confirmation::NotPending
    }

    pub fn is_ready(&self) -> bool {
        self.adding.is_empty() && self.deleting.is_empty()
    }

    pub fn is_adding(&self, key: &DeviceKey) -> bool {
        self.adding.contains(key)
    }

    pub fn is_deleting(&self, key: &DeviceKey) -> bool {
        self.deleting.contains(key)
    }

    pub fn is_finished(&self, key: &DeviceKey) -> bool {
        self.finished.contains(key)
    }

    pub fn pending(&self) -> usize {
        self.adding.len() + self.deleting.len()
    }

    pub fn adding(&self) -> &DeviceSet {
        &self.adding
    }

    pub fn deleting(&self) -> &DeviceSet {
        &self.deleting
    }

    pub fn finished(&self) -> &DeviceSet {
        &self.finished
    }

    pub fn reset(&mut self) {
        self.adding.clear();
        self.deleting.clear();
        self.finished.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_only_when_nothing_pending() {
        let mut tracker = DeviceTracker::new();
        assert!(tracker.is_ready());

        tracker.mark_adding(DeviceKey::BlockDevice("img".into()));
        tracker.mark_deleting(DeviceKey::Volume("data".into()));
        assert!(!tracker.is_ready());

        tracker.confirm(&DeviceKey::BlockDevice("img".into()));
        assert!(!tracker.is_ready());
        tracker.confirm(&DeviceKey::Volume("data".into()));
        assert!(tracker.is_ready());
        assert_eq!(tracker.finished().len(), 2);
    }

    #[test]
    fn test_key_in_one_pending_set_at_a_time() {
        let mut tracker = DeviceTracker::new();
        let key = DeviceKey::Network(0);
        tracker.mark_adding(key.clone());
        tracker.mark_deleting(key.clone());
        assert!(!tracker.is_adding(&key));
        assert!(tracker.is_deleting(&key));
        assert_eq!(tracker.pending(), 1);
    }

    #[test]
    fn test_confirm_twice_is_noop() {
        let mut tracker = DeviceTracker::new();
        let key = DeviceKey::Container(1);
        tracker.mark_deleting(key.clone());
        assert_eq!(tracker.confirm(&key), Confirmation::Removed);

        let before = tracker.clone();
        assert_eq!(tracker.confirm(&key), Confirmation::NotPending);
        assert_eq!(tracker, before);
    }

    #[test]
    fn test_networks_settle_exactly_once() {
        let mut tracker = DeviceTracker::new();
        tracker.mark_adding(DeviceKey::Network(0));
        tracker.mark_adding(DeviceKey::Network(1));
        tracker.mark_adding(DeviceKey::BlockDevice("img".into()));

        assert_eq!(
            tracker.confirm(&DeviceKey::Network(1)),
            Confirmation::Added {
                networks_settled: false
            }
        );
        assert_eq!(
            tracker.confirm(&DeviceKey::Network(0)),
            Confirmation::Added {
                networks_settled: true
            }
        );
        assert_eq!(
            tracker.confirm(&DeviceKey::BlockDevice("img".into())),
            Confirmation::Added {
                networks_settled: false
            }
        );
        assert_eq!(
            tracker.confirm(&DeviceKey::Network(0)),
            Confirmation::NotPending
        );
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut tracker = DeviceTracker::new();
        tracker.mark_adding(DeviceKey::Network(0));
        tracker.confirm(&DeviceKey::Network(0));
        tracker.mark_deleting(DeviceKey::Volume("v".into()));
        tracker.reset();
        assert!(tracker.is_ready());
        assert!(tracker.finished().is_empty());
    }
}
