//! Records shared between the binder, the binding store and the GC loop.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::fingerprint::DeviceFingerprint;

/// Durable link between one container and the physical GPUs it was granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// Physical GPU indices, in annotation order. The position of an index is
    /// the ordinal used to name its virtual device.
    pub indices: Vec<u32>,
    /// Requested quantities of the plugin's resources, keyed by resource name.
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
    pub fingerprint: DeviceFingerprint,
}

impl Binding {
    /// `(physical index, virtual device id)` for every device this binding owns.
    pub fn devices(&self) -> impl Iterator<Item = (u32, String)> + '_ {
        self.indices
            .iter()
            .enumerate()
            .map(|(ordinal, index)| (*index, self.fingerprint.binding_id(ordinal)))
    }
}

/// All bindings of one pod. Stored and deleted as a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodRecord {
    pub namespace: String,
    pub name: String,
    pub containers: BTreeMap<String, Binding>,
}

impl PodRecord {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            containers: BTreeMap::new(),
        }
    }
}

/// The container that currently holds a device set, as reported by the kubelet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerRef {
    pub namespace: String,
    pub name: String,
    pub container: String,
}

impl OwnerRef {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            container: container.into(),
        }
    }
}

impl fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.name, self.container)
    }
}
