//! Node agent serving virtual GPU resources to the kubelet.
//!
//! The kubelet hands out opaque device IDs; at PreStart the agent finds the
//! container holding them, reads the GPU indices the scheduler assumed for it
//! and creates virtual devices on the host. Bindings are persisted so devices
//! survive agent restarts, and reclaimed once their pod is gone.

pub mod config;
pub mod device_plugin;
pub mod fingerprint;
pub mod gc;
pub mod k8s;
pub mod locator;
pub mod logging;
pub mod manager;
pub mod operator;
pub mod plugin;
pub mod store;
pub mod syncer;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;
pub mod uds;
pub mod version;
