//! Generated gRPC bindings for the kubelet device-plugin and pod-resources APIs.

#![allow(clippy::doc_markdown)]

/// Device plugin API (`v1beta1`): the `DevicePlugin` service served by plugins
/// and the `Registration` service served by the kubelet.
pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

/// Pod resources API (`v1`) served by the kubelet on its pod-resources socket.
pub mod pod_resources {
    tonic::include_proto!("v1");
}

/// Version string sent in `RegisterRequest`.
pub const VERSION: &str = "v1beta1";

/// Health value reported for a usable device.
pub const HEALTHY: &str = "Healthy";

/// Health value reported for an unusable device.
pub const UNHEALTHY: &str = "Unhealthy";
