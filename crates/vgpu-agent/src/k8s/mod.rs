//! Kubernetes integration.
//!
//! - [`PodSitter`]: cached pod lookups for this node plus deletion events
//! - [`AssumedAnnotations`]: reads the scheduler's GPU assignment from pods
//! - [`kube_client`]: client construction from kubeconfig or in-cluster config

use core::error::Error;

pub mod annotations;
pub mod kube_client;
pub mod sitter;

pub use annotations::AssumedAnnotations;
pub use sitter::DeletionHook;
pub use sitter::KubePodSitter;
pub use sitter::PodCache;
pub use sitter::PodDeleted;
pub use sitter::PodLookup;
pub use sitter::PodSitter;

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, derive_more::Display)]
pub enum KubernetesError {
    #[display("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[display("Failed to watch pods: {message}")]
    WatchFailed { message: String },
    #[display("Kubernetes API request failed: {message}")]
    RequestFailed { message: String },
}

impl Error for KubernetesError {}
