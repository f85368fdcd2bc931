use std::collections::BTreeMap;
use std::num::ParseIntError;

use k8s_openapi::api::core::v1::Pod;

/// Pod-level marker written by the scheduler once it has assumed GPUs for a pod.
pub const DEFAULT_ASSUMED_ANNOTATION: &str = "elastic-gpu/assume";

/// Prefix of the per-container annotation holding the assumed GPU indices.
pub const DEFAULT_CONTAINER_ANNOTATION_PREFIX: &str = "elastic-gpu/container-";

/// Keys of the annotations the GPU scheduler places on pods it has assumed.
///
/// The pod carries a marker annotation, and each GPU container gets
/// `<prefix><container name>` whose value is one physical GPU index or a
/// comma-separated list of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssumedAnnotations {
    pub pod_marker: String,
    pub container_prefix: String,
}

impl Default for AssumedAnnotations {
    fn default() -> Self {
        Self {
            pod_marker: DEFAULT_ASSUMED_ANNOTATION.to_string(),
            container_prefix: DEFAULT_CONTAINER_ANNOTATION_PREFIX.to_string(),
        }
    }
}

impl AssumedAnnotations {
    pub fn new(pod_marker: impl Into<String>, container_prefix: impl Into<String>) -> Self {
        Self {
            pod_marker: pod_marker.into(),
            container_prefix: container_prefix.into(),
        }
    }

    /// Whether the pod carries the scheduler's marker, whatever its value.
    pub fn is_assumed(&self, pod: &Pod) -> bool {
        annotations(pod).is_some_and(|a| a.contains_key(&self.pod_marker))
    }

    pub fn container_key(&self, container: &str) -> String {
        format!("{}{}", self.container_prefix, container)
    }

    /// Raw annotation value for `container`, if the scheduler assigned one.
    pub fn container_value<'a>(&self, pod: &'a Pod, container: &str) -> Option<&'a str> {
        annotations(pod)?
            .get(&self.container_key(container))
            .map(String::as_str)
    }
}

/// Parses `"2"` or `"0,1"` into physical GPU indices.
pub fn parse_indices(value: &str) -> Result<Vec<u32>, ParseIntError> {
    value
        .split(',')
        .map(|item| item.trim().parse::<u32>())
        .collect()
}

fn annotations(pod: &Pod) -> Option<&BTreeMap<String, String>> {
    pod.metadata.annotations.as_ref()
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use similar_asserts::assert_eq;

    use super::*;

    fn pod_with(annotations: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("p1".to_string()),
                namespace: Some("ns".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn marker_presence_is_enough() {
        let keys = AssumedAnnotations::default();
        assert!(keys.is_assumed(&pod_with(&[("elastic-gpu/assume", "")])));
        assert!(keys.is_assumed(&pod_with(&[("elastic-gpu/assume", "true")])));
        assert!(!keys.is_assumed(&pod_with(&[])));
        assert!(!keys.is_assumed(&Pod::default()));
    }

    #[test]
    fn container_value_uses_prefix() {
        let keys = AssumedAnnotations::default();
        let pod = pod_with(&[("elastic-gpu/container-c1", "2")]);

        assert_eq!(keys.container_value(&pod, "c1"), Some("2"));
        assert_eq!(keys.container_value(&pod, "c2"), None);
    }

    #[test]
    fn custom_keys() {
        let keys = AssumedAnnotations::new("example.com/assumed", "example.com/gpu-");
        let pod = pod_with(&[("example.com/assumed", "true"), ("example.com/gpu-main", "1")]);

        assert!(keys.is_assumed(&pod));
        assert_eq!(keys.container_value(&pod, "main"), Some("1"));
    }

    #[test]
    fn parse_single_and_multiple_indices() {
        assert_eq!(parse_indices("2").unwrap(), vec![2]);
        assert_eq!(parse_indices("0,1,3").unwrap(), vec![0, 1, 3]);
        assert_eq!(parse_indices(" 4 , 5").unwrap(), vec![4, 5]);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_indices("x").is_err());
        assert!(parse_indices("").is_err());
        assert!(parse_indices("1,").is_err());
        assert!(parse_indices("-1").is_err());
    }
}
