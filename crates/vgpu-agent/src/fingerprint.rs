//! Order-independent identity for a set of kubelet device IDs.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

/// Number of hex characters kept from the digest.
const HASH_LEN: usize = 8;

/// Stable identifier of an unordered device-ID set.
///
/// The kubelet hands the same set to `Allocate` and `PreStartContainer` (and
/// reports it through the pod-resources API) in no particular order, so the
/// list is sorted before hashing. `hash` is used as the lookup key and as the
/// virtual device name, `list` is kept to check integrity on comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceFingerprint {
    pub hash: String,
    pub list: Vec<String>,
}

impl DeviceFingerprint {
    pub fn new<I, S>(device_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list: Vec<String> = device_ids.into_iter().map(Into::into).collect();
        list.sort_unstable();

        let digest = Sha256::digest(list.join(":").as_bytes());
        let mut hash = hex::encode(digest);
        hash.truncate(HASH_LEN);

        Self { hash, list }
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Name of the virtual device backing the `ordinal`-th physical index of
    /// this set, e.g. `1a2b3c4d-0`.
    pub fn binding_id(&self, ordinal: usize) -> String {
        format!("{}-{}", self.hash, ordinal)
    }
}

impl fmt::Display for DeviceFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hash)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn order_does_not_change_fingerprint() {
        let ids = ["d-00", "d-01", "d-02"];
        let expected = DeviceFingerprint::new(ids);

        let permutations = [
            ["d-00", "d-02", "d-01"],
            ["d-01", "d-00", "d-02"],
            ["d-01", "d-02", "d-00"],
            ["d-02", "d-00", "d-01"],
            ["d-02", "d-01", "d-00"],
        ];
        for permutation in permutations {
            assert_eq!(DeviceFingerprint::new(permutation), expected);
        }
    }

    #[test]
    fn hash_is_truncated_sha256_of_sorted_list() {
        let fp = DeviceFingerprint::new(["b", "a"]);

        let full = hex::encode(Sha256::digest(b"a:b"));
        assert_eq!(fp.hash, full[..8]);
        assert_eq!(fp.list, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn different_sets_differ() {
        let a = DeviceFingerprint::new(["0-00", "0-01"]);
        let b = DeviceFingerprint::new(["0-00", "0-02"]);
        let c = DeviceFingerprint::new(["0-00"]);

        assert_ne!(a.hash, b.hash);
        assert_ne!(a, c);
    }

    #[test]
    fn binding_id_appends_ordinal() {
        let fp = DeviceFingerprint::new(["0-00"]);
        assert_eq!(fp.binding_id(0), format!("{}-0", fp.hash));
        assert_eq!(fp.binding_id(3), format!("{}-3", fp.hash));
    }

    #[test]
    fn empty_set_is_empty() {
        let fp = DeviceFingerprint::new(Vec::<String>::new());
        assert!(fp.is_empty());
        assert_eq!(fp.hash.len(), 8);
    }
}
