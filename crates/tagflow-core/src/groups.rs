//! Reader hostname to deduplication-group resolution.
//!
//! The mapping is a static JSON file deployed next to the ingestor:
//!
//! ```json
//! {
//!   "deduplicationGroup": "dock-doors",
//!   "groups": { "dock-doors": ["reader-1", "reader-2"] }
//! }
//! ```
//!
//! The special mode string `"hostname"` disables grouping: every reader is
//! its own group.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::CoreError;

/// Mode string that maps every hostname to itself.
const HOSTNAME_MODE: &str = "hostname";

/// Host-group mapping loaded from the static config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMap {
    /// Either `"hostname"` or the name of the grouping mode.
    deduplication_group: String,
    /// Group name to member hostnames. Scanned in lexicographic order so
    /// resolution stays deterministic when a host appears in several groups.
    #[serde(default)]
    groups: BTreeMap<String, Vec<String>>,
}

impl GroupMap {
    /// Load the mapping from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| CoreError::GroupFile(format!("{}: {e}", path.as_ref().display())))?;
        serde_json::from_str(&content)
            .map_err(|e| CoreError::GroupFile(format!("{}: {e}", path.as_ref().display())))
    }

    /// Mapping that resolves every hostname to itself.
    #[must_use]
    pub fn hostname_mode() -> Self {
        Self {
            deduplication_group: HOSTNAME_MODE.to_owned(),
            groups: BTreeMap::new(),
        }
    }

    /// Resolve a reader hostname to its deduplication group.
    ///
    /// In hostname mode, or when no group lists the host, the hostname is
    /// returned verbatim.
    #[must_use]
    pub fn resolve<'a>(&'a self, hostname: &'a str) -> &'a str {
        if self.deduplication_group == HOSTNAME_MODE {
            return hostname;
        }

        self.groups
            .iter()
            .find(|(_, members)| members.iter().any(|m| m == hostname))
            .map_or(hostname, |(name, _)| name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn grouped() -> GroupMap {
        serde_json::from_str(
            r#"{
                "deduplicationGroup": "grouped",
                "groups": {
                    "dock-doors": ["reader-1", "reader-2"],
                    "aisles": ["reader-3"]
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn hostname_mode_is_verbatim() {
        let map = GroupMap::hostname_mode();
        assert_eq!(map.resolve("reader-1"), "reader-1");
    }

    #[test]
    fn member_resolves_to_group() {
        let map = grouped();
        assert_eq!(map.resolve("reader-2"), "dock-doors");
        assert_eq!(map.resolve("reader-3"), "aisles");
    }

    #[test]
    fn unknown_host_falls_back_to_hostname() {
        let map = grouped();
        assert_eq!(map.resolve("reader-99"), "reader-99");
    }

    #[test]
    fn duplicate_membership_resolves_first_lexicographic() {
        let map: GroupMap = serde_json::from_str(
            r#"{
                "deduplicationGroup": "grouped",
                "groups": {
                    "zulu": ["shared"],
                    "alpha": ["shared"]
                }
            }"#,
        )
        .unwrap();
        assert_eq!(map.resolve("shared"), "alpha");
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"deduplicationGroup": "hostname", "groups": {{}}}}"#
        )
        .unwrap();

        let map = GroupMap::load(file.path()).unwrap();
        assert_eq!(map.resolve("r1"), "r1");
    }

    #[test]
    fn missing_file_errors() {
        let err = GroupMap::load("/nonexistent/groups.json").unwrap_err();
        assert!(matches!(err, CoreError::GroupFile(_)));
    }
}
