//! ---
//! ems_section: "14-versioning-licensing-system"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Remote version checks gating state application."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use indexmap::IndexMap;
use salt_updater_common::VersioningConfig;

/// Static mapping from device node group to manifest branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeGroupBranchMap {
    branches: IndexMap<String, String>,
}

impl NodeGroupBranchMap {
    /// Build a map from explicit entries.
    pub fn new(branches: IndexMap<String, String>) -> Self {
        Self { branches }
    }

    /// Branch key for a node group, if mapped.
    pub fn branch_for(&self, node_group: &str) -> Option<&str> {
        self.branches.get(node_group).map(String::as_str)
    }

    /// Device class used to select the timestamp inside a branch record.
    ///
    /// Thermal cameras (`tc2-*` groups) publish under `tc2`; every other
    /// device is a `pi`.
    pub fn device_class(node_group: &str) -> &'static str {
        if node_group.starts_with("tc2") {
            "tc2"
        } else {
            "pi"
        }
    }
}

impl Default for NodeGroupBranchMap {
    /// The table shipped in the default `[versioning.branches]` config.
    fn default() -> Self {
        Self::new(VersioningConfig::default().branches)
    }
}
