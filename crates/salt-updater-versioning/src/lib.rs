//! ---
//! ems_section: "14-versioning-licensing-system"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Remote version checks gating state application."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Decides whether a newer salt state revision has been published for the
//! device's node group by comparing a remote publish time against the local
//! watermark.

pub mod branch;
pub mod checker;
pub mod manifest;

pub use branch::NodeGroupBranchMap;
pub use checker::{CheckerSettings, RemoteVersionChecker, UpdateCheck, UpdateChecker};

/// Result alias used throughout the versioning crate.
pub type Result<T> = std::result::Result<T, VersionError>;

/// Failures of a remote version check. Callers treat every variant as
/// "unknown" and decide for themselves whether to proceed.
#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    /// The node group has no branch mapping.
    #[error("no salt branch mapping for node group {0:?}")]
    UnknownNodeGroup(String),
    /// The endpoint answered with a non-success status.
    #[error("bad update status check {status} from url {url}")]
    Status {
        /// HTTP status code returned.
        status: u16,
        /// Requested URL.
        url: String,
    },
    /// The endpoint could not be reached or the body could not be read.
    #[error("update check transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The document did not have the expected shape.
    #[error("malformed version manifest: {0}")]
    Manifest(String),
    /// The configured endpoint is not a usable URL.
    #[error("invalid manifest url {url}: {reason}")]
    InvalidUrl {
        /// Configured URL.
        url: String,
        /// Parser message.
        reason: String,
    },
}
