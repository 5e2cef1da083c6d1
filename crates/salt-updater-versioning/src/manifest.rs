//! ---
//! ems_section: "14-versioning-licensing-system"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Remote version checks gating state application."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Parsers for the two document shapes a version endpoint may serve.
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::{Result, VersionError};

/// Layout of every publish timestamp.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Parse a publish timestamp in [`TIMESTAMP_FORMAT`].
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|err| VersionError::Manifest(format!("bad timestamp {raw:?}: {err}")))
}

/// Publish time for `branch`/`device_class` in a branch-keyed manifest:
/// `{"prod": {"pi": "2024-01-01T00:00:00Z", "tc2": "..."}, ...}`.
pub fn branch_published_at(body: &[u8], branch: &str, device_class: &str) -> Result<DateTime<Utc>> {
    let document: Value = serde_json::from_slice(body)
        .map_err(|err| VersionError::Manifest(format!("invalid json: {err}")))?;
    let record = document
        .get(branch)
        .ok_or_else(|| VersionError::Manifest(format!("branch {branch:?} missing")))?;
    let raw = record
        .get(device_class)
        .ok_or_else(|| {
            VersionError::Manifest(format!(
                "device class {device_class:?} missing for branch {branch:?}"
            ))
        })?
        .as_str()
        .ok_or_else(|| {
            VersionError::Manifest(format!(
                "timestamp for {branch:?}/{device_class:?} is not a string"
            ))
        })?;
    parse_timestamp(raw)
}

#[derive(Debug, Deserialize)]
struct CommitEntry {
    commit: CommitDetail,
}

#[derive(Debug, Deserialize)]
struct CommitDetail {
    author: CommitAuthor,
}

#[derive(Debug, Deserialize)]
struct CommitAuthor {
    date: String,
}

/// Author date of the newest commit in a GitHub commits listing. An empty
/// listing means the branch has nothing published.
pub fn newest_commit_at(body: &[u8]) -> Result<Option<DateTime<Utc>>> {
    let commits: Vec<CommitEntry> = serde_json::from_slice(body)
        .map_err(|err| VersionError::Manifest(format!("invalid commit listing: {err}")))?;
    commits
        .first()
        .map(|entry| parse_timestamp(&entry.commit.author.date))
        .transpose()
}
