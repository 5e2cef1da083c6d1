//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Durable update state record and its file store."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{info, warn};

use crate::{write_atomically, Result};

/// Durable record of the most recent tool call and any call in flight.
///
/// The on-disk keys are the historical ones so a state file written by an
/// earlier agent on the device is read unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateState {
    /// True while a tool call is in flight.
    #[serde(rename = "RunningUpdate", default)]
    pub running: bool,
    /// Arguments of the in-flight call; empty when idle.
    #[serde(rename = "RunningArgs", default, deserialize_with = "null_as_empty")]
    pub running_args: Vec<String>,
    /// Combined captured output of the last call.
    #[serde(rename = "LastCallOut", default)]
    pub last_call_output: String,
    /// Whether the last call exited successfully.
    #[serde(rename = "LastCallSuccess", default)]
    pub last_call_succeeded: bool,
    /// Node group the device belonged to when the last call ran.
    #[serde(rename = "LastCallNodegroup", default)]
    pub last_call_node_group: String,
    /// Arguments of the last completed call.
    #[serde(rename = "LastCallArgs", default, deserialize_with = "null_as_empty")]
    pub last_call_args: Vec<String>,
    /// Publish time of the last successfully applied update.
    #[serde(
        rename = "LastUpdate",
        default,
        deserialize_with = "deserialize_watermark"
    )]
    pub last_update: Option<DateTime<Utc>>,
    /// Progress of the in-flight update, as a percentage.
    #[serde(rename = "UpdateProgressPercentage", default)]
    pub progress_percent: u32,
    /// Label describing the current progress step.
    #[serde(rename = "UpdateProgressStr", default)]
    pub progress_label: String,
}

impl UpdateState {
    /// Clear the progress fields, leaving everything else intact.
    pub fn reset_progress(&mut self) {
        self.progress_percent = 0;
        self.progress_label.clear();
    }
}

// Older agents wrote the zero time (`0001-01-01T00:00:00Z`) to mean "never updated".
fn deserialize_watermark<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<DateTime<Utc>>::deserialize(deserializer)?;
    Ok(value.filter(|ts| ts.year() > 1))
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Loads and saves the [`UpdateState`] record at a fixed path.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Create a store for the given state file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record.
    ///
    /// A missing file yields the default record, which is persisted straight
    /// away. An unreadable or corrupt document is logged and replaced by the
    /// default record in memory; the file is left for inspection until the
    /// next save.
    pub fn load(&self) -> Result<UpdateState> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no update state found; creating a new record");
                let state = UpdateState::default();
                self.save(&state)?;
                return Ok(state);
            }
            Err(err) => return Err(err.into()),
        };

        match serde_json::from_slice::<UpdateState>(&bytes) {
            Ok(state) => Ok(state),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "update state is corrupt; using a fresh record");
                Ok(UpdateState::default())
            }
        }
    }

    /// Persist the record, replacing the previous file atomically.
    pub fn save(&self, state: &UpdateState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state)?;
        write_atomically(&self.path, &json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("saltUpdate.json"));
        let state = store.load().unwrap();
        assert_eq!(state, UpdateState::default());
        assert!(store.path().exists());
    }

    #[test]
    fn corrupt_file_yields_default_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("saltUpdate.json");
        fs::write(&path, b"{ not json").unwrap();
        let state = StateStore::new(&path).load().unwrap();
        assert_eq!(state, UpdateState::default());
    }

    #[test]
    fn legacy_document_is_read_with_historical_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("saltUpdate.json");
        fs::write(
            &path,
            r#"{
                "RunningUpdate": false,
                "RunningArgs": null,
                "LastCallOut": "local: True",
                "LastCallSuccess": true,
                "LastCallNodegroup": "prod-pis",
                "LastCallArgs": ["test.ping"],
                "LastUpdate": "0001-01-01T00:00:00Z",
                "AutoUpdate": true
            }"#,
        )
        .unwrap();
        let state = StateStore::new(&path).load().unwrap();
        assert!(state.last_call_succeeded);
        assert_eq!(state.last_call_node_group, "prod-pis");
        assert_eq!(state.last_call_args, vec!["test.ping".to_owned()]);
        assert!(state.last_update.is_none());
        assert_eq!(state.progress_percent, 0);
    }

    #[test]
    fn saved_state_is_read_back() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state").join("saltUpdate.json"));
        let state = UpdateState {
            last_call_output: "Succeeded: 3".into(),
            last_call_succeeded: true,
            last_call_node_group: "tc2-dev".into(),
            last_update: Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()),
            progress_percent: 100,
            progress_label: "Finished update".into(),
            ..UpdateState::default()
        };
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), state);

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw["LastUpdate"], "2024-03-01T12:00:00Z");
        assert_eq!(raw["UpdateProgressStr"], "Finished update");
    }
}
