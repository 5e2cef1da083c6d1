//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device configuration flags in the salt section."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use toml::{Table, Value};
use tracing::debug;

use crate::{write_atomically, PersistenceError, Result};

const SALT_SECTION: &str = "salt";
const AUTO_UPDATE_KEY: &str = "auto-update";

/// Device-wide TOML configuration shared with other agents on the device.
///
/// Only the `[salt] auto-update` flag is owned here; every other key is
/// preserved on write.
#[derive(Debug, Clone)]
pub struct DeviceConfigStore {
    path: PathBuf,
}

impl DeviceConfigStore {
    /// Create a store for the given device configuration file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the device configuration file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether updates should run unattended. Defaults to `true` when unset.
    pub fn auto_update(&self) -> Result<bool> {
        let table = self.read_table()?;
        let flag = table
            .get(SALT_SECTION)
            .and_then(Value::as_table)
            .and_then(|salt| salt.get(AUTO_UPDATE_KEY))
            .and_then(Value::as_bool)
            .unwrap_or(true);
        Ok(flag)
    }

    /// Persist the auto-update flag.
    pub fn set_auto_update(&self, enabled: bool) -> Result<()> {
        let mut table = self.read_table()?;
        let salt = table
            .entry(SALT_SECTION)
            .or_insert(Value::Table(Table::new()));
        let salt = salt
            .as_table_mut()
            .ok_or_else(|| PersistenceError::InvalidDocument {
                path: self.path.display().to_string(),
                reason: format!("`{SALT_SECTION}` is not a table"),
            })?;
        salt.insert(AUTO_UPDATE_KEY.to_owned(), Value::Boolean(enabled));

        let rendered = toml::to_string(&table)?;
        write_atomically(&self.path, rendered.as_bytes())?;
        debug!(path = %self.path.display(), enabled, "auto-update flag written");
        Ok(())
    }

    fn read_table(&self) -> Result<Table> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents.parse::<Table>()?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Table::new()),
            Err(err) => Err(err.into()),
        }
    }
}
