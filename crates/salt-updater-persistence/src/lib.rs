//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! File-backed storage for the updater: the single update state record, the
//! append-only outcome event queue and the device configuration flags.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing persistence files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Device configuration could not be parsed.
    #[error("device config parse error: {0}")]
    TomlDe(#[from] toml::de::Error),
    /// Device configuration could not be rendered.
    #[error("device config render error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    /// A document had the wrong shape for the requested update.
    #[error("invalid document {path}: {reason}")]
    InvalidDocument {
        /// File that was being updated.
        path: String,
        /// What was wrong with it.
        reason: String,
    },
}

pub mod device_config;
pub mod event_queue;
pub mod state;

pub use device_config::DeviceConfigStore;
pub use event_queue::{read_queued, EventQueue, QueuedEvent};
pub use state::{StateStore, UpdateState};

/// Replace `path` with `bytes` by writing a sibling temp file and renaming it over.
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);

    let file = File::create(&tmp)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(bytes)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);
    fs::rename(&tmp, path)?;
    Ok(())
}
