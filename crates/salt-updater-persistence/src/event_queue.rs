//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "On-device queue of outcome events awaiting upload."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Outcome events wait here, one JSON record per line, until the telemetry
//! reporter ships them. Records are numbered so the reporter can tell which
//! ones it has already sent.
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Result;

/// One queued event and the bookkeeping the reporter needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEvent<E> {
    /// Position in the queue, starting at 1.
    pub sequence: u64,
    /// When the event was handed to the queue.
    pub queued_at: DateTime<Utc>,
    /// The event itself.
    pub event: E,
}

/// Append handle for a queue file of `E` events.
#[derive(Debug)]
pub struct EventQueue<E> {
    path: PathBuf,
    file: File,
    last_sequence: u64,
    _event: PhantomData<fn(E)>,
}

impl<E> EventQueue<E>
where
    E: Serialize + DeserializeOwned,
{
    /// Open the queue for appending.
    ///
    /// A record cut short by a crash or power loss is dropped so the next
    /// event starts on a clean line.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let (records, complete_len) = scan::<E>(path)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        if file.metadata()?.len() > complete_len {
            warn!(path = %path.display(), "dropping partial record at end of event queue");
            file.set_len(complete_len)?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            last_sequence: records.last().map_or(0, |record| record.sequence),
            _event: PhantomData,
        })
    }

    /// Queue `event` durably and return its sequence number.
    pub fn push(&mut self, event: &E) -> Result<u64> {
        let record = QueuedEvent {
            sequence: self.last_sequence + 1,
            queued_at: Utc::now(),
            event,
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let end = self.file.metadata()?.len();
        if let Err(err) = append_at(&mut self.file, end, &line) {
            // leave no half line behind for the reporter
            let _ = self.file.set_len(end);
            return Err(err.into());
        }
        self.last_sequence = record.sequence;
        Ok(record.sequence)
    }

    /// Sequence number of the newest queued event, `0` when the queue is empty.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Location of the queue file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read every complete record in the queue at `path`.
pub fn read_queued<E: DeserializeOwned>(path: &Path) -> Result<Vec<QueuedEvent<E>>> {
    scan(path).map(|(records, _)| records)
}

fn append_at(file: &mut File, end: u64, line: &[u8]) -> std::io::Result<()> {
    use std::io::{Seek, SeekFrom};

    file.seek(SeekFrom::Start(end))?;
    file.write_all(line)?;
    file.sync_data()
}

/// Parse the newline-terminated records of the queue. Also returns the byte
/// length they cover, which excludes an unterminated tail.
fn scan<E: DeserializeOwned>(path: &Path) -> Result<(Vec<QueuedEvent<E>>, u64)> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(err) => return Err(err.into()),
    };

    let mut records = Vec::new();
    let mut complete_len = 0usize;
    for line in bytes.split_inclusive(|byte| *byte == b'\n') {
        if line.last() != Some(&b'\n') {
            break;
        }
        complete_len += line.len();
        let body = &line[..line.len() - 1];
        if body.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        records.push(serde_json::from_slice(body)?);
    }
    Ok((records, complete_len as u64))
}
