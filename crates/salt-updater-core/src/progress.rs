//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Live progress estimation from the minion state output directory."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Best-effort progress estimate for a running `state.apply`, derived from
//! the "Running state [...]" lines the minion writes to its log.
//!
//! The estimate is `100 * observed / expected`, where `expected` is the count
//! observed by the previous run (persisted in a small file) plus a margin.
//! It is not capped at 100.
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use salt_updater_common::PathsConfig;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Expected state count when no previous run was recorded.
pub const DEFAULT_TOTAL_STATES: u32 = 100;
/// Headroom added to the previous count.
pub const STATE_MARGIN: u32 = 5;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const INITIAL_LABEL: &str = "Initializing update...";

static STATE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"INFO\s*\]\[\d+\]\s+Running state \[(.*)\]").expect("state line pattern is valid")
});

/// Receives progress updates from the tracker.
pub trait ProgressSink: Send + Sync + 'static {
    fn report(&self, percent: u32, label: &str);
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub log_file: PathBuf,
    pub count_file: PathBuf,
    pub poll_interval: Duration,
}

impl TrackerSettings {
    pub fn from_paths(paths: &PathsConfig) -> Self {
        Self {
            log_file: paths.tool_log_file.clone(),
            count_file: paths.state_count_file.clone(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Final tally handed back when the tracker stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerReport {
    pub observed: u32,
    pub expected: u32,
}

/// Starts tracker tasks.
pub struct ProgressTracker;

impl ProgressTracker {
    /// Open the log, position at its end, and start tailing in the background.
    ///
    /// Lines already in the log when this returns are never counted. If the
    /// log cannot be opened the returned handle yields an empty report.
    pub async fn start(settings: TrackerSettings, sink: Arc<dyn ProgressSink>) -> TrackerHandle {
        sink.report(0, INITIAL_LABEL);
        let (stop_tx, stop_rx) = oneshot::channel();

        let mut file = match File::open(&settings.log_file).await {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %settings.log_file.display(), error = %err, "unable to open tool log; progress will not be tracked");
                return TrackerHandle {
                    stop: Some(stop_tx),
                    task: tokio::spawn(async { TrackerReport::default() }),
                };
            }
        };
        if let Err(err) = file.seek(SeekFrom::End(0)).await {
            warn!(path = %settings.log_file.display(), error = %err, "unable to seek tool log; progress will not be tracked");
            return TrackerHandle {
                stop: Some(stop_tx),
                task: tokio::spawn(async { TrackerReport::default() }),
            };
        }

        let expected = previous_count(&settings).await.saturating_add(STATE_MARGIN);
        info!(expected, "tracking update progress");
        let task = tokio::spawn(tail(file, settings, expected, sink, stop_rx));
        TrackerHandle {
            stop: Some(stop_tx),
            task,
        }
    }
}

async fn previous_count(settings: &TrackerSettings) -> u32 {
    match tokio::fs::read_to_string(&settings.count_file).await {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|err| {
            warn!(path = %settings.count_file.display(), error = %err, "unparseable state count; assuming default");
            DEFAULT_TOTAL_STATES
        }),
        Err(err) => {
            debug!(path = %settings.count_file.display(), error = %err, "no previous state count");
            DEFAULT_TOTAL_STATES
        }
    }
}

struct Tally {
    observed: u32,
    expected: u32,
    sink: Arc<dyn ProgressSink>,
}

impl Tally {
    fn consume(&mut self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        if let Some(captures) = STATE_LINE.captures(&line) {
            let name = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
            self.observed += 1;
            let percent = self.observed.saturating_mul(100) / self.expected.max(1);
            debug!(observed = self.observed, expected = self.expected, state = %name, "running state");
            self.sink.report(percent, name);
        }
    }
}

async fn tail(
    file: File,
    settings: TrackerSettings,
    expected: u32,
    sink: Arc<dyn ProgressSink>,
    mut stop: oneshot::Receiver<()>,
) -> TrackerReport {
    let mut reader = BufReader::new(file);
    let mut pending = Vec::new();
    let mut tally = Tally {
        observed: 0,
        expected,
        sink,
    };

    loop {
        match stop.try_recv() {
            Err(oneshot::error::TryRecvError::Empty) => {}
            _ => break,
        }
        match reader.read_until(b'\n', &mut pending).await {
            Ok(0) => {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = tokio::time::sleep(settings.poll_interval) => {}
                }
            }
            Ok(_) => {
                if pending.ends_with(b"\n") {
                    tally.consume(&pending);
                    pending.clear();
                }
            }
            Err(err) => {
                warn!(path = %settings.log_file.display(), error = %err, "tool log read failed");
                tokio::time::sleep(settings.poll_interval).await;
            }
        }
    }

    // Everything written before the stop signal is counted.
    loop {
        match reader.read_until(b'\n', &mut pending).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if pending.ends_with(b"\n") {
                    tally.consume(&pending);
                    pending.clear();
                }
            }
        }
    }
    if !pending.is_empty() {
        tally.consume(&pending);
    }

    if tally.observed > 0 {
        if let Err(err) = tokio::fs::write(&settings.count_file, tally.observed.to_string()).await {
            warn!(path = %settings.count_file.display(), error = %err, "failed to persist state count");
        }
    }
    info!(observed = tally.observed, expected, "stopped tracking update progress");
    TrackerReport {
        observed: tally.observed,
        expected,
    }
}

/// Running tracker. Dropping it without [`TrackerHandle::stop`] leaves the
/// task to finish when the stop channel closes.
pub struct TrackerHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<TrackerReport>,
}

impl TrackerHandle {
    /// Signal the tracker and wait until it has drained the log and exited.
    pub async fn stop(mut self) -> TrackerReport {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %err, "progress tracker task failed");
                TrackerReport::default()
            }
        }
    }
}
