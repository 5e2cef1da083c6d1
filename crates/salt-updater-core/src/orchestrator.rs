//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary orchestration and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Single-flight coordination of tool calls.
//!
//! At most one call runs at a time. The guard is an atomic flag taken with a
//! compare-and-swap before any await point and released when the call task
//! has persisted its result and emitted its event. Fire-and-forget entry
//! points drop requests that arrive while a call is in flight; synchronous
//! ones fail with [`OrchestratorError::AlreadyRunning`]. File work goes
//! through the blocking pool.
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use salt_updater_common::AppConfig;
use salt_updater_persistence::{DeviceConfigStore, PersistenceError, StateStore, UpdateState};
use salt_updater_versioning::{UpdateCheck, UpdateChecker, VersionError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::events::EventEmitter;
use crate::metrics::UpdaterMetrics;
use crate::outcome::{build_event, OutcomeError};
use crate::progress::{ProgressSink, ProgressTracker, TrackerSettings};
use crate::startup::read_node_group;
use crate::tool::ToolRunner;

/// Recorded as the node group when the node group file cannot be read.
pub const NODE_GROUP_READ_ERROR: &str = "error reading nodegroup";
pub const FINISHED_LABEL: &str = "Finished update";
pub const NO_UPDATE_LABEL: &str = "No update available";

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("call already in progress")]
    AlreadyRunning,
    #[error(transparent)]
    Outcome(#[from] OutcomeError),
    #[error("device config store unavailable: {0}")]
    DeviceConfig(#[from] PersistenceError),
    #[error("call task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl OrchestratorError {
    /// Rejected by the single-flight guard.
    pub fn is_guard(&self) -> bool {
        matches!(self, Self::AlreadyRunning)
    }

    /// Tool output could not be turned into an outcome event.
    pub fn is_parse(&self) -> bool {
        matches!(self, Self::Outcome(_))
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub ping_args: Vec<String>,
    pub update_args: Vec<String>,
    pub node_group_file: PathBuf,
    pub minion_id_file: PathBuf,
    pub tracker: TrackerSettings,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            ping_args: config.tool.ping_args.clone(),
            update_args: config.tool.update_args.clone(),
            node_group_file: config.paths.node_group_file.clone(),
            minion_id_file: config.paths.minion_id_file.clone(),
            tracker: TrackerSettings::from_paths(&config.paths),
        }
    }
}

/// Everything the orchestrator talks to.
pub struct Collaborators {
    pub store: StateStore,
    pub device_config: DeviceConfigStore,
    pub runner: Arc<dyn ToolRunner>,
    pub checker: Arc<dyn UpdateChecker>,
    pub emitter: Arc<dyn EventEmitter>,
    pub metrics: Option<UpdaterMetrics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Ping,
    Update,
}

impl CallKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Update => "update",
        }
    }
}

/// Completion of a background call.
pub struct CallHandle {
    task: JoinHandle<Result<UpdateState, OrchestratorError>>,
}

impl CallHandle {
    /// Wait for the call to finish and return the state it left behind.
    pub async fn join(self) -> Result<UpdateState, OrchestratorError> {
        self.task.await?
    }
}

/// Result of [`UpdateOrchestrator::request_update`].
pub enum UpdateRequest {
    /// The update call is running in the background.
    Started(CallHandle),
    /// The remote check found nothing newer than the last applied update.
    NoUpdateAvailable,
    /// Another call was in flight; the request was dropped.
    AlreadyRunning,
}

impl std::fmt::Debug for UpdateRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started(_) => f.write_str("Started"),
            Self::NoUpdateAvailable => f.write_str("NoUpdateAvailable"),
            Self::AlreadyRunning => f.write_str("AlreadyRunning"),
        }
    }
}

struct Inner {
    settings: OrchestratorSettings,
    store: StateStore,
    device_config: DeviceConfigStore,
    runner: Arc<dyn ToolRunner>,
    checker: Arc<dyn UpdateChecker>,
    emitter: Arc<dyn EventEmitter>,
    metrics: Option<UpdaterMetrics>,
    running: AtomicBool,
    state: Mutex<UpdateState>,
    save_order: tokio::sync::Mutex<()>,
}

impl Inner {
    /// Write the current state to the state file on the blocking pool.
    ///
    /// The snapshot is taken under `save_order`, so a later save always
    /// carries a state at least as new as an earlier one. Failures are logged.
    async fn persist(&self) {
        let _order = self.save_order.lock().await;
        let snapshot = self.state.lock().clone();
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.save(&snapshot)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(path = %self.store.path().display(), error = %err, "failed to save salt state to file");
            }
            Err(err) => warn!(error = %err, "salt state save task failed"),
        }
    }
}

impl ProgressSink for Inner {
    fn report(&self, percent: u32, label: &str) {
        {
            let mut state = self.state.lock();
            state.progress_percent = percent;
            state.progress_label = label.to_owned();
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_progress(percent);
        }
    }
}

/// Releases the single-flight flag when the owning call task ends, however it ends.
struct RunningGuard {
    inner: Arc<Inner>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(metrics) = &self.inner.metrics {
            metrics.set_running(false);
        }
    }
}

/// Owner of the in-memory update state and the only writer of it.
#[derive(Clone)]
pub struct UpdateOrchestrator {
    inner: Arc<Inner>,
}

impl UpdateOrchestrator {
    pub fn new(settings: OrchestratorSettings, initial: UpdateState, parts: Collaborators) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                store: parts.store,
                device_config: parts.device_config,
                runner: parts.runner,
                checker: parts.checker,
                emitter: parts.emitter,
                metrics: parts.metrics,
                running: AtomicBool::new(false),
                state: Mutex::new(initial),
                save_order: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Snapshot copy of the state record.
    pub fn state(&self) -> UpdateState {
        self.inner.state.lock().clone()
    }

    /// Start a ping in the background. Returns `None` when a call is already in flight.
    pub fn ping(&self) -> Option<CallHandle> {
        match self.try_acquire() {
            Some(guard) => Some(self.spawn_call(guard, CallKind::Ping, None)),
            None => {
                info!("salt call already running; dropping ping request");
                None
            }
        }
    }

    /// Run a ping and wait for it, returning the resulting state.
    pub async fn ping_sync(&self) -> Result<UpdateState, OrchestratorError> {
        let guard = self
            .try_acquire()
            .ok_or(OrchestratorError::AlreadyRunning)?;
        self.spawn_call(guard, CallKind::Ping, None).join().await
    }

    /// Start an update unless one is running or, when not forced, the remote
    /// check reports nothing newer. A failed check does not block the update.
    pub async fn request_update(&self, force: bool) -> UpdateRequest {
        if self.is_running() {
            info!("already running salt update");
            self.record_rejection();
            return UpdateRequest::AlreadyRunning;
        }

        let mut published_at = None;
        if force {
            info!("forcing a salt update");
        } else {
            match self.check_for_update().await {
                Ok(check) if !check.available => {
                    info!(branch = %check.branch, "no update available");
                    self.inner.report(100, NO_UPDATE_LABEL);
                    self.inner.persist().await;
                    return UpdateRequest::NoUpdateAvailable;
                }
                Ok(check) => published_at = check.published_at,
                Err(err) => {
                    warn!(error = %err, "error checking if update exists; running state apply anyway");
                }
            }
        }

        match self.try_acquire() {
            Some(guard) => {
                info!("running state apply");
                UpdateRequest::Started(self.spawn_call(guard, CallKind::Update, published_at))
            }
            None => {
                info!("already running salt update");
                UpdateRequest::AlreadyRunning
            }
        }
    }

    /// Ask the checker about the current node group against the recorded watermark.
    pub async fn check_for_update(&self) -> Result<UpdateCheck, VersionError> {
        let node_group = read_node_group(&self.inner.settings.node_group_file)
            .await
            .unwrap_or_else(|err| {
                warn!(path = %self.inner.settings.node_group_file.display(), error = %err, "unable to read node group");
                String::new()
            });
        let watermark = self.inner.state.lock().last_update;
        let result = self
            .inner
            .checker
            .check_update_available(&node_group, watermark)
            .await;
        if let Some(metrics) = &self.inner.metrics {
            let label = match &result {
                Ok(check) if check.available => "available",
                Ok(_) => "current",
                Err(_) => "error",
            };
            metrics.record_update_check(label);
        }
        result
    }

    pub async fn set_auto_update(&self, enabled: bool) -> Result<(), OrchestratorError> {
        let device_config = self.inner.device_config.clone();
        tokio::task::spawn_blocking(move || device_config.set_auto_update(enabled)).await??;
        info!(enabled, "auto update setting changed");
        Ok(())
    }

    pub async fn is_auto_update_on(&self) -> Result<bool, OrchestratorError> {
        let device_config = self.inner.device_config.clone();
        Ok(tokio::task::spawn_blocking(move || device_config.auto_update()).await??)
    }

    fn record_rejection(&self) {
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_rejection();
        }
    }

    fn try_acquire(&self) -> Option<RunningGuard> {
        match self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                if let Some(metrics) = &self.inner.metrics {
                    metrics.set_running(true);
                }
                Some(RunningGuard {
                    inner: self.inner.clone(),
                })
            }
            Err(_) => {
                self.record_rejection();
                None
            }
        }
    }

    fn spawn_call(
        &self,
        guard: RunningGuard,
        kind: CallKind,
        published_at: Option<DateTime<Utc>>,
    ) -> CallHandle {
        let inner = self.inner.clone();
        let args = match kind {
            CallKind::Ping => inner.settings.ping_args.clone(),
            CallKind::Update => inner.settings.update_args.clone(),
        };
        let task = tokio::spawn(async move {
            let result = execute(&inner, kind, args, published_at).await;
            let result = match (kind, result) {
                (CallKind::Update, Ok(mut state)) => {
                    info!("finished running salt update");
                    inner.report(100, FINISHED_LABEL);
                    inner.persist().await;
                    state.progress_percent = 100;
                    state.progress_label = FINISHED_LABEL.to_owned();
                    Ok(state)
                }
                (CallKind::Update, Err(err)) => {
                    error!(error = %err, "error running salt update");
                    Err(err)
                }
                (CallKind::Ping, result) => result,
            };
            drop(guard);
            result
        });
        CallHandle { task }
    }
}

async fn execute(
    inner: &Arc<Inner>,
    kind: CallKind,
    args: Vec<String>,
    published_at: Option<DateTime<Utc>>,
) -> Result<UpdateState, OrchestratorError> {
    {
        let mut state = inner.state.lock();
        state.running = true;
        state.running_args = args.clone();
    }
    info!(?args, "starting salt call");

    let tracker = match kind {
        CallKind::Update => {
            let sink: Arc<dyn ProgressSink> = inner.clone();
            Some(ProgressTracker::start(inner.settings.tracker.clone(), sink).await)
        }
        CallKind::Ping => None,
    };
    let output = inner.runner.run(&args).await;
    if let Some(tracker) = tracker {
        tracker.stop().await;
    }
    info!(?args, success = output.success, "finished salt call");

    let node_group = match read_node_group(&inner.settings.node_group_file).await {
        Ok(group) => group,
        Err(err) => {
            warn!(path = %inner.settings.node_group_file.display(), error = %err, "failed to read nodegroup file");
            NODE_GROUP_READ_ERROR.to_owned()
        }
    };

    let snapshot = {
        let mut state = inner.state.lock();
        state.running = false;
        state.running_args.clear();
        state.last_call_succeeded = output.success;
        state.last_call_output = output.output;
        if kind == CallKind::Update && output.success {
            if let Some(published) = published_at {
                state.last_update = Some(published);
            }
        }
        state.last_call_node_group = node_group;
        state.last_call_args = args;
        state.clone()
    };

    inner.persist().await;
    if let Some(metrics) = &inner.metrics {
        metrics.record_call(kind.as_str(), snapshot.last_call_succeeded);
    }

    if kind == CallKind::Update {
        let minion_id = tokio::fs::read_to_string(&inner.settings.minion_id_file)
            .await
            .ok()
            .map(|id| id.trim().to_owned())
            .filter(|id| !id.is_empty());
        let event = build_event(&snapshot, minion_id.as_deref())?;
        if let Err(err) = inner.emitter.emit(&event).await {
            error!(error = %err, "failed to emit salt update event");
        }
    }
    Ok(snapshot)
}
