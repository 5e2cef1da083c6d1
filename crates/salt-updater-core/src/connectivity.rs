//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network link watcher that pings the updater when the modem comes up."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Ping the salt master whenever the modem link comes up.
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use salt_updater_common::ConnectivityConfig;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::orchestrator::UpdateOrchestrator;

const SIGNAL_CAPACITY: usize = 8;

/// Polls `<root>/<interface>/operstate` and signals each down to up transition.
#[derive(Debug, Clone)]
pub struct OperstateWatcher {
    operstate: PathBuf,
    poll_interval: Duration,
}

impl OperstateWatcher {
    pub fn new(root: impl Into<PathBuf>, interface: &str, poll_interval: Duration) -> Self {
        Self {
            operstate: root.into().join(interface).join("operstate"),
            poll_interval,
        }
    }

    pub fn from_config(config: &ConnectivityConfig) -> Self {
        Self::new(&config.operstate_root, &config.interface, config.poll_interval)
    }

    async fn is_up(&self) -> bool {
        match tokio::fs::read_to_string(&self.operstate).await {
            Ok(state) => state.trim() == "up",
            Err(_) => false,
        }
    }

    /// Run until shutdown, sending the time of each connect on `signals`.
    /// A link that is already up when the watcher starts is not signalled.
    pub async fn run(
        self,
        signals: mpsc::Sender<DateTime<Utc>>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut was_up = self.is_up().await;
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    let up = self.is_up().await;
                    if up && !was_up {
                        debug!(path = %self.operstate.display(), "link came up");
                        // A full channel already holds an unhandled connect.
                        let _ = signals.try_send(Utc::now());
                    }
                    was_up = up;
                }
            }
        }
    }
}

/// Turns connect signals into fire-and-forget pings.
pub struct ConnectivityListener {
    orchestrator: UpdateOrchestrator,
    signals: mpsc::Receiver<DateTime<Utc>>,
}

impl ConnectivityListener {
    pub fn new(orchestrator: UpdateOrchestrator, signals: mpsc::Receiver<DateTime<Utc>>) -> Self {
        Self {
            orchestrator,
            signals,
        }
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            // Signals queued while the previous ping was being started are stale.
            while self.signals.try_recv().is_ok() {}
            tokio::select! {
                _ = shutdown.recv() => break,
                signal = self.signals.recv() => match signal {
                    Some(at) => {
                        info!(connected_at = %at, "modem connected");
                        self.orchestrator.ping();
                    }
                    None => break,
                },
            }
        }
        debug!("connectivity listener stopped");
    }
}

/// Tasks spawned by [`spawn_connectivity_listener`].
pub struct ConnectivityTasks {
    watcher: JoinHandle<()>,
    listener: JoinHandle<()>,
}

impl ConnectivityTasks {
    pub async fn join(self) {
        if let Err(err) = self.watcher.await {
            error!(error = %err, "operstate watcher join error");
        }
        if let Err(err) = self.listener.await {
            error!(error = %err, "connectivity listener join error");
        }
    }
}

pub fn spawn_connectivity_listener(
    orchestrator: UpdateOrchestrator,
    config: &ConnectivityConfig,
    shutdown: &broadcast::Sender<()>,
) -> ConnectivityTasks {
    let (tx, rx) = mpsc::channel(SIGNAL_CAPACITY);
    info!(interface = %config.interface, "starting connectivity listener");
    let watcher = tokio::spawn(OperstateWatcher::from_config(config).run(tx, shutdown.subscribe()));
    let listener =
        tokio::spawn(ConnectivityListener::new(orchestrator, rx).run(shutdown.subscribe()));
    ConnectivityTasks { watcher, listener }
}
