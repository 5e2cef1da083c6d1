//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the salt-updater daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use salt_updater_api::{spawn_rpc_server, RpcState};
use salt_updater_common::{init_tracing, AppConfig, VersionInfo};
use salt_updater_core::{
    new_registry, reconcile_startup_state, spawn_connectivity_listener, startup_node_group,
    Collaborators, EventQueueEmitter, OrchestratorSettings, SaltCall, UpdateOrchestrator,
    UpdateRequest, UpdaterMetrics,
};
use salt_updater_persistence::{DeviceConfigStore, StateStore};
use salt_updater_versioning::{CheckerSettings, RemoteVersionChecker};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    about = "Coordinates salt state updates on this device",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", env = "SALT_UPDATER_CONFIG", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print extended version information and exit"
    )]
    version: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let version = VersionInfo::current();
    if cli.version {
        println!("{}", version.extended());
        return Ok(());
    }

    let candidates = AppConfig::candidates(cli.config.as_deref());
    let loaded = AppConfig::load_with_source(&candidates)?;
    let config = loaded.config;
    init_tracing("salt-updaterd", &config.logging)?;
    info!(
        version = %version.banner(),
        config_path = ?loaded.source,
        "starting salt-updater"
    );

    if !config.paths.minion_id_file.exists() {
        info!(
            path = %config.paths.minion_id_file.display(),
            "no minion id found; device is not registered with salt, exiting"
        );
        return Ok(());
    }

    run_daemon(config).await
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let store = StateStore::new(&config.paths.state_file);
    let node_group = startup_node_group(&config.paths.node_group_file).await;
    let initial = reconcile_startup_state(&store, node_group.as_deref())
        .context("failed to prepare update state")?;
    info!(node_group = ?node_group, last_update = ?initial.last_update, "state loaded");

    let registry = config.metrics.enabled.then(new_registry);
    let metrics = match &registry {
        Some(registry) => Some(
            UpdaterMetrics::new(registry.clone()).context("failed to register metrics")?,
        ),
        None => {
            info!("metrics disabled by configuration");
            None
        }
    };

    let emitter = EventQueueEmitter::open(&config.paths.event_log_file).with_context(|| {
        format!(
            "failed to open event queue {}",
            config.paths.event_log_file.display()
        )
    })?;
    let checker = RemoteVersionChecker::new(CheckerSettings::from(&config.versioning))
        .context("failed to construct version checker")?;

    let orchestrator = UpdateOrchestrator::new(
        OrchestratorSettings::from_config(&config),
        initial,
        Collaborators {
            store,
            device_config: DeviceConfigStore::new(&config.paths.device_config_file),
            runner: Arc::new(SaltCall::from_config(&config.tool)),
            checker: Arc::new(checker),
            emitter: Arc::new(emitter),
            metrics,
        },
    );

    let state = Arc::new(RpcState::new(orchestrator.clone(), registry));
    let rpc_server = spawn_rpc_server(state, &config.rpc)?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let connectivity = if config.connectivity.enabled {
        Some(spawn_connectivity_listener(
            orchestrator.clone(),
            &config.connectivity,
            &shutdown_tx,
        ))
    } else {
        info!("connectivity listener disabled by configuration");
        None
    };

    let scheduler = spawn_update_schedule(
        orchestrator.clone(),
        config.schedule.check_interval,
        shutdown_tx.subscribe(),
    );

    info!(address = %rpc_server.addr(), "daemon running; waiting for termination signal");
    wait_for_termination().await?;
    info!("termination signal received; shutting down");

    let _ = shutdown_tx.send(());
    if let Err(err) = scheduler.await {
        error!(error = %err, "update schedule join error");
    }
    if let Some(tasks) = connectivity {
        tasks.join().await;
    }
    rpc_server.shutdown().await?;
    Ok(())
}

/// Request an update at start-up when auto-update is enabled, then once per
/// `period` regardless of the setting.
fn spawn_update_schedule(
    orchestrator: UpdateOrchestrator,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now(), period.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut at_boot = true;
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {}
            }
            if std::mem::take(&mut at_boot) {
                match orchestrator.is_auto_update_on().await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!("auto update is disabled; skipping update at boot");
                        continue;
                    }
                    Err(err) => {
                        warn!(error = %err, "unable to read auto update setting; skipping update at boot");
                        continue;
                    }
                }
            }
            match orchestrator.request_update(false).await {
                UpdateRequest::Started(_) => info!("scheduled update started"),
                UpdateRequest::NoUpdateAvailable => info!("scheduled check found no update"),
                UpdateRequest::AlreadyRunning => info!("scheduled update skipped; call in progress"),
            }
        }
    })
}

#[cfg(unix)]
async fn wait_for_termination() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for ctrl-c")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_termination() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")
}
