//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration-tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Integration and validation tests for the salt-updater stack."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![cfg(unix)]

use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::{Json, Router};
use chrono::{TimeZone, Utc};
use salt_updater_api::{spawn_rpc_server, RpcClient, RpcState};
use salt_updater_common::AppConfig;
use salt_updater_core::{
    reconcile_startup_state, Collaborators, EventQueueEmitter, OrchestratorSettings, OutcomeEvent,
    SaltCall, UpdateOrchestrator,
};
use salt_updater_persistence::{read_queued, DeviceConfigStore, StateStore};
use salt_updater_versioning::{CheckerSettings, RemoteVersionChecker};

const SUMMARY: &str = "Summary for local\n-------------\nSucceeded: 1,204 (changed=12)\nFailed:      0\n-------------\nTotal run time:  95.120 s";

async fn serve_manifest() -> SocketAddr {
    let app = Router::new().route(
        "/manifest.json",
        get(|| async {
            Json(serde_json::json!({
                "prod": { "pi": "2024-03-01T12:00:00Z", "tc2": "2024-02-01T00:00:00Z" }
            }))
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn write_tool(dir: &Path, log_file: &Path) -> String {
    let script = dir.join("salt-call");
    let body = format!(
        "#!/bin/sh\n\
         printf '[INFO    ][4242] Running state [pkg.installed] at time 10:00:00\\n' >> {log}\n\
         printf '[INFO    ][4242] Running state [file.managed] at time 10:00:01\\n' >> {log}\n\
         printf '[INFO    ][4242] Running state [service.running] at time 10:00:02\\n' >> {log}\n\
         cat <<'OUT'\n{SUMMARY}\nOUT\n",
        log = log_file.display()
    );
    std::fs::write(&script, body).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    script.display().to_string()
}

fn device_config(dir: &Path, manifest: SocketAddr) -> AppConfig {
    let mut config = AppConfig::default();
    config.paths.state_file = dir.join("saltUpdate.json");
    config.paths.node_group_file = dir.join("salt-nodegroup");
    config.paths.minion_id_file = dir.join("minion_id");
    config.paths.tool_log_file = dir.join("minion");
    config.paths.state_count_file = dir.join("salt-states-count");
    config.paths.device_config_file = dir.join("config.toml");
    config.paths.event_log_file = dir.join("queue").join("events.log");
    config.tool.program = write_tool(dir, &config.paths.tool_log_file);
    config.tool.timeout = Some(Duration::from_secs(30));
    config.versioning.manifest_url = format!("http://{manifest}/manifest.json");
    config.rpc.listen = SocketAddr::from(([127, 0, 0, 1], 0));
    config.validate().unwrap();
    config
}

async fn wait_idle(client: &RpcClient) {
    for _ in 0..500 {
        if !client.is_running().await.unwrap() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("update did not finish");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn update_cycle_records_watermark_and_queues_event() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("salt-nodegroup"), "prod-pis\n").unwrap();
    std::fs::write(dir.path().join("minion_id"), "pi-1001\n").unwrap();
    std::fs::write(dir.path().join("minion"), "").unwrap();
    let config = device_config(dir.path(), serve_manifest().await);

    let store = StateStore::new(&config.paths.state_file);
    let initial = reconcile_startup_state(&store, Some("prod-pis")).unwrap();
    assert!(initial.last_update.is_none());

    let orchestrator = UpdateOrchestrator::new(
        OrchestratorSettings::from_config(&config),
        initial,
        Collaborators {
            store,
            device_config: DeviceConfigStore::new(&config.paths.device_config_file),
            runner: Arc::new(SaltCall::from_config(&config.tool)),
            checker: Arc::new(
                RemoteVersionChecker::new(CheckerSettings::from(&config.versioning)).unwrap(),
            ),
            emitter: Arc::new(EventQueueEmitter::open(&config.paths.event_log_file).unwrap()),
            metrics: None,
        },
    );
    let server = spawn_rpc_server(
        Arc::new(RpcState::new(orchestrator, None)),
        &config.rpc,
    )
    .unwrap();
    let client = RpcClient::new(
        server.addr(),
        config.rpc.primary_identity(),
        Duration::from_secs(30),
    )
    .unwrap();

    client.run_update().await.unwrap();
    wait_idle(&client).await;

    let state = client.state().await.unwrap();
    assert!(state.last_call_succeeded);
    assert_eq!(state.last_call_node_group, "prod-pis");
    assert_eq!(
        state.last_update,
        Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
    );
    assert_eq!(state.progress_percent, 100);
    assert_eq!(state.progress_label, "Finished update");
    assert!(state.last_call_output.contains("Succeeded: 1,204"));

    let persisted = StateStore::new(&config.paths.state_file).load().unwrap();
    assert_eq!(persisted.last_update, state.last_update);
    assert_eq!(persisted.progress_label, "Finished update");

    let count = std::fs::read_to_string(&config.paths.state_count_file).unwrap();
    assert_eq!(count.trim(), "3");

    let queued = read_queued::<OutcomeEvent>(&config.paths.event_log_file).unwrap();
    assert_eq!(queued.len(), 1);
    let event = &queued[0].event;
    assert_eq!(event.event_type, "salt-update");
    assert_eq!(event.details.succeeded, 1204.0);
    assert_eq!(event.details.changed, 12.0);
    assert_eq!(event.details.minion_id.as_deref(), Some("pi-1001"));
    assert!(event.details.out.is_none());

    // Nothing newer has been published since the watermark.
    client.run_update().await.unwrap();
    let state = client.state().await.unwrap();
    assert_eq!(state.progress_label, "No update available");
    assert!(!client.is_running().await.unwrap());
    let persisted = StateStore::new(&config.paths.state_file).load().unwrap();
    assert_eq!(persisted.progress_label, "No update available");

    server.shutdown().await.unwrap();
}
