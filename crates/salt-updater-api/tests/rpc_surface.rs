//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Networking API surface for external integrations."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use salt_updater_api::{spawn_rpc_server, RpcClient, RpcServer, RpcState};
use salt_updater_common::RpcConfig;
use salt_updater_core::{
    new_registry, Collaborators, EmitError, EventEmitter, OrchestratorSettings, OutcomeEvent,
    ToolOutput, ToolRunner, TrackerSettings, UpdateOrchestrator, UpdaterMetrics,
};
use salt_updater_persistence::{DeviceConfigStore, StateStore, UpdateState};
use salt_updater_versioning::{UpdateCheck, UpdateChecker, VersionError};
use tempfile::TempDir;
use tokio::sync::Semaphore;

const PRIMARY: &str = "org.cacophony.saltupdater";
const LEGACY: &str = "org.cacophony.SaltUpdater";

struct GatedRunner {
    gate: Semaphore,
}

#[async_trait]
impl ToolRunner for GatedRunner {
    async fn run(&self, _args: &[String]) -> ToolOutput {
        self.gate.acquire().await.unwrap().forget();
        ToolOutput {
            output: "local:\n    True\n".into(),
            success: true,
        }
    }
}

struct NothingNew;

#[async_trait]
impl UpdateChecker for NothingNew {
    async fn check_update_available(
        &self,
        _node_group: &str,
        _watermark: Option<DateTime<Utc>>,
    ) -> Result<UpdateCheck, VersionError> {
        Ok(UpdateCheck {
            available: false,
            published_at: None,
            branch: "prod".into(),
        })
    }
}

struct Discard;

#[async_trait]
impl EventEmitter for Discard {
    async fn emit(&self, _event: &OutcomeEvent) -> Result<(), EmitError> {
        Ok(())
    }
}

struct Harness {
    _dir: TempDir,
    runner: Arc<GatedRunner>,
    orchestrator: UpdateOrchestrator,
    server: RpcServer,
}

impl Harness {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("salt-nodegroup"), "prod-pis\n").unwrap();
        std::fs::write(dir.path().join("minion"), "").unwrap();
        let runner = Arc::new(GatedRunner {
            gate: Semaphore::new(0),
        });
        let registry = new_registry();
        let metrics = UpdaterMetrics::new(registry.clone()).unwrap();
        let orchestrator = UpdateOrchestrator::new(
            OrchestratorSettings {
                ping_args: vec!["test.ping".into()],
                update_args: vec!["state.apply".into()],
                node_group_file: dir.path().join("salt-nodegroup"),
                minion_id_file: dir.path().join("minion_id"),
                tracker: TrackerSettings {
                    log_file: dir.path().join("minion"),
                    count_file: dir.path().join("salt-states-count"),
                    poll_interval: Duration::from_millis(10),
                },
            },
            UpdateState::default(),
            Collaborators {
                store: StateStore::new(dir.path().join("saltUpdate.json")),
                device_config: DeviceConfigStore::new(dir.path().join("config.toml")),
                runner: runner.clone(),
                checker: Arc::new(NothingNew),
                emitter: Arc::new(Discard),
                metrics: Some(metrics),
            },
        );
        let config = RpcConfig {
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..RpcConfig::default()
        };
        let state = Arc::new(RpcState::new(orchestrator.clone(), Some(registry)));
        let server = spawn_rpc_server(state, &config).unwrap();
        Self {
            _dir: dir,
            runner,
            orchestrator,
            server,
        }
    }

    fn client(&self, identity: &str) -> RpcClient {
        RpcClient::new(self.server.addr(), identity, Duration::from_secs(10)).unwrap()
    }

    async fn wait_idle(&self) {
        for _ in 0..200 {
            if !self.orchestrator.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("call did not finish");
    }
}

#[tokio::test]
async fn both_identities_serve_the_same_state() {
    let harness = Harness::start().await;
    let primary = harness.client(PRIMARY).state().await.unwrap();
    let legacy = harness.client(LEGACY).state().await.unwrap();
    assert_eq!(primary, legacy);
    assert!(!harness.client(LEGACY).is_running().await.unwrap());
    harness.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn sync_ping_while_running_is_a_conflict() {
    let harness = Harness::start().await;
    let client = harness.client(PRIMARY);

    client.run_ping().await.unwrap();
    assert!(client.is_running().await.unwrap());

    let err = client.run_ping_sync().await.unwrap_err();
    assert!(err.is_conflict());
    match err {
        salt_updater_api::ClientError::Remote { name, .. } => {
            assert_eq!(name, "org.cacophony.saltupdater.RunPingSync");
        }
        other => panic!("unexpected error {other:?}"),
    }

    harness.runner.gate.add_permits(1);
    harness.wait_idle().await;

    harness.runner.gate.add_permits(1);
    let state = client.run_ping_sync().await.unwrap();
    assert!(state.last_call_succeeded);
    assert_eq!(state.last_call_args, vec!["test.ping".to_owned()]);
    assert!(state.last_update.is_none());
    harness.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn run_update_without_news_reports_no_update() {
    let harness = Harness::start().await;
    let client = harness.client(PRIMARY);
    client.run_update().await.unwrap();
    let state = client.state().await.unwrap();
    assert_eq!(state.progress_percent, 100);
    assert_eq!(state.progress_label, "No update available");
    assert!(!client.is_running().await.unwrap());
    harness.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn auto_update_flag_round_trips_through_the_bus() {
    let harness = Harness::start().await;
    let client = harness.client(PRIMARY);
    assert!(client.is_auto_update_on().await.unwrap());
    client.set_auto_update(false).await.unwrap();
    assert!(!harness.client(LEGACY).is_auto_update_on().await.unwrap());
    harness.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn unknown_identity_and_method_are_not_found() {
    let harness = Harness::start().await;
    let http = reqwest::Client::builder().no_proxy().build().unwrap();
    let base = format!("http://{}", harness.server.addr());

    let response = http
        .post(format!("{base}/org.example.other/State"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    let response = http
        .post(format!("{base}/{PRIMARY}/Reboot"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["name"], "org.cacophony.saltupdater.Reboot");

    let response = http
        .post(format!("{base}/{PRIMARY}/SetAutoUpdate"))
        .body("maybe")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    harness.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn metrics_are_exposed() {
    let harness = Harness::start().await;
    harness.client(PRIMARY).run_update().await.unwrap();
    let http = reqwest::Client::builder().no_proxy().build().unwrap();
    let body = http
        .get(format!("http://{}/metrics", harness.server.addr()))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("salt_updater_update_checks_total"));
    harness.server.shutdown().await.unwrap();
}
