//! ---
//! ems_section: "04-configuration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the updater runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

/// Location the daemon and CLI look at when no explicit path is supplied.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cacophony/salt-updater.toml";

fn default_state_file() -> PathBuf {
    PathBuf::from("/etc/cacophony/saltUpdate.json")
}

fn default_node_group_file() -> PathBuf {
    PathBuf::from("/etc/cacophony/salt-nodegroup")
}

fn default_minion_id_file() -> PathBuf {
    PathBuf::from("/etc/salt/minion_id")
}

fn default_tool_log_file() -> PathBuf {
    PathBuf::from("/var/log/salt/minion")
}

fn default_state_count_file() -> PathBuf {
    PathBuf::from("/etc/cacophony/salt-states-count")
}

fn default_device_config_file() -> PathBuf {
    PathBuf::from("/etc/cacophony/config.toml")
}

fn default_event_log_file() -> PathBuf {
    PathBuf::from("/var/lib/salt-updater/events.log")
}

fn default_tool_program() -> String {
    "salt-call".to_owned()
}

fn default_ping_args() -> Vec<String> {
    vec!["test.ping".to_owned()]
}

fn default_update_args() -> Vec<String> {
    vec![
        "state.apply".to_owned(),
        "--state-output=mixed".to_owned(),
        "--output-diff".to_owned(),
    ]
}

fn default_manifest_url() -> String {
    "https://api.cacophony.org.nz/saltops/manifest.json".to_owned()
}

fn default_manifest_format() -> ManifestFormat {
    ManifestFormat::BranchManifest
}

fn default_branches() -> IndexMap<String, String> {
    [
        ("tc2-dev", "dev"),
        ("tc2-test", "test"),
        ("tc2-prod", "prod"),
        ("dev-pis", "dev"),
        ("test-pis", "test"),
        ("prod-pis", "prod"),
    ]
    .into_iter()
    .map(|(group, branch)| (group.to_owned(), branch.to_owned()))
    .collect()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_rpc_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8745))
}

fn default_rpc_identities() -> Vec<String> {
    vec![
        "org.cacophony.saltupdater".to_owned(),
        "org.cacophony.SaltUpdater".to_owned(),
    ]
}

fn default_rpc_client_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_check_interval() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_random_delay_minutes() -> u64 {
    120
}

fn default_connectivity_enabled() -> bool {
    true
}

fn default_interface() -> String {
    "wwan0".to_owned()
}

fn default_operstate_root() -> PathBuf {
    PathBuf::from("/sys/class/net")
}

fn default_connectivity_poll() -> Duration {
    Duration::from_secs(5)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("/var/log/salt-updater")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

/// Primary configuration object for the updater runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub tool: ToolConfig,
    #[serde(default)]
    pub versioning: VersioningConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    /// `None` when no file was found and built-in defaults are in effect.
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "SALT_UPDATER_CONFIG";

    /// Load configuration from disk, respecting the `SALT_UPDATER_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the effective source path.
    ///
    /// An explicit `SALT_UPDATER_CONFIG` path must exist. Candidates are tried
    /// in order; when none exists the built-in defaults are returned, which
    /// match the fixed paths used on a stock device.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        debug!(
            inspected = %candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            "no configuration file found; using defaults"
        );
        Ok(LoadedAppConfig {
            config: Self::default(),
            source: None,
        })
    }

    /// Default candidate list, with an optional explicit path taking precedence.
    pub fn candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(path) = explicit {
            candidates.push(path.to_path_buf());
        }
        candidates.push(PathBuf::from(DEFAULT_CONFIG_PATH));
        candidates
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.tool.validate()?;
        self.versioning.validate()?;
        self.rpc.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Fixed-path inputs and outputs on the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_node_group_file")]
    pub node_group_file: PathBuf,
    #[serde(default = "default_minion_id_file")]
    pub minion_id_file: PathBuf,
    #[serde(default = "default_tool_log_file")]
    pub tool_log_file: PathBuf,
    #[serde(default = "default_state_count_file")]
    pub state_count_file: PathBuf,
    #[serde(default = "default_device_config_file")]
    pub device_config_file: PathBuf,
    #[serde(default = "default_event_log_file")]
    pub event_log_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            node_group_file: default_node_group_file(),
            minion_id_file: default_minion_id_file(),
            tool_log_file: default_tool_log_file(),
            state_count_file: default_state_count_file(),
            device_config_file: default_device_config_file(),
            event_log_file: default_event_log_file(),
        }
    }
}

/// External state-application tool invocation settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(default = "default_tool_program")]
    pub program: String,
    #[serde(default = "default_ping_args")]
    pub ping_args: Vec<String>,
    #[serde(default = "default_update_args")]
    pub update_args: Vec<String>,
    /// Upper bound on a single tool call. Unset means the call may run indefinitely.
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub timeout: Option<Duration>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            program: default_tool_program(),
            ping_args: default_ping_args(),
            update_args: default_update_args(),
            timeout: None,
        }
    }
}

impl ToolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(anyhow!("tool.program must not be empty"));
        }
        if self.ping_args.is_empty() {
            return Err(anyhow!("tool.ping_args must contain at least one argument"));
        }
        if self.update_args.is_empty() {
            return Err(anyhow!(
                "tool.update_args must contain at least one argument"
            ));
        }
        Ok(())
    }
}

/// Wire format served by the remote version endpoint.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ManifestFormat {
    /// JSON object keyed by branch, then by device class.
    #[default]
    BranchManifest,
    /// GitHub commits listing for the branch.
    GithubCommits,
}

/// Remote version check settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersioningConfig {
    #[serde(default = "default_manifest_url")]
    pub manifest_url: String,
    #[serde(default = "default_manifest_format")]
    pub format: ManifestFormat,
    /// Node group to manifest branch mapping.
    #[serde(default = "default_branches")]
    pub branches: IndexMap<String, String>,
    /// Overrides the device class derived from the node group.
    #[serde(default)]
    pub device_class: Option<String>,
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
}

impl Default for VersioningConfig {
    fn default() -> Self {
        Self {
            manifest_url: default_manifest_url(),
            format: default_manifest_format(),
            branches: default_branches(),
            device_class: None,
            request_timeout: default_request_timeout(),
        }
    }
}

impl VersioningConfig {
    pub fn validate(&self) -> Result<()> {
        if self.branches.is_empty() {
            return Err(anyhow!(
                "versioning.branches must map at least one node group"
            ));
        }
        url::Url::parse(&self.manifest_url).map_err(|err| {
            anyhow!(
                "versioning.manifest_url {} is not a valid URL: {}",
                self.manifest_url,
                err
            )
        })?;
        Ok(())
    }
}

/// Local RPC surface settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_listen")]
    pub listen: SocketAddr,
    /// Every identity serves the same handler; the first is preferred by clients.
    #[serde(default = "default_rpc_identities")]
    pub identities: Vec<String>,
    /// Covers `RunPingSync`, which waits for the tool to finish.
    #[serde(default = "default_rpc_client_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub client_timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            listen: default_rpc_listen(),
            identities: default_rpc_identities(),
            client_timeout: default_rpc_client_timeout(),
        }
    }
}

impl RpcConfig {
    pub fn validate(&self) -> Result<()> {
        if self.identities.is_empty() {
            return Err(anyhow!("rpc.identities must contain at least one name"));
        }
        if let Some(bad) = self
            .identities
            .iter()
            .find(|name| name.is_empty() || name.contains('/'))
        {
            return Err(anyhow!("rpc identity {:?} is not a valid bus name", bad));
        }
        Ok(())
    }

    /// Identity used by clients.
    pub fn primary_identity(&self) -> &str {
        self.identities
            .first()
            .map(String::as_str)
            .unwrap_or("org.cacophony.saltupdater")
    }
}

/// Unattended update scheduling.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_check_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub check_interval: Duration,
    /// Upper bound for the random delay used by cron-triggered CLI requests.
    #[serde(default = "default_random_delay_minutes")]
    pub random_delay_minutes: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            random_delay_minutes: default_random_delay_minutes(),
        }
    }
}

/// Modem connectivity listener settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    #[serde(default = "default_connectivity_enabled")]
    pub enabled: bool,
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_operstate_root")]
    pub operstate_root: PathBuf,
    #[serde(default = "default_connectivity_poll")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub poll_interval: Duration,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            enabled: default_connectivity_enabled(),
            interface: default_interface(),
            operstate_root: default_operstate_root(),
            poll_interval: default_connectivity_poll(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_device_defaults() {
        let config: AppConfig = "".parse().unwrap();
        assert_eq!(config.paths.state_file, default_state_file());
        assert_eq!(config.tool.program, "salt-call");
        assert_eq!(config.tool.ping_args, vec!["test.ping".to_owned()]);
        assert_eq!(config.versioning.branches.get("prod-pis").unwrap(), "prod");
        assert_eq!(config.rpc.identities.len(), 2);
        assert!(config.tool.timeout.is_none());
    }

    #[test]
    fn durations_are_read_as_seconds() {
        let config: AppConfig = r#"
            [tool]
            timeout = 3600

            [schedule]
            check_interval = 60
        "#
        .parse()
        .unwrap();
        assert_eq!(config.tool.timeout, Some(Duration::from_secs(3600)));
        assert_eq!(config.schedule.check_interval, Duration::from_secs(60));
    }

    #[test]
    fn github_commits_format_is_kebab_case() {
        let config: AppConfig = r#"
            [versioning]
            format = "github-commits"
            manifest_url = "https://api.github.com/repos/TheCacophonyProject/saltops/commits"
        "#
        .parse()
        .unwrap();
        assert_eq!(config.versioning.format, ManifestFormat::GithubCommits);
    }

    #[test]
    fn validation_rejects_empty_identities() {
        let err = r#"
            [rpc]
            identities = []
        "#
        .parse::<AppConfig>()
        .unwrap_err();
        assert!(err.to_string().contains("identities"));
    }

    #[test]
    fn validation_rejects_empty_branch_map() {
        let err = r#"
            [versioning.branches]
        "#
        .parse::<AppConfig>()
        .unwrap_err();
        assert!(err.to_string().contains("branches"));
    }

    #[test]
    fn missing_candidates_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let loaded = AppConfig::load_with_source(&[missing]).unwrap();
        assert!(loaded.source.is_none());
        assert_eq!(loaded.config.rpc.listen, default_rpc_listen());
    }

    #[test]
    fn first_existing_candidate_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("salt-updater.toml");
        fs::write(&path, "[schedule]\nrandom_delay_minutes = 5\n").unwrap();
        let loaded = AppConfig::load_with_source(&[dir.path().join("nope.toml"), path.clone()])
            .unwrap();
        assert_eq!(loaded.source.as_deref(), Some(path.as_path()));
        assert_eq!(loaded.config.schedule.random_delay_minutes, 5);
    }
}
