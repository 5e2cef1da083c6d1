//! ---
//! ems_section: "14-versioning-licensing-system"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Update availability report for operators."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use salt_updater_api::RpcClient;
use salt_updater_common::AppConfig;
use salt_updater_core::read_node_group;
use salt_updater_versioning::{CheckerSettings, RemoteVersionChecker, UpdateChecker};
use tracing::debug;

const DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// What `check-for-update` concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    NodeGroupChanged,
    UpdateAvailable,
    UpToDate,
}

/// Report whether the device should run an update.
///
/// A node group that differs from the one recorded by the last call always
/// warrants an update; otherwise the recorded watermark is compared with the
/// remote publish time.
pub async fn run(config: &AppConfig) -> Result<Verdict> {
    let state = RpcClient::from_config(&config.rpc)
        .context("failed to build RPC client")?
        .state()
        .await
        .context("failed to get salt state")?;
    let recorded = state.last_call_node_group.trim().to_owned();
    let current = read_node_group(&config.paths.node_group_file)
        .await
        .with_context(|| {
            format!(
                "failed to read node group file {}",
                config.paths.node_group_file.display()
            )
        })?;
    debug!(recorded = %recorded, current = %current, "comparing node groups");
    if recorded != current {
        println!("Found node group change ('{recorded}' -> '{current}'), recommend a salt update.");
        return Ok(Verdict::NodeGroupChanged);
    }

    println!(
        "Last update was run at '{}', with node group '{}'",
        display(state.last_update),
        recorded
    );

    let checker = RemoteVersionChecker::new(CheckerSettings::from(&config.versioning))
        .context("failed to construct version checker")?;
    let check = checker
        .check_update_available(&current, state.last_update)
        .await
        .context("error getting latest update time")?;
    println!(
        "Latest software update was published at '{}', for node group '{}' (branch '{}')",
        display(check.published_at),
        current,
        check.branch
    );
    if check.available {
        println!("Found new update, recommend a salt update.");
        Ok(Verdict::UpdateAvailable)
    } else {
        println!("No new update found, nothing to do.");
        Ok(Verdict::UpToDate)
    }
}

fn display(timestamp: Option<DateTime<Utc>>) -> String {
    timestamp
        .map(|ts| ts.format(DISPLAY_FORMAT).to_string())
        .unwrap_or_else(|| "never".to_owned())
}
