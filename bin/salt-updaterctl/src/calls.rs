//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Control CLI for operators interacting with salt-updater."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use salt_updater_api::RpcClient;
use salt_updater_common::AppConfig;
use tracing::info;

use crate::RunUpdateArgs;

fn client(config: &AppConfig) -> Result<RpcClient> {
    RpcClient::from_config(&config.rpc).context("failed to build RPC client")
}

/// Upper bound of the random delay in minutes. The flag overrides the
/// configured default; forced updates are never delayed.
fn delay_bound_minutes(config: &AppConfig, args: &RunUpdateArgs) -> u64 {
    if args.force {
        return 0;
    }
    args.random_delay_minutes
        .unwrap_or(config.schedule.random_delay_minutes)
}

/// Whole minutes between zero and `bound`, inclusive.
fn pick_delay<R: Rng>(rng: &mut R, bound: u64) -> Duration {
    Duration::from_secs(rng.gen_range(0..=bound) * 60)
}

pub async fn run_update(config: &AppConfig, args: &RunUpdateArgs) -> Result<()> {
    let bound = delay_bound_minutes(config, args);
    if bound > 0 {
        let delay = pick_delay(&mut rand::thread_rng(), bound);
        info!(minutes = delay.as_secs() / 60, "waiting before running salt update");
        tokio::time::sleep(delay).await;
    }
    let client = client(config)?;
    let result = if args.force {
        info!("forcing a salt update");
        client.force_update().await
    } else {
        info!("calling for a salt update");
        client.run_update().await
    };
    result.context("error calling for a salt update")
}

pub async fn ping(config: &AppConfig) -> Result<()> {
    info!("calling salt ping");
    client(config)?
        .run_ping()
        .await
        .context("failed to request ping")
}

pub async fn state(config: &AppConfig) -> Result<()> {
    let state = client(config)?
        .state()
        .await
        .context("failed to get salt state")?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

pub async fn set_auto_update(config: &AppConfig, enabled: bool) -> Result<()> {
    client(config)?
        .set_auto_update(enabled)
        .await
        .context("failed to change auto update setting")?;
    println!(
        "Auto update {}",
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}
