//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Control CLI for operators interacting with salt-updater."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use salt_updater_common::{init_cli_tracing, AppConfig, VersionInfo};
use tokio::runtime::Runtime;

mod calls;
mod check;

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    about = "salt-updater control utility",
    long_about = None
)]
struct Cli {
    /// Path to the configuration file shared with the daemon.
    #[arg(long, global = true, value_name = "FILE", env = "SALT_UPDATER_CONFIG")]
    config: Option<PathBuf>,

    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print extended version information and exit"
    )]
    version: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run a salt update if one is not already running")]
    RunUpdate(RunUpdateArgs),
    #[command(about = "Ping the salt master without applying states")]
    Ping,
    #[command(about = "Print the current state of the salt updater")]
    State,
    #[command(about = "Enable the update check at boot")]
    EnableAutoUpdate,
    #[command(about = "Disable the update check at boot")]
    DisableAutoUpdate,
    #[command(about = "Check whether an update is available")]
    CheckForUpdate,
}

#[derive(Debug, Args)]
pub struct RunUpdateArgs {
    /// Run the update even when already up to date.
    #[arg(long)]
    pub force: bool,

    /// Wait a random delay of up to this many minutes before requesting.
    /// Defaults to `schedule.random_delay_minutes`; `0` disables it.
    #[arg(long, value_name = "MINUTES")]
    pub random_delay_minutes: Option<u64>,
}

fn main() -> Result<()> {
    init_cli_tracing();
    let cli = Cli::parse();
    if cli.version {
        println!("{}", VersionInfo::current().extended());
        return Ok(());
    }
    let Some(command) = cli.command else {
        anyhow::bail!("no command specified");
    };

    let candidates = AppConfig::candidates(cli.config.as_deref());
    let config = AppConfig::load(&candidates)?;
    let runtime = Runtime::new()?;
    match command {
        Commands::RunUpdate(args) => runtime.block_on(calls::run_update(&config, &args))?,
        Commands::Ping => runtime.block_on(calls::ping(&config))?,
        Commands::State => runtime.block_on(calls::state(&config))?,
        Commands::EnableAutoUpdate => runtime.block_on(calls::set_auto_update(&config, true))?,
        Commands::DisableAutoUpdate => runtime.block_on(calls::set_auto_update(&config, false))?,
        Commands::CheckForUpdate => {
            runtime.block_on(check::run(&config))?;
        }
    }
    Ok(())
}
