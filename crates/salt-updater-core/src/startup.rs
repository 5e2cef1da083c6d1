//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Daemon start-up reconciliation of the persisted update state."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::Path;

use salt_updater_persistence::{PersistenceError, StateStore, UpdateState};
use tracing::{info, warn};

/// Node group the device currently belongs to, trimmed.
pub async fn read_node_group(path: &Path) -> std::io::Result<String> {
    Ok(tokio::fs::read_to_string(path).await?.trim().to_owned())
}

/// Node group for start-up. An unreadable file is logged and yields `None`.
pub async fn startup_node_group(path: &Path) -> Option<String> {
    match read_node_group(path).await {
        Ok(group) => Some(group),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unable to read node group; keeping recorded state");
            None
        }
    }
}

/// Prepare the state record for a fresh daemon process.
///
/// When the node group differs from the one recorded by the last call the
/// record is replaced, dropping the update watermark. An unknown node group
/// never resets the record. The progress fields are always cleared and the
/// result is persisted.
pub fn reconcile_startup_state(
    store: &StateStore,
    node_group: Option<&str>,
) -> Result<UpdateState, PersistenceError> {
    let mut state = store.load()?;
    if let Some(node_group) = node_group.filter(|group| state.last_call_node_group.trim() != *group) {
        info!(
            previous = %state.last_call_node_group,
            current = %node_group,
            "node group has changed; resetting last update time"
        );
        state = UpdateState {
            last_call_node_group: node_group.to_owned(),
            ..UpdateState::default()
        };
    }
    state.reset_progress();
    state.running = false;
    state.running_args.clear();
    store.save(&state)?;
    Ok(state)
}
