//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary orchestration and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Update orchestration for salt-updater: the single-flight call guard,
//! progress tracking over the minion log, outcome events and the
//! connectivity-triggered ping.

pub mod connectivity;
pub mod events;
pub mod metrics;
pub mod orchestrator;
pub mod outcome;
pub mod progress;
pub mod startup;
pub mod tool;

pub use connectivity::{
    spawn_connectivity_listener, ConnectivityListener, ConnectivityTasks, OperstateWatcher,
};
pub use events::{EmitError, EventEmitter, EventQueueEmitter};
pub use metrics::{new_registry, SharedRegistry, UpdaterMetrics};
pub use orchestrator::{
    CallHandle, Collaborators, OrchestratorError, OrchestratorSettings, UpdateOrchestrator,
    UpdateRequest,
};
pub use outcome::{build_event, OutcomeDetails, OutcomeError, OutcomeEvent};
pub use progress::{ProgressSink, ProgressTracker, TrackerHandle, TrackerReport, TrackerSettings};
pub use startup::{read_node_group, reconcile_startup_state, startup_node_group};
pub use tool::{SaltCall, ToolOutput, ToolRunner};
