//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Shared registry type used across the daemon.
pub type SharedRegistry = Arc<Registry>;

pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Metrics recorded by the update orchestrator.
#[derive(Clone, Debug)]
pub struct UpdaterMetrics {
    registry: SharedRegistry,
    calls_total: IntCounterVec,
    rejected_total: IntCounter,
    update_checks_total: IntCounterVec,
    running: IntGauge,
    progress_percent: IntGauge,
}

impl UpdaterMetrics {
    pub fn new(registry: SharedRegistry) -> prometheus::Result<Self> {
        let calls_total = IntCounterVec::new(
            Opts::new(
                "salt_updater_calls_total",
                "Completed tool calls by kind and outcome",
            ),
            &["kind", "outcome"],
        )?;
        registry.register(Box::new(calls_total.clone()))?;

        let rejected_total = IntCounter::with_opts(Opts::new(
            "salt_updater_calls_rejected_total",
            "Call requests rejected because another call was in flight",
        ))?;
        registry.register(Box::new(rejected_total.clone()))?;

        let update_checks_total = IntCounterVec::new(
            Opts::new(
                "salt_updater_update_checks_total",
                "Remote version checks by result",
            ),
            &["result"],
        )?;
        registry.register(Box::new(update_checks_total.clone()))?;

        let running = IntGauge::with_opts(Opts::new(
            "salt_updater_call_running",
            "Indicator (0/1) whether a tool call is in flight",
        ))?;
        registry.register(Box::new(running.clone()))?;

        let progress_percent = IntGauge::with_opts(Opts::new(
            "salt_updater_update_progress_percent",
            "Estimated progress of the running update",
        ))?;
        registry.register(Box::new(progress_percent.clone()))?;

        Ok(Self {
            registry,
            calls_total,
            rejected_total,
            update_checks_total,
            running,
            progress_percent,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_call(&self, kind: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.calls_total.with_label_values(&[kind, outcome]).inc();
    }

    pub fn record_rejection(&self) {
        self.rejected_total.inc();
    }

    pub fn record_update_check(&self, result: &str) {
        self.update_checks_total.with_label_values(&[result]).inc();
    }

    pub fn set_running(&self, running: bool) {
        self.running.set(i64::from(running));
    }

    pub fn set_progress(&self, percent: u32) {
        self.progress_percent.set(i64::from(percent));
    }
}
