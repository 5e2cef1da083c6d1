//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Salt run summary parsing and outcome event construction."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use salt_updater_persistence::UpdateState;
use serde::{Deserialize, Serialize};

pub const EVENT_TYPE: &str = "salt-update";

static NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-?\d[\d,]*\.?\d*").expect("number pattern is valid"));

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum OutcomeError {
    #[error("failed to parse output of salt update: expected {expected} number(s) in {line:?}, found {found}")]
    Parse {
        line: String,
        expected: usize,
        found: usize,
    },
}

/// Counts read from the summary block of `state.apply` output.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OutcomeSummary {
    pub succeeded: f64,
    pub changed: f64,
    pub failed: f64,
    pub run_time: f64,
}

/// Detail fields of an outcome event. `out` and `runTime` are only attached
/// when something failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeDetails {
    pub changed: f64,
    pub failed: f64,
    pub succeeded: f64,
    pub nodegroup: String,
    pub success: bool,
    pub args: Vec<String>,
    #[serde(rename = "minionID", skip_serializing_if = "Option::is_none")]
    pub minion_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out: Option<String>,
    #[serde(rename = "runTime", skip_serializing_if = "Option::is_none")]
    pub run_time: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub details: OutcomeDetails,
}

/// Numeric tokens in `line`, thousands separators removed.
pub fn extract_numbers(line: &str) -> Vec<f64> {
    NUMBER
        .find_iter(line)
        .filter_map(|m| m.as_str().replace(',', "").parse().ok())
        .collect()
}

fn expect_numbers(line: &str, expected: usize) -> Result<Vec<f64>, OutcomeError> {
    let numbers = extract_numbers(line);
    if numbers.len() != expected {
        return Err(OutcomeError::Parse {
            line: line.to_owned(),
            expected,
            found: numbers.len(),
        });
    }
    Ok(numbers)
}

/// Read the summary lines from captured output. Lines may appear in any
/// order; an absent line leaves its fields at zero, a malformed one fails.
/// Prefixes must start the line, so indented state comments are ignored.
pub fn summarize(output: &str) -> Result<OutcomeSummary, OutcomeError> {
    let mut summary = OutcomeSummary::default();
    for line in output.lines() {
        if line.starts_with("Succeeded:") {
            let numbers = expect_numbers(line, 2)?;
            summary.succeeded = numbers[0];
            summary.changed = numbers[1];
        } else if line.starts_with("Failed:") {
            summary.failed = expect_numbers(line, 1)?[0];
        } else if line.starts_with("Total run time:") {
            summary.run_time = expect_numbers(line, 1)?[0];
        }
    }
    Ok(summary)
}

/// Build the outcome event for the last call recorded in `state`.
pub fn build_event(state: &UpdateState, minion_id: Option<&str>) -> Result<OutcomeEvent, OutcomeError> {
    let summary = summarize(&state.last_call_output)?;
    let diagnose = summary.failed > 0.0 || !state.last_call_succeeded;
    Ok(OutcomeEvent {
        event_type: EVENT_TYPE.to_owned(),
        timestamp: Utc::now(),
        details: OutcomeDetails {
            changed: summary.changed,
            failed: summary.failed,
            succeeded: summary.succeeded,
            nodegroup: state.last_call_node_group.clone(),
            success: state.last_call_succeeded,
            args: state.last_call_args.clone(),
            minion_id: minion_id.map(str::to_owned),
            out: diagnose.then(|| state.last_call_output.clone()),
            run_time: diagnose.then_some(summary.run_time),
        },
    })
}
