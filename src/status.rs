//! Instance lifecycle state machine
//!
//! A persisted instance is always in one of four statuses. No status is
//! terminal: `ERROR` recovers through `RETRY`, and `TERMINATING` moves back
//! to `ACTIVE` when the workload reappears. Status changes go through a fixed
//! `(state, event)` table, with one override layered on top: a signal that
//! says the workload is running forces `ACTIVE` before the table is ever
//! consulted, because the platform can report a healthy workload while the
//! record is stuck in `CREATING` or `ERROR`.

use serde::{Deserialize, Serialize};

use crate::error::ControlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChallengeStatus {
    Creating,
    Active,
    Terminating,
    Error,
}

impl ChallengeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeStatus::Creating => "CREATING",
            ChallengeStatus::Active => "ACTIVE",
            ChallengeStatus::Terminating => "TERMINATING",
            ChallengeStatus::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for ChallengeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ChallengeStatus {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATING" => Ok(ChallengeStatus::Creating),
            "ACTIVE" => Ok(ChallengeStatus::Active),
            "TERMINATING" => Ok(ChallengeStatus::Terminating),
            "ERROR" => Ok(ChallengeStatus::Error),
            other => Err(ControlError::Parse(format!(
                "unknown challenge status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusEvent {
    Created,
    Activated,
    TerminationRequested,
    Terminated,
    ErrorOccurred,
    Retry,
}

/// The complete transition table. Pairs not listed keep the current status,
/// except `ErrorOccurred` which forces `ERROR` from anywhere.
const TRANSITIONS: [(ChallengeStatus, StatusEvent, ChallengeStatus); 8] = [
    (ChallengeStatus::Creating, StatusEvent::Activated, ChallengeStatus::Active),
    (ChallengeStatus::Creating, StatusEvent::ErrorOccurred, ChallengeStatus::Error),
    (ChallengeStatus::Active, StatusEvent::TerminationRequested, ChallengeStatus::Terminating),
    (ChallengeStatus::Active, StatusEvent::ErrorOccurred, ChallengeStatus::Error),
    (ChallengeStatus::Terminating, StatusEvent::Terminated, ChallengeStatus::Active),
    (ChallengeStatus::Terminating, StatusEvent::ErrorOccurred, ChallengeStatus::Error),
    (ChallengeStatus::Error, StatusEvent::Retry, ChallengeStatus::Creating),
    (ChallengeStatus::Error, StatusEvent::Activated, ChallengeStatus::Active),
];

/// Look up `(from, event)` in the transition table.
pub fn transition(from: ChallengeStatus, event: StatusEvent) -> Option<ChallengeStatus> {
    TRANSITIONS
        .iter()
        .find(|(f, e, _)| *f == from && *e == event)
        .map(|(_, _, to)| *to)
}

/// Whether `to` is reachable from `from`: staying put always counts, and
/// otherwise some event in the table must make the move.
pub fn can_transition(from: ChallengeStatus, to: ChallengeStatus) -> bool {
    from == to || TRANSITIONS.iter().any(|(f, _, t)| *f == from && *t == to)
}

/// Map a raw orchestrator phase string to a lifecycle event. Matching is
/// case-insensitive; anything unrecognized counts as an error signal.
pub fn event_from_signal(raw_signal: &str) -> StatusEvent {
    match raw_signal.trim().to_ascii_lowercase().as_str() {
        "pending" | "creating" => StatusEvent::Created,
        "running" | "active" => StatusEvent::Activated,
        "terminating" => StatusEvent::TerminationRequested,
        "terminated" | "succeeded" => StatusEvent::Terminated,
        _ => StatusEvent::ErrorOccurred,
    }
}

/// The override rule: either signal reporting a live workload forces
/// `ACTIVE`, bypassing the transition table entirely.
pub fn running_override(raw_signal: &str, secondary_signal: &str) -> Option<ChallengeStatus> {
    if indicates_running(raw_signal) || indicates_running(secondary_signal) {
        Some(ChallengeStatus::Active)
    } else {
        None
    }
}

fn indicates_running(signal: &str) -> bool {
    matches!(
        signal.trim().to_ascii_lowercase().as_str(),
        "running" | "active"
    )
}

/// Status for an instance observed live with no prior record. Every arm is
/// stable: feeding the same signals back through [`next_status`] keeps the
/// status picked here.
pub fn status_for_new_instance(raw_signal: &str, secondary_signal: &str) -> ChallengeStatus {
    if let Some(forced) = running_override(raw_signal, secondary_signal) {
        return forced;
    }
    match raw_signal.trim().to_ascii_lowercase().as_str() {
        "pending" | "creating" => ChallengeStatus::Creating,
        "running" | "active" => ChallengeStatus::Active,
        "terminating" => ChallengeStatus::Terminating,
        // Already gone at first sight. ERROR holds under repeated terminated
        // signals, where TERMINATING would bounce to ACTIVE through the
        // table's reappearance row.
        "terminated" | "succeeded" => ChallengeStatus::Error,
        _ => ChallengeStatus::Error,
    }
}

/// Next status for an instance that already has a record.
pub fn next_status(
    current: ChallengeStatus,
    raw_signal: &str,
    secondary_signal: &str,
) -> ChallengeStatus {
    if let Some(forced) = running_override(raw_signal, secondary_signal) {
        return forced;
    }
    let event = event_from_signal(raw_signal);
    match transition(current, event) {
        Some(next) => next,
        None if event == StatusEvent::ErrorOccurred => ChallengeStatus::Error,
        None => current,
    }
}
