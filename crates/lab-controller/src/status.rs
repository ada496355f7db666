//! Status aggregation
//!
//! Pure functions turning per-resource judgements (or a fatal input error)
//! into the next [`LabStatus`] plus the events the transition warrants.
//! Nothing here talks to the cluster, which keeps the verdict rules easy to
//! test exhaustively.

use chrono::{DateTime, Utc};

use lab_common::crd::{LabStatus, MESSAGE_INITIALIZING, MESSAGE_NOT_FIXED, MESSAGE_READY};
use lab_common::events::{actions, reasons};

use crate::compare::ResourceJudgement;

/// Severity of a Lab event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LabEventKind {
    /// Informational
    Normal,
    /// Something the Lab author or solver should look at
    Warning,
}

/// An event to record on the Lab
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabEvent {
    /// Normal or Warning
    pub kind: LabEventKind,
    /// Machine-readable reason
    pub reason: &'static str,
    /// Action taken
    pub action: &'static str,
    /// Human-readable note
    pub note: String,
}

impl LabEvent {
    /// The Lab was accepted and its solution hidden
    pub fn initializing() -> Self {
        Self {
            kind: LabEventKind::Normal,
            reason: reasons::INITIALIZING,
            action: actions::BOOTSTRAP,
            note: "Applied given resources and moved the solution into a Secret".to_string(),
        }
    }

    /// The Lab could not be processed
    pub fn invalid(message: &str) -> Self {
        Self {
            kind: LabEventKind::Warning,
            reason: reasons::LAB_INVALID,
            action: actions::GRADE,
            note: message.to_string(),
        }
    }
}

/// Result of one bootstrap or revalidation pass
#[derive(Clone, Debug, PartialEq)]
pub struct LabVerdict {
    /// Status to persist
    pub status: LabStatus,
    /// Events to publish, in order
    pub events: Vec<LabEvent>,
}

impl LabVerdict {
    /// Whether the pass ended in a fatal input error
    pub fn is_error(&self) -> bool {
        self.status.error.is_some()
    }
}

/// What a pass produced
#[derive(Clone, Debug, PartialEq)]
pub enum PassOutcome {
    /// Every expected resource was judged
    Judged(Vec<ResourceJudgement>),
    /// The pass stopped on an error only a spec change can fix
    Failed(String),
}

/// Event for a change of the `ready` verdict
///
/// Only real transitions produce events: reaching Ready from anything else,
/// and falling from Ready back to NotFixed. The first NotFixed verdict after
/// initialization is not news.
pub fn transition_event(previous: Option<bool>, ready: bool) -> Option<LabEvent> {
    match (previous, ready) {
        (Some(true), true) | (Some(false), false) | (None, false) => None,
        (None | Some(false), true) => Some(LabEvent {
            kind: LabEventKind::Normal,
            reason: reasons::LAB_FIXED,
            action: actions::GRADE,
            note: MESSAGE_READY.to_string(),
        }),
        (Some(true), false) => Some(LabEvent {
            kind: LabEventKind::Warning,
            reason: reasons::LAB_NOT_FIXED,
            action: actions::GRADE,
            note: "Live state no longer matches the expected manifests".to_string(),
        }),
    }
}

/// Derive the next status from the previous one and a pass outcome
///
/// `given_digest` records the given manifests applied by this pass; `None`
/// keeps the previous digest. An error outcome keeps the previous verdict and
/// resources so a solver's progress isn't erased by a broken edit.
/// `lastTransitionTime` only moves when something else changed.
pub fn derive_status(
    previous: Option<&LabStatus>,
    outcome: PassOutcome,
    given_digest: Option<String>,
    now: DateTime<Utc>,
) -> LabVerdict {
    let prev = previous.cloned().unwrap_or_default();
    let given_digest = given_digest.or_else(|| prev.given_digest.clone());

    let (mut next, events) = match outcome {
        PassOutcome::Judged(judged) => {
            let ready = judged.iter().all(ResourceJudgement::matched);
            let message = if ready { MESSAGE_READY } else { MESSAGE_NOT_FIXED };
            let next = LabStatus {
                ready: Some(ready),
                message: Some(message.to_string()),
                error: None,
                resources: judged.iter().map(ResourceJudgement::to_status).collect(),
                given_digest,
                last_transition_time: None,
            };
            (next, transition_event(prev.ready, ready).into_iter().collect())
        }
        PassOutcome::Failed(error) => {
            let events = if prev.error.as_deref() == Some(error.as_str()) {
                Vec::new()
            } else {
                vec![LabEvent::invalid(&error)]
            };
            let next = LabStatus {
                ready: prev.ready,
                message: prev
                    .message
                    .clone()
                    .or_else(|| Some(MESSAGE_INITIALIZING.to_string())),
                error: Some(error),
                resources: prev.resources.clone(),
                given_digest,
                last_transition_time: None,
            };
            (next, events)
        }
    };

    let unchanged = LabStatus {
        last_transition_time: None,
        ..prev.clone()
    } == next;
    next.last_transition_time = if unchanged && previous.is_some() {
        prev.last_transition_time
    } else {
        Some(now)
    };

    LabVerdict {
        status: next,
        events,
    }
}

/// Status shown before any pass has completed
pub fn initializing_status() -> LabStatus {
    LabStatus {
        message: Some(MESSAGE_INITIALIZING.to_string()),
        ..Default::default()
    }
}
