//! Collection lifecycle status and its validated transition table.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a collection (source or live-query result).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CollectionStatus {
    Idle,
    Loading,
    InitialCommit,
    Ready,
    Error,
    CleanedUp,
}

impl CollectionStatus {
    /// Whether `self → next` is a legal transition.
    ///
    /// The table: idle → {loading, error, cleaned-up}; loading →
    /// {initialCommit, ready, error, cleaned-up}; initialCommit → {ready,
    /// error, cleaned-up}; ready → {cleaned-up, error}; error → {idle,
    /// cleaned-up}; cleaned-up → {loading, error}.
    pub fn can_transition_to(self, next: CollectionStatus) -> bool {
        use CollectionStatus::*;
        matches!(
            (self, next),
            (Idle, Loading | Error | CleanedUp)
                | (Loading, InitialCommit | Ready | Error | CleanedUp)
                | (InitialCommit, Ready | Error | CleanedUp)
                | (Ready, CleanedUp | Error)
                | (Error, Idle | CleanedUp)
                | (CleanedUp, Loading | Error)
        )
    }
}

impl fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CollectionStatus::Idle => "idle",
            CollectionStatus::Loading => "loading",
            CollectionStatus::InitialCommit => "initialCommit",
            CollectionStatus::Ready => "ready",
            CollectionStatus::Error => "error",
            CollectionStatus::CleanedUp => "cleaned-up",
        };
        f.write_str(s)
    }
}

/// An attempted illegal status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusError {
    pub from: CollectionStatus,
    pub to: CollectionStatus,
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid status transition: {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for StatusError {}

/// Validate and perform a transition, returning the previous status.
pub fn transition(
    status: &mut CollectionStatus,
    next: CollectionStatus,
) -> Result<CollectionStatus, StatusError> {
    if *status == next {
        return Ok(*status);
    }
    if !status.can_transition_to(next) {
        return Err(StatusError { from: *status, to: next });
    }
    let previous = *status;
    *status = next;
    Ok(previous)
}

/// Payload of a `status:change` event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusChange {
    pub status: CollectionStatus,
    pub previous_status: CollectionStatus,
}
