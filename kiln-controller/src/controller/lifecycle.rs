//! Build lifecycle state machine
//!
//! `next_status` is the whole transition table; `apply_event` applies it to
//! the stored build with a compare-and-swap, recomputing from a fresh read
//! whenever another writer got there first.

use chrono::{DateTime, Utc};
use kiln_core::domain::build::{Build, BuildPhase, BuildStatus, StatusReason};
use kiln_core::domain::meta::ObjectKey;
use tracing::{debug, info};

use crate::repository::{Store, StoreError, StoreResult, Versioned};

/// Something that happened to a build
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Builder image and output resolved
    Prepared,
    PrepareFailed(String),
    /// The executor accepted the build under this handle
    Dispatched(String),
    Started,
    StartFailed(String),
    Completed,
    Failed { exit_code: i32 },
    InfrastructureFailure(String),
    TimedOut,
    Cancel,
}

/// Computes the status after `event`, or `None` if the event does not apply
pub fn next_status(
    status: &BuildStatus,
    event: &LifecycleEvent,
    now: DateTime<Utc>,
) -> Option<BuildStatus> {
    use BuildPhase::*;
    use LifecycleEvent as E;

    if status.phase.is_terminal() {
        return None;
    }

    let next = match (status.phase, event) {
        (New, E::Prepared) => BuildStatus {
            phase: Pending,
            last_transition: now,
            ..status.clone()
        },
        (New, E::PrepareFailed(message)) => finish(
            status,
            now,
            Error,
            Some(StatusReason::PrepareFailed),
            Some(message.clone()),
        ),

        (Pending, E::Dispatched(handle)) if status.execution.is_none() => BuildStatus {
            execution: Some(handle.clone()),
            ..status.clone()
        },
        (Pending, E::Started) => BuildStatus {
            phase: Running,
            start_timestamp: Some(now),
            last_transition: now,
            ..status.clone()
        },
        (Pending, E::StartFailed(message)) => finish(
            status,
            now,
            Error,
            Some(StatusReason::StartFailed),
            Some(message.clone()),
        ),
        (Pending, E::TimedOut) => finish(
            status,
            now,
            Error,
            Some(StatusReason::PendingTimeout),
            Some("build did not start in time".to_string()),
        ),

        (Running, E::Completed) => BuildStatus {
            exit_code: Some(0),
            ..finish(status, now, Complete, None, None)
        },
        (Running, E::Failed { exit_code }) => BuildStatus {
            exit_code: Some(*exit_code),
            ..finish(
                status,
                now,
                Failed,
                Some(StatusReason::ExecutionFailure),
                Some(format!("build exited with code {}", exit_code)),
            )
        },
        (Running, E::InfrastructureFailure(message)) => finish(
            status,
            now,
            Error,
            Some(StatusReason::InfrastructureError),
            Some(message.clone()),
        ),
        (Running, E::TimedOut) => finish(
            status,
            now,
            Error,
            Some(StatusReason::RunningTimeout),
            Some("build exceeded its running time".to_string()),
        ),

        (_, E::Cancel) => finish(
            status,
            now,
            Cancelled,
            Some(StatusReason::CancelledBuild),
            Some("build was cancelled".to_string()),
        ),

        _ => return None,
    };

    Some(next)
}

fn finish(
    status: &BuildStatus,
    now: DateTime<Utc>,
    phase: BuildPhase,
    reason: Option<StatusReason>,
    message: Option<String>,
) -> BuildStatus {
    BuildStatus {
        phase,
        completion_timestamp: Some(now),
        last_transition: now,
        reason,
        message,
        duration_secs: status
            .start_timestamp
            .map(|start| (now - start).num_seconds()),
        ..status.clone()
    }
}

/// Result of applying an event to a stored build
#[derive(Debug)]
pub enum ApplyOutcome {
    /// The status changed and was written at the returned version
    Applied(Versioned<Build>),
    /// The event does not apply to the build's current state
    Ignored(Versioned<Build>),
    NotFound,
}

/// Applies an event to the stored build
///
/// Every attempt reads the build, computes the transition from what it read
/// and writes with a compare-and-swap. A conflict triggers a fresh read, up to
/// `conflict_retries` times.
pub async fn apply_event(
    store: &Store,
    key: &ObjectKey,
    event: &LifecycleEvent,
    conflict_retries: u32,
) -> StoreResult<ApplyOutcome> {
    let mut attempt = 0;

    loop {
        attempt += 1;

        let Some(current) = store.get::<Build>(key).await? else {
            return Ok(ApplyOutcome::NotFound);
        };

        let Some(status) = next_status(&current.object.status, event, Utc::now()) else {
            debug!(
                "Ignoring {:?} for build {} in phase {}",
                event, key, current.object.status.phase
            );
            return Ok(ApplyOutcome::Ignored(current));
        };

        let from = current.object.status.phase;
        let mut updated = current.object.clone();
        updated.status = status;

        match store.update(&updated, current.version).await {
            Ok(version) => {
                if from != updated.status.phase {
                    info!("Build {}: {} -> {}", key, from, updated.status.phase);
                }
                return Ok(ApplyOutcome::Applied(Versioned {
                    object: updated,
                    version,
                }));
            }
            Err(StoreError::Conflict { .. }) if attempt <= conflict_retries => {
                debug!(
                    "Conflict applying {:?} to build {} (attempt {}), re-reading",
                    event, key, attempt
                );
            }
            Err(e) => return Err(e),
        }
    }
}
