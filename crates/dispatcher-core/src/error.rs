//! Error types for the dispatcher.
//!
//! Each component that can fail in a caller-meaningful way gets its own
//! variant set; [`DispatcherError`] unifies them for the handful of entry
//! points that surface errors to external callers. The main loop itself
//! never propagates an error -- see `dispatcher::DispatcherCore::run_iteration`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskAssignmentError {
    #[error("slot allocation failed for task {task_id}: {source}")]
    SlotAllocation {
        task_id: String,
        #[source]
        source: SlotAllocationError,
    },
    #[error("runner launch failed for task {task_id}: {source}")]
    RunnerLaunch {
        task_id: String,
        #[source]
        source: RunnerLaunchError,
    },
}

#[derive(Debug, Error)]
pub enum SlotAllocationError {
    #[error("no slot available for repo {repo_name}")]
    Unavailable { repo_name: String },
    #[error("repo pool error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum RunnerLaunchError {
    #[error("exhausted {attempts} launch attempt(s) for pool {pool_name}: {last_error}")]
    ExhaustedRetries {
        pool_name: String,
        attempts: u32,
        last_error: String,
    },
    #[error("backend unavailable for pool kind {0:?}")]
    BackendUnavailable(crate::types::PoolKind),
}

#[derive(Debug, Error)]
pub enum PoolNotFoundError {
    #[error("unknown agent pool: {0}")]
    Unknown(String),
}

#[derive(Debug, Error)]
pub enum DeadlockDetectedError {
    #[error("detected {} cycle(s) in the task dependency graph: {}", .cycles.len(), .cycles.join("; "))]
    Cycles { cycles: Vec<String> },
}

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error(transparent)]
    TaskAssignment(#[from] TaskAssignmentError),
    #[error(transparent)]
    SlotAllocation(#[from] SlotAllocationError),
    #[error(transparent)]
    RunnerLaunch(#[from] RunnerLaunchError),
    #[error(transparent)]
    PoolNotFound(#[from] PoolNotFoundError),
    #[error(transparent)]
    DeadlockDetected(#[from] DeadlockDetectedError),
    #[error("external collaborator error: {0}")]
    External(#[from] anyhow::Error),
}
