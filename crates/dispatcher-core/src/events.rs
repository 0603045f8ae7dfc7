//! Event taxonomy emitted by the dispatcher (SPEC_FULL.md §6) and the
//! `EventStore` trait it is recorded through.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::RunnerHandle;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type")]
pub enum DispatcherEvent {
    TaskAssigned {
        task_id: String,
        runner_id: String,
        slot_id: String,
        pool_name: String,
        timestamp: DateTime<Utc>,
    },
    RunnerStarted {
        runner_id: String,
        slot_id: String,
        pool_name: String,
        handle: HandleSummary,
        timestamp: DateTime<Utc>,
    },
    RunnerFinished {
        runner_id: String,
        slot_id: String,
        success: bool,
        execution_time_seconds: Option<f64>,
        failure_reason: Option<String>,
    },
    TaskCompleted {
        task_id: String,
        runner_id: String,
        execution_time_seconds: Option<f64>,
    },
    TaskFailed {
        task_id: String,
        runner_id: String,
        failure_reason: String,
        retry_count: u32,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleSummary {
    Pid(u32),
    ContainerId(String),
    JobName(String),
}

impl From<&RunnerHandle> for HandleSummary {
    fn from(h: &RunnerHandle) -> Self {
        match h {
            RunnerHandle::Pid(pid) => HandleSummary::Pid(*pid),
            RunnerHandle::ContainerId(id) => HandleSummary::ContainerId(id.clone()),
            RunnerHandle::JobName(name) => HandleSummary::JobName(name.clone()),
        }
    }
}

/// Append-only event sink. Implementations must never block an assignment
/// on a write failure (SPEC_FULL.md §7).
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn record_event(&self, event: DispatcherEvent);
}
