//! The Task Registry external interface (SPEC_FULL.md §2A, §6).
//!
//! Modeled the same way the originating codebase models its pluggable
//! agent harness: an object-safe `async_trait`, stored behind `Arc<dyn ...>`
//! so `DispatcherCore` never depends on a concrete backend. Building a real
//! (persistent) registry is out of scope; `dispatcher-test-utils` ships an
//! in-memory implementation sufficient to drive the end-to-end scenarios.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::types::{Task, TaskState};

#[derive(Debug, Clone)]
pub struct Taskset {
    pub spec_name: String,
    pub version: u32,
    pub tasks: Vec<Task>,
}

/// Read-heavy, append-mostly task store the dispatcher polls and updates.
#[async_trait]
pub trait TaskRegistry: Send + Sync {
    async fn get_ready_tasks(&self, spec: Option<&str>) -> anyhow::Result<Vec<Task>>;
    async fn get_taskset(&self, spec: &str) -> anyhow::Result<Option<Taskset>>;
    async fn get_task(&self, spec: &str, task_id: &str) -> anyhow::Result<Option<Task>>;
    async fn list_tasksets(&self) -> anyhow::Result<Vec<String>>;
    async fn update_task_state(
        &self,
        spec: &str,
        task_id: &str,
        new_state: TaskState,
        metadata: Option<HashMap<String, String>>,
    ) -> anyhow::Result<()>;

    /// Persists a priority change (SPEC_FULL.md §4.9 `update_task_priority`).
    async fn update_task_priority(&self, spec: &str, task_id: &str, new_priority: i64) -> anyhow::Result<()>;
}
