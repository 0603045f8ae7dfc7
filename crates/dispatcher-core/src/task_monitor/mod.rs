//! TaskMonitor (SPEC_FULL.md §4.3): polls the Task Registry and filters
//! ready tasks by dependency resolution.
//!
//! Never raises into the main loop: any registry error is logged and
//! yields an empty result, matching the source's `poll_ready_tasks`.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::registry::TaskRegistry;
use crate::types::{Task, TaskState};

pub struct TaskMonitor {
    registry: Arc<dyn TaskRegistry>,
}

impl TaskMonitor {
    pub fn new(registry: Arc<dyn TaskRegistry>) -> Self {
        TaskMonitor { registry }
    }

    pub async fn poll_ready_tasks(&self, spec: Option<&str>) -> Vec<Task> {
        let candidates = match self.registry.get_ready_tasks(spec).await {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!(error = %err, "failed to poll ready tasks, returning empty");
                return Vec::new();
            }
        };

        let mut ready = Vec::with_capacity(candidates.len());
        for task in candidates {
            if self.dependencies_resolved(&task).await {
                ready.push(task);
            }
        }
        ready
    }

    async fn dependencies_resolved(&self, task: &Task) -> bool {
        if task.dependencies.is_empty() {
            return true;
        }
        let Some(spec_name) = task.spec_name() else {
            warn!(
                task_id = %task.id,
                "task is missing spec_name in metadata, cannot verify dependencies; returning optimistically"
            );
            return true;
        };

        for dep_id in &task.dependencies {
            match self.registry.get_task(spec_name, dep_id).await {
                Ok(Some(dep)) if dep.state == TaskState::Done => {
                    debug!(task_id = %task.id, dep_id, "dependency resolved");
                }
                Ok(Some(_)) => return false,
                Ok(None) => {
                    warn!(task_id = %task.id, dep_id, "dependency not found, treating as unresolved");
                    return false;
                }
                Err(err) => {
                    warn!(task_id = %task.id, dep_id, error = %err, "error loading dependency, treating as unresolved");
                    return false;
                }
            }
        }
        true
    }
}
