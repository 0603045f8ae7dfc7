//! DispatcherCore (SPEC_FULL.md §4.9): the orchestrator tying every other
//! component to the main loop, the assignment flow, completion handling,
//! and graceful shutdown.
//!
//! Resolved design points carried over from SPEC_FULL.md §9 (see DESIGN.md
//! for the full rationale):
//! - Scheduler already dequeues and increments the pool counter for every
//!   pair it returns; `_assign_task` only increments the *global* counter
//!   on success, and only decrements the pool counter on the early-exit
//!   paths (slot/launch failure), never increments it a second time.
//! - Completion/failure events are recorded before the slot is released,
//!   relying on `RepoPool::release_slot` being idempotent.
//! - `spec_name` is read off the `Runner` record on timeout, never parsed
//!   from the task ID.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::deadlock::DeadlockDetector;
use crate::error::{DeadlockDetectedError, DispatcherError};
use crate::events::DispatcherEvent;
use crate::events::EventStore;
use crate::launcher::RunnerLauncher;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::pool_manager::AgentPoolManager;
use crate::queue::TaskQueue;
use crate::registry::TaskRegistry;
use crate::repo_pool::RepoPool;
use crate::retry::{RetryManager, RetryManagerConfig};
use crate::runner_monitor::RunnerMonitor;
use crate::scheduler::Scheduler;
use crate::task_monitor::TaskMonitor;
use crate::types::{PoolStatus, RetryInfo, Runner, RunnerInfo, RunnerState, SchedulingPolicy, Task, TaskState};

pub struct DispatcherStatus {
    pub running: bool,
    pub policy: SchedulingPolicy,
    pub queue_size: usize,
    pub running_task_count: usize,
    pub global_running_count: u32,
    pub max_global_concurrency: u32,
    pub pool_statuses: Vec<PoolStatus>,
    pub metrics: MetricsSnapshot,
    pub retry_info: HashMap<String, RetryInfo>,
    pub last_detected_cycles: Vec<Vec<String>>,
}

struct GlobalCounter {
    count: Mutex<u32>,
    max: u32,
}

impl GlobalCounter {
    fn can_accept(&self) -> bool {
        *self.count.lock().unwrap() < self.max
    }

    fn increment(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock().unwrap();
        if *count == 0 {
            warn!("global counter underflow clamped at zero");
        } else {
            *count -= 1;
        }
    }

    fn get(&self) -> u32 {
        *self.count.lock().unwrap()
    }
}

pub struct DispatcherCore {
    config: DispatcherConfig,
    registry: Arc<dyn TaskRegistry>,
    repo_pool: Arc<dyn RepoPool>,
    event_store: Arc<dyn EventStore>,

    queue: TaskQueue,
    pools: AgentPoolManager,
    task_monitor: TaskMonitor,
    scheduler: Scheduler,
    launcher: RunnerLauncher,
    runner_monitor: Arc<RunnerMonitor>,
    retry: RetryManager,
    metrics: MetricsCollector,

    global: GlobalCounter,
    running: AtomicBool,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    last_deadlock_check: Mutex<Instant>,
    last_detected_cycles: Mutex<Vec<Vec<String>>>,
}

impl DispatcherCore {
    pub fn new(
        config: DispatcherConfig,
        registry: Arc<dyn TaskRegistry>,
        repo_pool: Arc<dyn RepoPool>,
        event_store: Arc<dyn EventStore>,
    ) -> Arc<Self> {
        let pools = AgentPoolManager::from_config(&config);
        let retry = RetryManager::new(RetryManagerConfig {
            initial_delay_secs: config.effective_retry_initial_delay(),
            backoff_base: config.effective_retry_backoff_base(),
            max_delay_secs: 300.0,
            max_attempts: config.effective_retry_max_attempts(),
        });
        let runner_monitor = Arc::new(RunnerMonitor::new(Duration::from_secs(config.heartbeat_timeout)));
        let scheduler = Scheduler::new(config.scheduling_policy);
        let max_global_concurrency = config.max_global_concurrency;

        Arc::new(DispatcherCore {
            task_monitor: TaskMonitor::new(registry.clone()),
            registry,
            repo_pool,
            event_store,
            queue: TaskQueue::new(),
            pools,
            scheduler,
            launcher: RunnerLauncher::default(),
            runner_monitor,
            retry,
            metrics: MetricsCollector::default(),
            global: GlobalCounter {
                count: Mutex::new(0),
                max: max_global_concurrency,
            },
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
            last_deadlock_check: Mutex::new(Instant::now()),
            last_detected_cycles: Mutex::new(Vec::new()),
            config,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns the main loop on a dedicated task. A no-op if already running.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let core = self.clone();
        let handle = tokio::spawn(async move { core.run_loop().await });
        *self.worker.lock().unwrap() = Some(handle);
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            self.run_iteration().await;

            let poll = Duration::from_secs(self.config.poll_interval);
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }
    }

    /// One main-loop iteration (SPEC_FULL.md §4.9). Every step is isolated
    /// so a failure in one never prevents the rest from running.
    async fn run_iteration(&self) {
        self.poll_and_enqueue().await;
        self.run_scheduling_pass().await;

        let runner_monitor = self.runner_monitor.clone();
        runner_monitor
            .check_heartbeats(|info| async move { self.handle_runner_timeout(info).await })
            .await;

        let due = {
            let mut last = self.last_deadlock_check.lock().unwrap();
            if last.elapsed() >= Duration::from_secs(self.config.deadlock_check_interval) {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if due {
            self.run_deadlock_check().await;
        }

        self.collect_metrics();
    }

    async fn poll_and_enqueue(&self) {
        for task in self.task_monitor.poll_ready_tasks(None).await {
            if !self.queue.contains(&task.id) {
                self.queue.enqueue(task);
            }
        }
    }

    async fn run_scheduling_pass(&self) {
        if !self.global.can_accept() {
            return;
        }
        let pairs = self.scheduler.schedule(&self.queue, &self.pools, &self.retry);
        for (task, pool_name) in pairs {
            if !self.global.can_accept() {
                // Global limit reached mid-batch: undo the scheduler's
                // optimistic pool increment and give the task back to the queue.
                if let Err(err) = self.pools.decrement_running_count(&pool_name) {
                    warn!(pool = pool_name, error = %err, "failed to restore pool counter");
                }
                self.queue.enqueue(task);
                continue;
            }
            if let Err(err) = self.assign_task(task, pool_name).await {
                warn!(error = %err, "task assignment failed, already handled internally");
            }
        }
    }

    /// `_assign_task` (SPEC_FULL.md §4.9). Callers must have already
    /// dequeued `task` and incremented `pool_name`'s running count.
    async fn assign_task(&self, task: Task, pool_name: String) -> Result<(), DispatcherError> {
        let spec_name = task.spec_name().unwrap_or_default().to_string();
        let repo_name = task
            .metadata
            .get("repo_name")
            .cloned()
            .unwrap_or_else(|| spec_name.clone());

        let slot = match self.repo_pool.allocate_slot(&repo_name, Some(task.metadata.clone())).await {
            Ok(Some(slot)) => slot,
            Ok(None) => {
                self.undo_pool_reservation(&pool_name, task);
                return Ok(());
            }
            Err(err) => {
                warn!(task_id = %task.id, error = %err, "repo pool allocation errored, re-enqueueing");
                self.undo_pool_reservation(&pool_name, task);
                return Ok(());
            }
        };

        let Some(pool) = self.pools.pool_snapshot(&pool_name) else {
            self.undo_pool_reservation(&pool_name, task);
            return Ok(());
        };

        let task_context = RunnerLauncher::build_task_context(&task, &slot);
        let runner_id = Uuid::new_v4().to_string();
        let handle = match self.launcher.launch(&runner_id, &task_context, &pool).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(task_id = %task.id, pool = pool_name, error = %err, "runner launch failed, releasing slot and re-enqueueing");
                let _ = self.repo_pool.release_slot(&slot.slot_id, true).await;
                self.undo_pool_reservation(&pool_name, task);
                return Ok(());
            }
        };

        let started_at = Utc::now();

        let mut metadata = HashMap::new();
        metadata.insert("runner_id".to_string(), runner_id.clone());
        metadata.insert("assigned_slot".to_string(), slot.slot_id.clone());
        metadata.insert("pool_name".to_string(), pool_name.clone());
        metadata.insert("started_at".to_string(), started_at.to_rfc3339());
        if let Err(err) = self
            .registry
            .update_task_state(&spec_name, &task.id, TaskState::Running, Some(metadata))
            .await
        {
            // The runner is already launched; a registry write failure here
            // must not unwind the assignment.
            warn!(task_id = %task.id, error = %err, "failed to update registry on assignment, continuing");
        }

        self.event_store
            .record_event(DispatcherEvent::TaskAssigned {
                task_id: task.id.clone(),
                runner_id: runner_id.clone(),
                slot_id: slot.slot_id.clone(),
                pool_name: pool_name.clone(),
                timestamp: started_at,
            })
            .await;
        self.event_store
            .record_event(DispatcherEvent::RunnerStarted {
                runner_id: runner_id.clone(),
                slot_id: slot.slot_id.clone(),
                pool_name: pool_name.clone(),
                handle: (&handle).into(),
                timestamp: started_at,
            })
            .await;

        self.runner_monitor.add_runner(Runner {
            runner_id: runner_id.clone(),
            task_id: task.id.clone(),
            spec_name,
            pool_name: pool_name.clone(),
            slot_id: slot.slot_id.clone(),
            started_at,
            state: RunnerState::Running,
            handle,
        });

        self.global.increment();
        self.metrics.record_assignment(&pool_name, task.priority, task.created_at);
        Ok(())
    }

    fn undo_pool_reservation(&self, pool_name: &str, task: Task) {
        if let Err(err) = self.pools.decrement_running_count(pool_name) {
            warn!(pool = pool_name, error = %err, "failed to release pool reservation");
        }
        self.queue.enqueue(task);
    }

    /// `handle_runner_completion` (SPEC_FULL.md §4.9), the inbound API
    /// runners or an out-of-band supervisor call on finishing.
    pub async fn handle_runner_completion(
        &self,
        runner_id: &str,
        task_id: &str,
        spec_name: &str,
        success: bool,
        slot_id: &str,
        pool_name: &str,
        failure_reason: Option<String>,
    ) -> anyhow::Result<()> {
        let info = self.runner_monitor.remove_runner(runner_id);
        let execution_time_seconds = info.map(|info| {
            (Utc::now() - info.runner.started_at).num_milliseconds() as f64 / 1000.0
        });

        self.event_store
            .record_event(DispatcherEvent::RunnerFinished {
                runner_id: runner_id.to_string(),
                slot_id: slot_id.to_string(),
                success,
                execution_time_seconds,
                failure_reason: failure_reason.clone(),
            })
            .await;

        if success {
            self.event_store
                .record_event(DispatcherEvent::TaskCompleted {
                    task_id: task_id.to_string(),
                    runner_id: runner_id.to_string(),
                    execution_time_seconds,
                })
                .await;

            if let Err(err) = self.repo_pool.release_slot(slot_id, false).await {
                warn!(slot_id, error = %err, "slot release failed on success path");
            }
            self.pools.decrement_running_count(pool_name).ok();
            self.global.decrement();

            if let Err(err) = self
                .registry
                .update_task_state(spec_name, task_id, TaskState::Done, None)
                .await
            {
                warn!(task_id, error = %err, "failed to mark task done in registry");
            }
            self.retry.clear_retry_info(task_id);
            Ok(())
        } else {
            self.handle_task_failure(
                task_id,
                spec_name,
                pool_name,
                slot_id,
                runner_id,
                failure_reason.unwrap_or_else(|| "unknown failure".to_string()),
            )
            .await
        }
    }

    /// `handle_task_failure` (SPEC_FULL.md §4.9).
    async fn handle_task_failure(
        &self,
        task_id: &str,
        spec_name: &str,
        pool_name: &str,
        slot_id: &str,
        runner_id: &str,
        failure_reason: String,
    ) -> anyhow::Result<()> {
        let retry_info = self.retry.record_failure(task_id, &failure_reason);

        if let Err(err) = self.repo_pool.release_slot(slot_id, true).await {
            warn!(slot_id, error = %err, "slot release failed on failure path");
        }
        self.pools.decrement_running_count(pool_name).ok();
        self.global.decrement();

        if retry_info.retry_count < self.retry.max_attempts() {
            match self.registry.get_task(spec_name, task_id).await {
                Ok(Some(task)) => {
                    self.queue.enqueue(task);
                }
                Ok(None) => {
                    warn!(task_id, "task not found in registry on retry, dropping");
                }
                Err(err) => {
                    warn!(task_id, error = %err, "failed to reload task for retry, dropping");
                }
            }
        } else {
            self.event_store
                .record_event(DispatcherEvent::TaskFailed {
                    task_id: task_id.to_string(),
                    runner_id: runner_id.to_string(),
                    failure_reason: failure_reason.clone(),
                    retry_count: retry_info.retry_count,
                })
                .await;

            let mut metadata = HashMap::new();
            metadata.insert("reason".to_string(), failure_reason);
            metadata.insert("retries".to_string(), retry_info.retry_count.to_string());
            metadata.insert("runner_id".to_string(), runner_id.to_string());
            if let Err(err) = self
                .registry
                .update_task_state(spec_name, task_id, TaskState::Failed, Some(metadata))
                .await
            {
                warn!(task_id, error = %err, "failed to mark task permanently failed");
            }
            self.retry.clear_retry_info(task_id);
        }
        Ok(())
    }

    /// Resolves `spec_name` straight off the `Runner` record rather than
    /// parsing the task ID (SPEC_FULL.md §9 resolved design point).
    async fn handle_runner_timeout(&self, info: RunnerInfo) -> anyhow::Result<()> {
        let runner = info.runner;
        self.handle_task_failure(
            &runner.task_id,
            &runner.spec_name,
            &runner.pool_name,
            &runner.slot_id,
            &runner.runner_id,
            "timeout".to_string(),
        )
        .await?;
        self.runner_monitor.remove_runner(&runner.runner_id);
        Ok(())
    }

    async fn run_deadlock_check(&self) {
        let tasks = self.all_registry_tasks().await;
        let cycles = DeadlockDetector::detect_cycles(&tasks);
        if !cycles.is_empty() {
            for suggestion in DeadlockDetector::suggest_resolution(&cycles) {
                warn!("{suggestion}");
            }
            let blocked = DeadlockDetector::blocked_tasks(&tasks);
            warn!(count = blocked.len(), "deadlock detector found blocked tasks");
        }
        *self.last_detected_cycles.lock().unwrap() = cycles;
    }

    /// On-demand deadlock check (SPEC_FULL.md §4.8, §7): unlike the
    /// periodic main-loop check, this raises `DeadlockDetectedError` to the
    /// caller when any cycle is present.
    pub async fn check_deadlock_now(&self) -> Result<(), DeadlockDetectedError> {
        let tasks = self.all_registry_tasks().await;
        let cycles = DeadlockDetector::detect_cycles(&tasks);
        let rendered = DeadlockDetector::suggest_resolution(&cycles);
        *self.last_detected_cycles.lock().unwrap() = cycles.clone();
        if cycles.is_empty() {
            Ok(())
        } else {
            Err(DeadlockDetectedError::Cycles { cycles: rendered })
        }
    }

    async fn all_registry_tasks(&self) -> Vec<Task> {
        let specs = self.registry.list_tasksets().await.unwrap_or_default();
        let mut tasks = Vec::new();
        for spec in specs {
            if let Ok(Some(taskset)) = self.registry.get_taskset(&spec).await {
                tasks.extend(taskset.tasks);
            }
        }
        tasks
    }

    fn collect_metrics(&self) {
        let statuses = self.pools.get_all_pool_statuses();
        self.metrics
            .collect(self.queue.size(), self.global.get(), self.global.max, &statuses);
    }

    /// `update_task_priority` (SPEC_FULL.md §4.9): updates the registry and,
    /// if the task is currently queued, re-sorts it in place.
    pub async fn update_task_priority(&self, spec: &str, task_id: &str, new_priority: i64) -> anyhow::Result<()> {
        self.registry.update_task_priority(spec, task_id, new_priority).await?;
        self.queue.mutate_and_reinsert(task_id, |t| t.priority = new_priority);
        Ok(())
    }

    pub fn set_scheduling_policy(&self, policy: SchedulingPolicy) {
        self.scheduler.set_policy(policy);
    }

    pub fn get_status(&self) -> DispatcherStatus {
        DispatcherStatus {
            running: self.is_running(),
            policy: self.scheduler.policy(),
            queue_size: self.queue.size(),
            running_task_count: self.runner_monitor.get_running_count(),
            global_running_count: self.global.get(),
            max_global_concurrency: self.global.max,
            pool_statuses: self.pools.get_all_pool_statuses(),
            metrics: self.metrics.snapshot(),
            retry_info: self.retry.snapshot(),
            last_detected_cycles: self.last_detected_cycles.lock().unwrap().clone(),
        }
    }

    /// Graceful shutdown (SPEC_FULL.md §4.9). Idempotent; a no-op if never
    /// started.
    pub async fn stop(&self, timeout: Duration) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }

        let deadline = Instant::now() + timeout;
        while self.runner_monitor.get_running_count() > 0 && Instant::now() < deadline {
            info!(
                remaining = self.runner_monitor.get_running_count(),
                "waiting for runners to finish before shutdown"
            );
            tokio::time::sleep(Duration::from_secs(5).min(timeout)).await;
        }

        let stragglers = self.runner_monitor.get_all_runners();
        for (runner_id, info) in stragglers {
            if info.state != RunnerState::Running {
                continue;
            }
            error!(runner_id, "force-stopping runner on shutdown timeout");
            self.runner_monitor.update_runner_state(&runner_id, RunnerState::Failed);
            if let Err(err) = self.repo_pool.release_slot(&info.runner.slot_id, true).await {
                warn!(slot_id = info.runner.slot_id, error = %err, "force-stop slot release failed");
            }
            self.pools.decrement_running_count(&info.runner.pool_name).ok();
            self.global.decrement();
            self.runner_monitor.remove_runner(&runner_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentPoolConfig;
    use crate::launcher::{LocalProcessBackend, RunnerBackend};
    use crate::registry::Taskset;
    use crate::types::{AgentPool, PoolKind, RunnerHandle, Slot, TaskContext};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct FakeRegistry {
        tasks: StdMutex<HashMap<(String, String), Task>>,
        ready: StdMutex<Vec<Task>>,
    }

    #[async_trait]
    impl TaskRegistry for FakeRegistry {
        async fn get_ready_tasks(&self, _spec: Option<&str>) -> anyhow::Result<Vec<Task>> {
            Ok(std::mem::take(&mut self.ready.lock().unwrap()))
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
            Ok(self
                .tasks
                .lock()
                .unwrap()
                .get(&(spec.to_string(), task_id.to_string()))
                .cloned())
        }
        async fn list_tasksets(&self) -> anyhow::Result<Vec<String>> {
            Ok(self
                .tasks
                .lock()
                .unwrap()
                .values()
                .filter_map(|t| t.spec_name().map(String::from))
                .collect::<std::collections::HashSet<_>>()
                .into_iter()
                .collect())
        }
        async fn update_task_state(
            &self,
            spec: &str,
            task_id: &str,
            new_state: TaskState,
            metadata: Option<HashMap<String, String>>,
        ) -> anyhow::Result<()> {
            let mut tasks = self.tasks.lock().unwrap();
            if let Some(task) = tasks.get_mut(&(spec.to_string(), task_id.to_string())) {
                task.state = new_state;
                if let Some(metadata) = metadata {
                    task.metadata.extend(metadata);
                }
            }
            Ok(())
        }
        async fn update_task_priority(&self, spec: &str, task_id: &str, new_priority: i64) -> anyhow::Result<()> {
            let mut tasks = self.tasks.lock().unwrap();
            if let Some(task) = tasks.get_mut(&(spec.to_string(), task_id.to_string())) {
                task.priority = new_priority;
            }
            Ok(())
        }
    }

    struct FakeRepoPool;

    #[async_trait]
    impl RepoPool for FakeRepoPool {
        async fn allocate_slot(
            &self,
            repo_name: &str,
            _metadata: Option<HashMap<String, String>>,
        ) -> anyhow::Result<Option<Slot>> {
            Ok(Some(Slot {
                slot_id: Uuid::new_v4().to_string(),
                repo_name: repo_name.to_string(),
                path: "/tmp".into(),
                repo_url: String::new(),
            }))
        }
        async fn release_slot(&self, _slot_id: &str, _cleanup: bool) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct FakeEventStore {
        events: StdMutex<Vec<DispatcherEvent>>,
    }

    #[async_trait]
    impl EventStore for FakeEventStore {
        async fn record_event(&self, event: DispatcherEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn task(id: &str, spec: &str, priority: i64) -> Task {
        let mut metadata = HashMap::new();
        metadata.insert("spec_name".to_string(), spec.to_string());
        Task {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            state: TaskState::Ready,
            dependencies: vec![],
            required_skill: None,
            priority,
            is_optional: false,
            artifacts: vec![],
            reserved_branch: None,
            metadata,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn single_pool_config(max_concurrency: u32) -> DispatcherConfig {
        let mut config = DispatcherConfig::default();
        config.agent_pools.insert(
            "default".to_string(),
            AgentPoolConfig {
                kind: PoolKind::LocalProcess,
                max_concurrency,
                cpu_quota: None,
                memory_quota: None,
                enabled: true,
                config: HashMap::new(),
            },
        );
        config.skill_mapping.insert("default".to_string(), vec!["default".to_string()]);
        config.max_global_concurrency = 10;
        config
    }

    fn core_with(registry: Arc<FakeRegistry>, max_concurrency: u32) -> Arc<DispatcherCore> {
        DispatcherCore::new(
            single_pool_config(max_concurrency),
            registry,
            Arc::new(FakeRepoPool),
            Arc::new(FakeEventStore {
                events: StdMutex::new(vec![]),
            }),
        )
    }

    #[tokio::test]
    async fn assign_task_launches_and_increments_counters() {
        let registry = Arc::new(FakeRegistry {
            tasks: StdMutex::new(HashMap::new()),
            ready: StdMutex::new(vec![]),
        });
        let core = core_with(registry, 5);
        let task = task("t1", "spec", 1);
        core.assign_task(task, "default".to_string()).await.unwrap();

        assert_eq!(core.global.get(), 1);
        assert_eq!(core.runner_monitor.get_running_count(), 1);
        assert_eq!(core.pools.get_pool_status("default").unwrap().current_running, 1);
    }

    #[tokio::test]
    async fn handle_runner_completion_success_releases_everything() {
        let registry = Arc::new(FakeRegistry {
            tasks: StdMutex::new(HashMap::new()),
            ready: StdMutex::new(vec![]),
        });
        let core = core_with(registry, 5);
        core.pools.increment_running_count("default").unwrap();
        core.global.increment();
        core.runner_monitor.add_runner(Runner {
            runner_id: "r1".to_string(),
            task_id: "t1".to_string(),
            spec_name: "spec".to_string(),
            pool_name: "default".to_string(),
            slot_id: "slot1".to_string(),
            started_at: Utc::now(),
            state: RunnerState::Running,
            handle: RunnerHandle::Pid(1),
        });

        core.handle_runner_completion("r1", "t1", "spec", true, "slot1", "default", None)
            .await
            .unwrap();

        assert_eq!(core.global.get(), 0);
        assert_eq!(core.pools.get_pool_status("default").unwrap().current_running, 0);
        assert_eq!(core.runner_monitor.get_running_count(), 0);
    }

    #[tokio::test]
    async fn handle_task_failure_reenqueues_until_retry_ceiling_then_fails() {
        let mut tasks = HashMap::new();
        tasks.insert(
            ("spec".to_string(), "t1".to_string()),
            task("t1", "spec", 1),
        );
        let registry = Arc::new(FakeRegistry {
            tasks: StdMutex::new(tasks),
            ready: StdMutex::new(vec![]),
        });
        let core = core_with(registry.clone(), 5);

        for _ in 0..core.retry.max_attempts() {
            core.pools.increment_running_count("default").unwrap();
            core.global.increment();
            core.handle_task_failure("t1", "spec", "default", "slot", "r1", "flaky".to_string())
                .await
                .unwrap();
        }

        let stored = registry
            .get_task("spec", "t1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, TaskState::Failed);
        assert_eq!(core.retry.get_retry_count("t1"), 0);
    }

    #[tokio::test]
    async fn update_task_priority_resorts_queue() {
        let registry = Arc::new(FakeRegistry {
            tasks: StdMutex::new(HashMap::new()),
            ready: StdMutex::new(vec![]),
        });
        let core = core_with(registry, 5);
        core.queue.enqueue(task("1", "spec", 1));
        core.queue.enqueue(task("2", "spec", 10));
        core.queue.enqueue(task("3", "spec", 5));

        core.update_task_priority("spec", "1", 15).await.unwrap();

        assert_eq!(core.queue.dequeue().unwrap().id, "1");
        assert_eq!(core.queue.dequeue().unwrap().id, "2");
        assert_eq!(core.queue.dequeue().unwrap().id, "3");
    }

    #[tokio::test]
    async fn check_deadlock_now_raises_when_cycle_present() {
        let mut tasks = HashMap::new();
        for (id, dep) in [("1", "2"), ("2", "3"), ("3", "1")] {
            let mut t = task(id, "spec", 1);
            t.dependencies = vec![dep.to_string()];
            tasks.insert(("spec".to_string(), id.to_string()), t);
        }
        let registry = Arc::new(FakeRegistry {
            tasks: StdMutex::new(tasks),
            ready: StdMutex::new(vec![]),
        });
        let core = core_with(registry, 5);
        assert!(core.check_deadlock_now().await.is_err());
    }

    #[tokio::test]
    async fn stop_before_start_is_a_no_op() {
        let registry = Arc::new(FakeRegistry {
            tasks: StdMutex::new(HashMap::new()),
            ready: StdMutex::new(vec![]),
        });
        let core = core_with(registry, 5);
        core.stop(Duration::from_millis(10)).await;
        assert!(!core.is_running());
    }

    #[tokio::test]
    async fn global_limit_binds_during_scheduling_pass() {
        let registry = Arc::new(FakeRegistry {
            tasks: StdMutex::new(HashMap::new()),
            ready: StdMutex::new(vec![]),
        });
        let mut config = single_pool_config(10);
        config.max_global_concurrency = 2;
        let core = DispatcherCore::new(config, registry, Arc::new(FakeRepoPool), Arc::new(FakeEventStore {
            events: StdMutex::new(vec![]),
        }));

        for i in 0..5 {
            core.queue.enqueue(task(&i.to_string(), "spec", 1));
        }
        core.run_scheduling_pass().await;

        assert_eq!(core.global.get(), 2);
        assert_eq!(core.queue.size(), 3);
    }

    // Exercises the LocalProcess path end to end with a real backend that
    // just spawns `true`, to check the launcher/assign wiring compiles and
    // behaves with a non-fake backend.
    #[tokio::test]
    async fn assign_task_with_real_local_process_backend() {
        let backend: Arc<dyn RunnerBackend> = Arc::new(LocalProcessBackend);
        let pool = AgentPool {
            name: "default".to_string(),
            kind: PoolKind::LocalProcess,
            max_concurrency: 1,
            current_running: 0,
            cpu_quota: None,
            memory_quota_mb: None,
            enabled: true,
            config: HashMap::new(),
        };
        let ctx = TaskContext {
            task_id: "t".to_string(),
            spec_name: "s".to_string(),
            task_title: "t".to_string(),
            task_description: String::new(),
            dependencies: vec![],
            required_skill: None,
            slot_id: "slot".to_string(),
            slot_path: "/tmp".into(),
            repo_url: String::new(),
            reserved_branch: None,
            metadata: HashMap::new(),
        };
        let result = backend.launch("r1", &ctx, &pool).await;
        assert!(result.is_ok());
    }
}
