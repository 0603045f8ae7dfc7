//! Scheduler (SPEC_FULL.md §4.4): applies the active policy to pick
//! ⟨task, pool⟩ pairs from the queue.
//!
//! For every pair returned, the task has already been dequeued and the
//! pool's running count has already been incremented -- callers rely on
//! this invariant (see `DispatcherCore::run_iteration`).
//!
//! Retry/backoff interaction (SPEC_FULL.md §4.4, resolving the open design
//! point in §9): a task with recorded retry info whose backoff has not
//! elapsed is skipped for this pass rather than assigned immediately. This
//! is the stricter of the two options the spec offers; see DESIGN.md.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::warn;

use crate::pool_manager::AgentPoolManager;
use crate::queue::TaskQueue;
use crate::retry::RetryManager;
use crate::types::{SchedulingPolicy, Task};

pub struct Scheduler {
    policy: Mutex<SchedulingPolicy>,
}

impl Scheduler {
    pub fn new(policy: SchedulingPolicy) -> Self {
        Scheduler {
            policy: Mutex::new(policy),
        }
    }

    pub fn policy(&self) -> SchedulingPolicy {
        *self.policy.lock().unwrap()
    }

    pub fn set_policy(&self, policy: SchedulingPolicy) {
        *self.policy.lock().unwrap() = policy;
    }

    pub fn schedule(
        &self,
        queue: &TaskQueue,
        pools: &AgentPoolManager,
        retry: &RetryManager,
    ) -> Vec<(Task, String)> {
        match self.policy() {
            SchedulingPolicy::Fifo => schedule_fifo(queue, pools, retry),
            SchedulingPolicy::Priority => schedule_priority(queue, pools, retry),
            SchedulingPolicy::SkillBased => schedule_skill_based(queue, pools, retry),
            SchedulingPolicy::FairShare => schedule_fair_share(queue, pools, retry),
        }
    }
}

fn backing_off(retry: &RetryManager, task: &Task) -> bool {
    retry.is_backing_off(&task.id)
}

fn schedule_fifo(queue: &TaskQueue, pools: &AgentPoolManager, retry: &RetryManager) -> Vec<(Task, String)> {
    let mut snapshot = queue.get_all_tasks();
    snapshot.sort_by_key(|t| t.created_at);

    let mut assigned = Vec::new();
    for task in snapshot {
        if backing_off(retry, &task) {
            continue;
        }
        let Some(pool_name) = pools.get_default_pool() else {
            break;
        };
        if !pools.can_accept_task(&pool_name).unwrap_or(false) {
            break;
        }
        if !try_take_from_queue(queue, &task.id) {
            continue;
        }
        pools.increment_running_count(&pool_name).ok();
        assigned.push((task, pool_name));
    }
    assigned
}

fn schedule_priority(queue: &TaskQueue, pools: &AgentPoolManager, retry: &RetryManager) -> Vec<(Task, String)> {
    let snapshot = queue.get_all_tasks();
    let mut assigned = Vec::new();
    for task in snapshot {
        if backing_off(retry, &task) {
            continue;
        }
        let pool_name = match &task.required_skill {
            Some(skill) => pools.get_pool_for_skill(skill),
            None => pools.get_default_pool(),
        };
        let Some(pool_name) = pool_name else { continue };
        if !pools.can_accept_task(&pool_name).unwrap_or(false) {
            continue;
        }
        if !try_take_from_queue(queue, &task.id) {
            continue;
        }
        pools.increment_running_count(&pool_name).ok();
        assigned.push((task, pool_name));
    }
    assigned
}

fn schedule_skill_based(queue: &TaskQueue, pools: &AgentPoolManager, retry: &RetryManager) -> Vec<(Task, String)> {
    let snapshot = queue.get_all_tasks();
    let mut assigned = Vec::new();
    for task in snapshot {
        if backing_off(retry, &task) {
            continue;
        }
        let pool_name = match &task.required_skill {
            Some(skill) => match pools.get_pool_for_skill(skill) {
                Some(p) => Some(p),
                None => {
                    warn!(task_id = %task.id, skill, "no pool found for declared skill, skipping");
                    None
                }
            },
            None => pools.get_default_pool(),
        };
        let Some(pool_name) = pool_name else { continue };
        if !pools.can_accept_task(&pool_name).unwrap_or(false) {
            continue;
        }
        if !try_take_from_queue(queue, &task.id) {
            continue;
        }
        pools.increment_running_count(&pool_name).ok();
        assigned.push((task, pool_name));
    }
    assigned
}

fn schedule_fair_share(queue: &TaskQueue, pools: &AgentPoolManager, retry: &RetryManager) -> Vec<(Task, String)> {
    let snapshot = queue.get_all_tasks();
    let mut round_assignments: HashMap<String, u32> = HashMap::new();
    let mut assigned = Vec::new();

    for task in snapshot {
        if backing_off(retry, &task) {
            continue;
        }
        let candidates = pools.least_loaded_with_round_counts(&round_assignments);
        let Some(pool_name) = candidates.into_iter().next() else {
            break;
        };
        if !try_take_from_queue(queue, &task.id) {
            continue;
        }
        pools.increment_running_count(&pool_name).ok();
        *round_assignments.entry(pool_name.clone()).or_insert(0) += 1;
        assigned.push((task, pool_name));
    }
    assigned
}

/// Dequeue the task matching `task_id` out of the priority order, leaving
/// all others in place. Used once a policy has committed to assigning a
/// specific task it found in a snapshot.
fn try_take_from_queue(queue: &TaskQueue, task_id: &str) -> bool {
    if !queue.contains(task_id) {
        return false;
    }
    let mut leftover = Vec::new();
    let mut found = false;
    while let Some(t) = queue.dequeue() {
        if !found && t.id == task_id {
            found = true;
            continue;
        }
        leftover.push(t);
    }
    for t in leftover {
        queue.enqueue(t);
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentPoolConfig, DispatcherConfig};
    use crate::retry::RetryManagerConfig;
    use crate::types::{PoolKind, TaskState};
    use std::collections::HashMap as Map;

    fn task(id: &str, priority: i64, skill: Option<&str>) -> Task {
        Task {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            state: TaskState::Ready,
            dependencies: vec![],
            required_skill: skill.map(String::from),
            priority,
            is_optional: false,
            artifacts: vec![],
            reserved_branch: None,
            metadata: Map::new(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    fn pools_with_one(max: u32) -> AgentPoolManager {
        let mut config = DispatcherConfig::default();
        config.agent_pools.insert(
            "default".to_string(),
            AgentPoolConfig {
                kind: PoolKind::LocalProcess,
                max_concurrency: max,
                cpu_quota: None,
                memory_quota: None,
                enabled: true,
                config: Map::new(),
            },
        );
        config
            .skill_mapping
            .insert("default".to_string(), vec!["default".to_string()]);
        AgentPoolManager::from_config(&config)
    }

    #[test]
    fn fifo_stops_when_default_pool_saturates() {
        let queue = TaskQueue::new();
        queue.enqueue(task("1", 1, None));
        queue.enqueue(task("2", 1, None));
        let pools = pools_with_one(1);
        let retry = RetryManager::new(RetryManagerConfig::default());
        let sched = Scheduler::new(SchedulingPolicy::Fifo);

        let assigned = sched.schedule(&queue, &pools, &retry);
        assert_eq!(assigned.len(), 1);
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn priority_skips_tasks_without_available_pool_but_continues() {
        let queue = TaskQueue::new();
        queue.enqueue(task("a", 10, Some("missing-skill")));
        queue.enqueue(task("b", 5, None));
        let pools = pools_with_one(5);
        let retry = RetryManager::new(RetryManagerConfig::default());
        let sched = Scheduler::new(SchedulingPolicy::Priority);

        let assigned = sched.schedule(&queue, &pools, &retry);
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].0.id, "b");
    }

    #[test]
    fn backing_off_task_is_skipped_until_elapsed() {
        let queue = TaskQueue::new();
        queue.enqueue(task("a", 10, None));
        let pools = pools_with_one(5);
        let retry = RetryManager::new(RetryManagerConfig {
            initial_delay_secs: 1000.0,
            ..RetryManagerConfig::default()
        });
        retry.record_failure("a", "flaky");
        let sched = Scheduler::new(SchedulingPolicy::Priority);

        let assigned = sched.schedule(&queue, &pools, &retry);
        assert!(assigned.is_empty());
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn fair_share_spreads_across_round_before_counters_update() {
        let mut config = DispatcherConfig::default();
        for name in ["a", "b"] {
            config.agent_pools.insert(
                name.to_string(),
                AgentPoolConfig {
                    kind: PoolKind::LocalProcess,
                    max_concurrency: 5,
                    cpu_quota: None,
                    memory_quota: None,
                    enabled: true,
                    config: Map::new(),
                },
            );
        }
        let pools = AgentPoolManager::from_config(&config);
        let queue = TaskQueue::new();
        queue.enqueue(task("1", 1, None));
        queue.enqueue(task("2", 1, None));
        let retry = RetryManager::new(RetryManagerConfig::default());
        let sched = Scheduler::new(SchedulingPolicy::FairShare);

        let assigned = sched.schedule(&queue, &pools, &retry);
        assert_eq!(assigned.len(), 2);
        let pool_names: std::collections::HashSet<_> =
            assigned.iter().map(|(_, p)| p.clone()).collect();
        assert_eq!(pool_names.len(), 2, "fair-share should spread across both pools");
    }
}
