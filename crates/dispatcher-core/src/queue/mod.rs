//! TaskQueue (SPEC_FULL.md §4.1): a thread-safe priority queue with
//! deterministic total order over (`-priority`, `created_at`, enqueue
//! sequence).
//!
//! Grounded on the source's `queue.PriorityQueue` of a tuple key; here a
//! `BinaryHeap` with a custom `Ord` gives the same total order without an
//! external dependency. `BinaryHeap` is a max-heap, so `Ord` is defined so
//! that the item that should dequeue first compares as the greatest.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::types::Task;

struct Entry {
    priority: i64,
    created_at: DateTime<Utc>,
    sequence: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first: compare priority ascending so BinaryHeap's
        // max-extraction yields the highest priority.
        self.priority
            .cmp(&other.priority)
            // Older created_at first: reverse so the max-heap surfaces the
            // smallest (oldest) timestamp.
            .then_with(|| other.created_at.cmp(&self.created_at))
            // Lower enqueue sequence first: reverse for the same reason.
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Priority+FIFO queue of ready tasks awaiting assignment.
pub struct TaskQueue {
    inner: Mutex<Inner>,
}

struct Inner {
    heap: BinaryHeap<Entry>,
    next_sequence: u64,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        TaskQueue {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_sequence: 0,
            }),
        }
    }

    pub fn enqueue(&self, task: Task) {
        let mut inner = self.inner.lock().unwrap();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.heap.push(Entry {
            priority: task.priority,
            created_at: task.created_at,
            sequence,
            task,
        });
    }

    pub fn dequeue(&self) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap();
        inner.heap.pop().map(|e| e.task)
    }

    pub fn peek(&self) -> Option<Task> {
        let inner = self.inner.lock().unwrap();
        inner.heap.peek().map(|e| e.task.clone())
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.heap.clear();
    }

    /// Returns all queued tasks in dequeue order without removing them.
    /// Drains and restores under the same lock acquisition, matching the
    /// source's drain-and-restore `get_all_tasks` (inefficient but
    /// straightforwardly correct and race-free).
    pub fn get_all_tasks(&self) -> Vec<Task> {
        let mut inner = self.inner.lock().unwrap();
        let mut drained: Vec<Entry> = std::mem::take(&mut inner.heap).into_sorted_vec();
        // into_sorted_vec is ascending; our Ord already encodes "greatest
        // first is dequeued first", so reverse to get dequeue order.
        drained.reverse();
        let tasks: Vec<Task> = drained.iter().map(|e| e.task.clone()).collect();
        inner.heap = drained.into_iter().collect();
        tasks
    }

    /// True if a task with this id is currently queued.
    pub fn contains(&self, task_id: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.heap.iter().any(|e| e.task.id == task_id)
    }

    /// Remove every queued task, mutate the one matching `task_id` with
    /// `mutate`, then re-enqueue all of them (SPEC_FULL.md §4.9 priority
    /// mutation). Preserves the ordering invariant because re-enqueue goes
    /// through the normal `enqueue` path, assigning fresh sequence numbers.
    pub fn mutate_and_reinsert(&self, task_id: &str, mutate: impl FnOnce(&mut Task)) -> bool {
        let drained = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::take(&mut inner.heap)
                .into_iter()
                .map(|e| e.task)
                .collect::<Vec<_>>()
        };
        let mut found = false;
        let mut mutate = Some(mutate);
        for mut task in drained {
            if task.id == task_id {
                if let Some(mutate) = mutate.take() {
                    mutate(&mut task);
                }
                found = true;
            }
            self.enqueue(task);
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn task(id: &str, priority: i64, created_at: DateTime<Utc>) -> Task {
        Task {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            state: crate::types::TaskState::Ready,
            dependencies: vec![],
            required_skill: None,
            priority,
            is_optional: false,
            artifacts: vec![],
            reserved_branch: None,
            metadata: HashMap::new(),
            created_at,
            updated_at: created_at,
        }
    }

    #[test]
    fn dequeues_highest_priority_first() {
        let q = TaskQueue::new();
        let t0 = Utc::now();
        q.enqueue(task("low", 1, t0));
        q.enqueue(task("high", 10, t0));
        q.enqueue(task("mid", 5, t0));

        assert_eq!(q.dequeue().unwrap().id, "high");
        assert_eq!(q.dequeue().unwrap().id, "mid");
        assert_eq!(q.dequeue().unwrap().id, "low");
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn equal_priority_is_fifo_by_created_at() {
        let q = TaskQueue::new();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(1);
        q.enqueue(task("second", 5, t1));
        q.enqueue(task("first", 5, t0));

        assert_eq!(q.dequeue().unwrap().id, "first");
        assert_eq!(q.dequeue().unwrap().id, "second");
    }

    #[test]
    fn equal_priority_and_timestamp_breaks_tie_by_sequence() {
        let q = TaskQueue::new();
        let t0 = Utc::now();
        q.enqueue(task("a", 5, t0));
        q.enqueue(task("b", 5, t0));
        q.enqueue(task("c", 5, t0));

        assert_eq!(q.dequeue().unwrap().id, "a");
        assert_eq!(q.dequeue().unwrap().id, "b");
        assert_eq!(q.dequeue().unwrap().id, "c");
    }

    #[test]
    fn get_all_tasks_does_not_lose_or_duplicate() {
        let q = TaskQueue::new();
        let t0 = Utc::now();
        for id in ["a", "b", "c"] {
            q.enqueue(task(id, 1, t0));
        }
        let snapshot = q.get_all_tasks();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(q.size(), 3);
    }

    #[test]
    fn priority_mutation_resorts() {
        let q = TaskQueue::new();
        let t0 = Utc::now();
        q.enqueue(task("1", 1, t0));
        q.enqueue(task("2", 10, t0));
        q.enqueue(task("3", 5, t0));

        let found = q.mutate_and_reinsert("1", |t| t.priority = 15);
        assert!(found);

        assert_eq!(q.dequeue().unwrap().id, "1");
        assert_eq!(q.dequeue().unwrap().id, "2");
        assert_eq!(q.dequeue().unwrap().id, "3");
    }
}
