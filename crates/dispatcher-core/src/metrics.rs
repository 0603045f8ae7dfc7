//! MetricsCollector (SPEC_FULL.md §4.9, §6): a plain snapshot recomputed
//! each main-loop iteration, exported in Prometheus text format. In scope
//! because §6 defines the metric names as part of the dispatcher's own
//! interface; an actual `/metrics` HTTP listener is CLI/server glue and is
//! not built here.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub queue_size: usize,
    pub running_tasks: u32,
    pub global_running_count: u32,
    pub max_global_concurrency: u32,
    pub global_utilization: f64,
    pub pool_utilization: HashMap<String, f64>,
    pub pool_running_counts: HashMap<String, u32>,
    pub average_wait_time_seconds: f64,
    pub total_assignments: u64,
}

struct AssignmentRecord {
    pool_name: String,
    priority: i64,
    wait_time_seconds: f64,
}

pub struct MetricsCollector {
    snapshot: Mutex<MetricsSnapshot>,
    assignments: Mutex<Vec<AssignmentRecord>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        MetricsCollector {
            snapshot: Mutex::new(MetricsSnapshot::default()),
            assignments: Mutex::new(Vec::new()),
        }
    }
}

impl MetricsCollector {
    pub fn record_assignment(&self, pool_name: &str, priority: i64, created_at: DateTime<Utc>) {
        let wait_time = (Utc::now() - created_at).num_milliseconds() as f64 / 1000.0;
        self.assignments.lock().unwrap().push(AssignmentRecord {
            pool_name: pool_name.to_string(),
            priority,
            wait_time_seconds: wait_time,
        });
    }

    pub fn collect(
        &self,
        queue_size: usize,
        global_running_count: u32,
        max_global_concurrency: u32,
        pool_statuses: &[crate::types::PoolStatus],
    ) {
        let assignments = self.assignments.lock().unwrap();
        let average_wait_time_seconds = if assignments.is_empty() {
            0.0
        } else {
            assignments.iter().map(|a| a.wait_time_seconds).sum::<f64>() / assignments.len() as f64
        };

        let mut pool_utilization = HashMap::new();
        let mut pool_running_counts = HashMap::new();
        let mut running_tasks = 0;
        for status in pool_statuses {
            pool_utilization.insert(status.name.clone(), status.utilization);
            pool_running_counts.insert(status.name.clone(), status.current_running);
            running_tasks += status.current_running;
        }

        let global_utilization = if max_global_concurrency == 0 {
            0.0
        } else {
            global_running_count as f64 / max_global_concurrency as f64
        };

        *self.snapshot.lock().unwrap() = MetricsSnapshot {
            queue_size,
            running_tasks,
            global_running_count,
            max_global_concurrency,
            global_utilization,
            pool_utilization,
            pool_running_counts,
            average_wait_time_seconds,
            total_assignments: assignments.len() as u64,
        };
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot.lock().unwrap().clone()
    }

    pub fn export_prometheus(&self) -> String {
        let snapshot = self.snapshot.lock().unwrap();
        let mut lines = Vec::new();

        lines.push("# HELP dispatcher_queue_size Number of tasks in queue".to_string());
        lines.push("# TYPE dispatcher_queue_size gauge".to_string());
        lines.push(format!("dispatcher_queue_size {}", snapshot.queue_size));

        lines.push("# HELP dispatcher_running_tasks Number of currently running tasks (per-pool total)".to_string());
        lines.push("# TYPE dispatcher_running_tasks gauge".to_string());
        lines.push(format!("dispatcher_running_tasks {}", snapshot.running_tasks));

        lines.push("# HELP dispatcher_global_running_count Global running task count".to_string());
        lines.push("# TYPE dispatcher_global_running_count gauge".to_string());
        lines.push(format!("dispatcher_global_running_count {}", snapshot.global_running_count));

        lines.push("# HELP dispatcher_max_global_concurrency Maximum global concurrency limit".to_string());
        lines.push("# TYPE dispatcher_max_global_concurrency gauge".to_string());
        lines.push(format!("dispatcher_max_global_concurrency {}", snapshot.max_global_concurrency));

        lines.push("# HELP dispatcher_global_utilization Global concurrency utilization ratio (0.0-1.0)".to_string());
        lines.push("# TYPE dispatcher_global_utilization gauge".to_string());
        lines.push(format!("dispatcher_global_utilization {}", snapshot.global_utilization));

        lines.push("# HELP dispatcher_average_wait_time_seconds Average task wait time in seconds".to_string());
        lines.push("# TYPE dispatcher_average_wait_time_seconds gauge".to_string());
        lines.push(format!(
            "dispatcher_average_wait_time_seconds {}",
            snapshot.average_wait_time_seconds
        ));

        lines.push("# HELP dispatcher_total_assignments Total number of task assignments".to_string());
        lines.push("# TYPE dispatcher_total_assignments counter".to_string());
        lines.push(format!("dispatcher_total_assignments {}", snapshot.total_assignments));

        if !snapshot.pool_utilization.is_empty() {
            lines.push("# HELP dispatcher_pool_utilization Pool utilization ratio (0.0-1.0)".to_string());
            lines.push("# TYPE dispatcher_pool_utilization gauge".to_string());
            let mut names: Vec<&String> = snapshot.pool_utilization.keys().collect();
            names.sort();
            for name in names {
                lines.push(format!(
                    "dispatcher_pool_utilization{{pool=\"{name}\"}} {}",
                    snapshot.pool_utilization[name]
                ));
            }
        }

        if !snapshot.pool_running_counts.is_empty() {
            lines.push("# HELP dispatcher_pool_running_count Running task count per pool".to_string());
            lines.push("# TYPE dispatcher_pool_running_count gauge".to_string());
            let mut names: Vec<&String> = snapshot.pool_running_counts.keys().collect();
            names.sort();
            for name in names {
                lines.push(format!(
                    "dispatcher_pool_running_count{{pool=\"{name}\"}} {}",
                    snapshot.pool_running_counts[name]
                ));
            }
        }

        lines.push(String::new());
        lines.join("\n")
    }

    pub fn priority_distribution(&self) -> HashMap<i64, u64> {
        let mut dist = HashMap::new();
        for a in self.assignments.lock().unwrap().iter() {
            *dist.entry(a.priority).or_insert(0) += 1;
        }
        dist
    }

    pub fn pool_assignment_counts(&self) -> HashMap<String, u64> {
        let mut counts = HashMap::new();
        for a in self.assignments.lock().unwrap().iter() {
            *counts.entry(a.pool_name.clone()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_includes_all_required_metric_names() {
        let collector = MetricsCollector::default();
        collector.collect(0, 0, 10, &[]);
        let text = collector.export_prometheus();
        for name in [
            "dispatcher_queue_size",
            "dispatcher_running_tasks",
            "dispatcher_global_running_count",
            "dispatcher_max_global_concurrency",
            "dispatcher_global_utilization",
            "dispatcher_average_wait_time_seconds",
            "dispatcher_total_assignments",
        ] {
            assert!(text.contains(name), "missing metric: {name}");
        }
    }

    #[test]
    fn average_wait_time_averages_recorded_assignments() {
        let collector = MetricsCollector::default();
        collector.record_assignment("p", 1, Utc::now());
        collector.collect(0, 0, 10, &[]);
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.total_assignments, 1);
    }
}
