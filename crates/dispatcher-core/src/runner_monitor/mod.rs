//! RunnerMonitor (SPEC_FULL.md §4.6): tracks heartbeats and triggers a
//! timeout handler when a heartbeat goes stale.
//!
//! Grounded on the source `RunnerMonitor.check_heartbeats`: timed-out
//! runners are collected under the lock, the lock is released, and only
//! then is the handler invoked -- this prevents deadlock against
//! DispatcherCore, which reaches back into the monitor from the handler.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use crate::types::{Runner, RunnerInfo, RunnerState};

pub struct RunnerMonitor {
    runners: Mutex<HashMap<String, RunnerInfo>>,
    heartbeat_timeout: Duration,
}

impl RunnerMonitor {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        RunnerMonitor {
            runners: Mutex::new(HashMap::new()),
            heartbeat_timeout,
        }
    }

    pub fn add_runner(&self, runner: Runner) {
        let mut guard = self.runners.lock().unwrap();
        guard.insert(
            runner.runner_id.clone(),
            RunnerInfo {
                last_heartbeat: Utc::now(),
                state: RunnerState::Running,
                runner,
            },
        );
    }

    pub fn update_heartbeat(&self, runner_id: &str) {
        let mut guard = self.runners.lock().unwrap();
        match guard.get_mut(runner_id) {
            Some(info) => info.last_heartbeat = Utc::now(),
            None => warn!(runner_id, "heartbeat for unknown runner, ignoring"),
        }
    }

    pub fn update_runner_state(&self, runner_id: &str, new_state: RunnerState) {
        let mut guard = self.runners.lock().unwrap();
        if let Some(info) = guard.get_mut(runner_id) {
            info.state = new_state;
        } else {
            warn!(runner_id, "state update for unknown runner, ignoring");
        }
    }

    pub fn remove_runner(&self, runner_id: &str) -> Option<RunnerInfo> {
        self.runners.lock().unwrap().remove(runner_id)
    }

    pub fn get_runner(&self, runner_id: &str) -> Option<RunnerInfo> {
        self.runners.lock().unwrap().get(runner_id).cloned()
    }

    pub fn get_all_runners(&self) -> HashMap<String, RunnerInfo> {
        self.runners.lock().unwrap().clone()
    }

    pub fn get_running_count(&self) -> usize {
        self.runners
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.state == RunnerState::Running)
            .count()
    }

    /// Finds runners whose heartbeat has gone stale, transitions each to
    /// Failed, and invokes `timeout_handler` for each *after* releasing the
    /// lock. Handler errors are logged and swallowed.
    pub async fn check_heartbeats<F, Fut>(&self, timeout_handler: F)
    where
        F: Fn(RunnerInfo) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        let timed_out: Vec<RunnerInfo> = {
            let mut guard = self.runners.lock().unwrap();
            let now = Utc::now();
            let stale_ids: Vec<String> = guard
                .iter()
                .filter(|(_, info)| {
                    info.state == RunnerState::Running
                        && now.signed_duration_since(info.last_heartbeat).to_std().unwrap_or_default()
                            > self.heartbeat_timeout
                })
                .map(|(id, _)| id.clone())
                .collect();
            stale_ids
                .into_iter()
                .map(|id| {
                    let info = guard.get_mut(&id).unwrap();
                    info.state = RunnerState::Failed;
                    info.clone()
                })
                .collect()
        };

        for info in timed_out {
            let runner_id = info.runner.runner_id.clone();
            if let Err(err) = timeout_handler(info).await {
                warn!(runner_id, error = %err, "timeout handler failed, swallowing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunnerHandle;

    fn runner(id: &str) -> Runner {
        Runner {
            runner_id: id.to_string(),
            task_id: "task".to_string(),
            spec_name: "spec".to_string(),
            pool_name: "pool".to_string(),
            slot_id: "slot".to_string(),
            started_at: Utc::now(),
            state: RunnerState::Running,
            handle: RunnerHandle::Pid(1),
        }
    }

    #[tokio::test]
    async fn stale_heartbeat_transitions_to_failed_and_invokes_handler_once() {
        let monitor = RunnerMonitor::new(Duration::from_millis(10));
        monitor.add_runner(runner("r1"));
        tokio::time::sleep(Duration::from_millis(30)).await;

        let calls = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let calls_clone = calls.clone();
        monitor
            .check_heartbeats(move |_info| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        let info = monitor.get_runner("r1").unwrap();
        assert_eq!(info.state, RunnerState::Failed);

        // Second sweep must not re-trigger the handler: state is no longer Running.
        let calls_clone2 = calls.clone();
        monitor
            .check_heartbeats(move |_info| {
                let calls = calls_clone2.clone();
                async move {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_runner_heartbeat_is_ignored_not_panicking() {
        let monitor = RunnerMonitor::new(Duration::from_secs(60));
        monitor.update_heartbeat("nope");
    }

    #[test]
    fn get_all_runners_returns_a_copy() {
        let monitor = RunnerMonitor::new(Duration::from_secs(60));
        monitor.add_runner(runner("r1"));
        let mut snapshot = monitor.get_all_runners();
        snapshot.clear();
        assert_eq!(monitor.get_all_runners().len(), 1);
    }
}
