//! RetryManager (SPEC_FULL.md §4.7): per-task failure bookkeeping and
//! exponential backoff.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::types::RetryInfo;

pub struct RetryManagerConfig {
    pub initial_delay_secs: f64,
    pub backoff_base: f64,
    pub max_delay_secs: f64,
    pub max_attempts: u32,
}

impl Default for RetryManagerConfig {
    fn default() -> Self {
        RetryManagerConfig {
            initial_delay_secs: 1.0,
            backoff_base: 2.0,
            max_delay_secs: 300.0,
            max_attempts: 3,
        }
    }
}

pub struct RetryManager {
    config: RetryManagerConfig,
    info: Mutex<HashMap<String, RetryInfo>>,
}

impl RetryManager {
    pub fn new(config: RetryManagerConfig) -> Self {
        RetryManager {
            config,
            info: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    pub fn record_failure(&self, task_id: &str, reason: &str) -> RetryInfo {
        let mut guard = self.info.lock().unwrap();
        let entry = guard.entry(task_id.to_string()).or_insert(RetryInfo {
            retry_count: 0,
            last_failure_reason: String::new(),
            next_retry_at: Utc::now(),
        });
        entry.retry_count += 1;
        entry.last_failure_reason = reason.to_string();
        let exponent = (entry.retry_count as i32 - 1).max(0);
        let delay = (self.config.initial_delay_secs * self.config.backoff_base.powi(exponent))
            .min(self.config.max_delay_secs);
        entry.next_retry_at = Utc::now() + chrono::Duration::milliseconds((delay * 1000.0) as i64);
        entry.clone()
    }

    pub fn should_retry(&self, task_id: &str) -> bool {
        let guard = self.info.lock().unwrap();
        match guard.get(task_id) {
            Some(info) => info.retry_count < self.config.max_attempts && Utc::now() >= info.next_retry_at,
            None => true,
        }
    }

    pub fn get_retry_count(&self, task_id: &str) -> u32 {
        self.info
            .lock()
            .unwrap()
            .get(task_id)
            .map(|i| i.retry_count)
            .unwrap_or(0)
    }

    pub fn get_retry_info(&self, task_id: &str) -> Option<RetryInfo> {
        self.info.lock().unwrap().get(task_id).cloned()
    }

    pub fn clear_retry_info(&self, task_id: &str) {
        self.info.lock().unwrap().remove(task_id);
    }

    pub fn snapshot(&self) -> HashMap<String, RetryInfo> {
        self.info.lock().unwrap().clone()
    }

    /// True when the task has recorded failures but its backoff window has
    /// not yet elapsed (used by the Scheduler to skip it this pass).
    pub fn is_backing_off(&self, task_id: &str) -> bool {
        let guard = self.info.lock().unwrap();
        match guard.get(task_id) {
            Some(info) => Utc::now() < info.next_retry_at,
            None => false,
        }
    }

    pub fn next_retry_at(&self, task_id: &str) -> Option<DateTime<Utc>> {
        self.info.lock().unwrap().get(task_id).map(|i| i.next_retry_at)
    }
}
