//! Dispatcher configuration schema (SPEC_FULL.md §6).
//!
//! Deserialized from TOML. Mirrors the source config's dual flat/nested
//! shape for the retry and graceful-shutdown groups: a caller may write
//! either `retry_max_attempts = 5` at the top level or a `[retry]` table.
//! Parsing a config file path from CLI flags is out of scope (SPEC_FULL.md
//! §1); this module only defines the typed schema and its TOML decoding.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::types::{PoolKind, SchedulingPolicy};

fn default_poll_interval() -> u64 {
    5
}
fn default_scheduling_policy() -> SchedulingPolicy {
    SchedulingPolicy::Priority
}
fn default_max_global_concurrency() -> u32 {
    10
}
fn default_heartbeat_timeout() -> u64 {
    60
}
fn default_retry_max_attempts() -> u32 {
    3
}
fn default_retry_backoff_base() -> f64 {
    2.0
}
fn default_retry_initial_delay() -> f64 {
    1.0
}
fn default_graceful_shutdown_timeout() -> u64 {
    300
}
fn default_deadlock_check_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub backoff_base: f64,
    pub initial_delay: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        RetrySection {
            max_attempts: default_retry_max_attempts(),
            backoff_base: default_retry_backoff_base(),
            initial_delay: default_retry_initial_delay(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GracefulShutdownSection {
    pub timeout: u64,
}

impl Default for GracefulShutdownSection {
    fn default() -> Self {
        GracefulShutdownSection {
            timeout: default_graceful_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentPoolConfig {
    #[serde(rename = "type")]
    pub kind: PoolKind,
    pub max_concurrency: u32,
    pub cpu_quota: Option<f64>,
    pub memory_quota: Option<f64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub poll_interval: u64,
    pub scheduling_policy: SchedulingPolicy,
    pub max_global_concurrency: u32,
    pub heartbeat_timeout: u64,
    pub deadlock_check_interval: u64,

    /// Flat retry fields, applied when the `[retry]` table is absent.
    pub retry_max_attempts: u32,
    pub retry_backoff_base: f64,
    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay: f64,
    pub retry: Option<RetrySection>,

    /// Flat shutdown field, applied when the `[graceful_shutdown]` table is absent.
    pub graceful_shutdown_timeout: u64,
    pub graceful_shutdown: Option<GracefulShutdownSection>,

    pub task_registry_dir: Option<PathBuf>,
    pub agent_pools: HashMap<String, AgentPoolConfig>,
    pub skill_mapping: HashMap<String, Vec<String>>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            poll_interval: default_poll_interval(),
            scheduling_policy: default_scheduling_policy(),
            max_global_concurrency: default_max_global_concurrency(),
            heartbeat_timeout: default_heartbeat_timeout(),
            deadlock_check_interval: default_deadlock_check_interval(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_backoff_base: default_retry_backoff_base(),
            retry_initial_delay: default_retry_initial_delay(),
            retry: None,
            graceful_shutdown_timeout: default_graceful_shutdown_timeout(),
            graceful_shutdown: None,
            task_registry_dir: None,
            agent_pools: HashMap::new(),
            skill_mapping: HashMap::new(),
        }
    }
}

impl DispatcherConfig {
    /// Parse a TOML document into a `DispatcherConfig`.
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let cfg: DispatcherConfig = toml::from_str(s)?;
        Ok(cfg)
    }

    /// Effective max retry attempts, preferring the nested `[retry]` table.
    pub fn effective_retry_max_attempts(&self) -> u32 {
        self.retry
            .as_ref()
            .map(|r| r.max_attempts)
            .unwrap_or(self.retry_max_attempts)
    }

    /// Effective backoff base, preferring the nested `[retry]` table.
    pub fn effective_retry_backoff_base(&self) -> f64 {
        self.retry
            .as_ref()
            .map(|r| r.backoff_base)
            .unwrap_or(self.retry_backoff_base)
    }

    /// Effective initial retry delay, preferring the nested `[retry]` table.
    pub fn effective_retry_initial_delay(&self) -> f64 {
        self.retry
            .as_ref()
            .map(|r| r.initial_delay)
            .unwrap_or(self.retry_initial_delay)
    }

    /// Effective graceful shutdown timeout, preferring the nested table.
    pub fn effective_graceful_shutdown_timeout(&self) -> u64 {
        self.graceful_shutdown
            .as_ref()
            .map(|g| g.timeout)
            .unwrap_or(self.graceful_shutdown_timeout)
    }
}
