//! Core data model: tasks, pools, runners, slots, and retry bookkeeping.
//!
//! Enum string (de)serialization follows the same `Display` + `FromStr` +
//! dedicated parse-error pattern used throughout the originating codebase's
//! data model, minus the `sqlx::Type` binding -- none of these types are
//! persisted by the dispatcher itself (see SPEC_FULL.md Non-goals).

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TaskStateParseError(pub String);

impl fmt::Display for TaskStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task state: {}", self.0)
    }
}
impl std::error::Error for TaskStateParseError {}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Blocked => "blocked",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TaskState {
    type Err = TaskStateParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(TaskState::Ready),
            "running" => Ok(TaskState::Running),
            "blocked" => Ok(TaskState::Blocked),
            "done" => Ok(TaskState::Done),
            "failed" => Ok(TaskState::Failed),
            other => Err(TaskStateParseError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolKind {
    LocalProcess,
    Container,
    ClusterJob,
}

#[derive(Debug, Clone)]
pub struct PoolKindParseError(pub String);

impl fmt::Display for PoolKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid pool kind: {}", self.0)
    }
}
impl std::error::Error for PoolKindParseError {}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PoolKind::LocalProcess => "local-process",
            PoolKind::Container => "container",
            PoolKind::ClusterJob => "cluster-job",
        };
        write!(f, "{s}")
    }
}

impl FromStr for PoolKind {
    type Err = PoolKindParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local-process" => Ok(PoolKind::LocalProcess),
            "container" => Ok(PoolKind::Container),
            "cluster-job" => Ok(PoolKind::ClusterJob),
            other => Err(PoolKindParseError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulingPolicy {
    Fifo,
    Priority,
    SkillBased,
    FairShare,
}

#[derive(Debug, Clone)]
pub struct SchedulingPolicyParseError(pub String);

impl fmt::Display for SchedulingPolicyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid scheduling policy: {}", self.0)
    }
}
impl std::error::Error for SchedulingPolicyParseError {}

impl FromStr for SchedulingPolicy {
    type Err = SchedulingPolicyParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fifo" => Ok(SchedulingPolicy::Fifo),
            "priority" => Ok(SchedulingPolicy::Priority),
            "skill-based" => Ok(SchedulingPolicy::SkillBased),
            "fair-share" => Ok(SchedulingPolicy::FairShare),
            other => Err(SchedulingPolicyParseError(other.to_string())),
        }
    }
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        SchedulingPolicy::Priority
    }
}

/// A unit of work pulled from the external Task Registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub state: TaskState,
    pub dependencies: Vec<String>,
    pub required_skill: Option<String>,
    pub priority: i64,
    pub is_optional: bool,
    pub artifacts: Vec<String>,
    pub reserved_branch: Option<String>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn spec_name(&self) -> Option<&str> {
        self.metadata.get("spec_name").map(String::as_str)
    }
}

/// A named group of execution environments of one kind.
#[derive(Debug, Clone)]
pub struct AgentPool {
    pub name: String,
    pub kind: PoolKind,
    pub max_concurrency: u32,
    pub current_running: u32,
    pub cpu_quota: Option<f64>,
    pub memory_quota_mb: Option<f64>,
    pub enabled: bool,
    pub config: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceUsage {
    pub cpu: f64,
    pub memory_mb: f64,
}

#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub name: String,
    pub kind: PoolKind,
    pub enabled: bool,
    pub max_concurrency: u32,
    pub current_running: u32,
    pub utilization: f64,
    pub cpu_usage: f64,
    pub memory_usage_mb: f64,
}

/// One execution of one task in one slot via one pool.
#[derive(Debug, Clone)]
pub struct Runner {
    pub runner_id: String,
    pub task_id: String,
    pub spec_name: String,
    pub pool_name: String,
    pub slot_id: String,
    pub started_at: DateTime<Utc>,
    pub state: RunnerState,
    pub handle: RunnerHandle,
}

/// The backend-specific handle returned by a launch.
#[derive(Debug, Clone)]
pub enum RunnerHandle {
    Pid(u32),
    ContainerId(String),
    JobName(String),
}

/// The monitor's view of a runner: the runner plus liveness bookkeeping.
#[derive(Debug, Clone)]
pub struct RunnerInfo {
    pub runner: Runner,
    pub last_heartbeat: DateTime<Utc>,
    pub state: RunnerState,
}

/// An external handle to a pre-warmed workspace allocation. The dispatcher
/// never mutates this; it only holds the ID for release.
#[derive(Debug, Clone)]
pub struct Slot {
    pub slot_id: String,
    pub repo_name: String,
    pub path: std::path::PathBuf,
    pub repo_url: String,
}

/// Per-task failure bookkeeping. Absent entry means no failures recorded.
#[derive(Debug, Clone)]
pub struct RetryInfo {
    pub retry_count: u32,
    pub last_failure_reason: String,
    pub next_retry_at: DateTime<Utc>,
}

/// The record handed to a runner backend at launch time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub task_id: String,
    pub spec_name: String,
    pub task_title: String,
    pub task_description: String,
    pub dependencies: Vec<String>,
    pub required_skill: Option<String>,
    pub slot_id: String,
    pub slot_path: std::path::PathBuf,
    pub repo_url: String,
    pub reserved_branch: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl TaskContext {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
