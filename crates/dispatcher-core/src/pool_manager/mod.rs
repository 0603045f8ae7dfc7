//! AgentPoolManager (SPEC_FULL.md §4.2): owns pool descriptors, skill
//! routing, load-balanced selection, and per-pool counters/quotas.
//!
//! Grounded on the source `AgentPoolManager`, with one deliberate
//! divergence: `_select_least_loaded_pool` there has no tiebreak, but
//! SPEC_FULL.md explicitly requires "ties broken by alphabetical pool
//! name" for both skill routing and fair-share scheduling. This
//! implementation adds that tiebreak; see DESIGN.md.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::warn;

use crate::config::DispatcherConfig;
use crate::error::PoolNotFoundError;
use crate::types::{AgentPool, PoolStatus, ResourceUsage};

struct Inner {
    /// Insertion order, so "first enabled pool by insertion order" is well
    /// defined without pulling in an indexmap dependency.
    order: Vec<String>,
    pools: HashMap<String, AgentPool>,
    resource_usage: HashMap<String, ResourceUsage>,
}

pub struct AgentPoolManager {
    inner: Mutex<Inner>,
    skill_mapping: HashMap<String, Vec<String>>,
}

impl AgentPoolManager {
    pub fn from_config(config: &DispatcherConfig) -> Self {
        let mut order = Vec::new();
        let mut pools = HashMap::new();
        let mut resource_usage = HashMap::new();
        for (name, pool_cfg) in &config.agent_pools {
            order.push(name.clone());
            pools.insert(
                name.clone(),
                AgentPool {
                    name: name.clone(),
                    kind: pool_cfg.kind,
                    max_concurrency: pool_cfg.max_concurrency,
                    current_running: 0,
                    cpu_quota: pool_cfg.cpu_quota,
                    memory_quota_mb: pool_cfg.memory_quota,
                    enabled: pool_cfg.enabled,
                    config: pool_cfg.config.clone(),
                },
            );
            resource_usage.insert(name.clone(), ResourceUsage::default());
        }
        order.sort();
        AgentPoolManager {
            inner: Mutex::new(Inner {
                order,
                pools,
                resource_usage,
            }),
            skill_mapping: config.skill_mapping.clone(),
        }
    }

    fn can_accept_locked(pool: &AgentPool, usage: &ResourceUsage) -> bool {
        if !pool.enabled || pool.current_running >= pool.max_concurrency {
            return false;
        }
        if let Some(cpu_quota) = pool.cpu_quota {
            if usage.cpu >= cpu_quota {
                return false;
            }
        }
        if let Some(mem_quota) = pool.memory_quota_mb {
            if usage.memory_mb >= mem_quota {
                return false;
            }
        }
        true
    }

    pub fn can_accept_task(&self, pool_name: &str) -> Result<bool, PoolNotFoundError> {
        let inner = self.inner.lock().unwrap();
        let pool = inner
            .pools
            .get(pool_name)
            .ok_or_else(|| PoolNotFoundError::Unknown(pool_name.to_string()))?;
        let usage = inner
            .resource_usage
            .get(pool_name)
            .cloned()
            .unwrap_or_default();
        Ok(Self::can_accept_locked(pool, &usage))
    }

    /// Candidates enabled and able to accept a task, sorted by
    /// (utilization ascending, name ascending) so index 0 is the pick.
    fn ranked_candidates(inner: &Inner, names: &[String]) -> Vec<String> {
        let mut candidates: Vec<(f64, String)> = names
            .iter()
            .filter_map(|name| {
                let pool = inner.pools.get(name)?;
                let usage = inner.resource_usage.get(name).cloned().unwrap_or_default();
                if !Self::can_accept_locked(pool, &usage) {
                    return None;
                }
                let ratio = if pool.max_concurrency == 0 {
                    0.0
                } else {
                    pool.current_running as f64 / pool.max_concurrency as f64
                };
                Some((ratio, name.clone()))
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });
        candidates.into_iter().map(|(_, name)| name).collect()
    }

    pub fn get_pool_for_skill(&self, skill: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        let names = self
            .skill_mapping
            .get(skill)
            .or_else(|| self.skill_mapping.get("default"));
        let names = names?;
        Self::ranked_candidates(&inner, names).into_iter().next()
    }

    pub fn get_default_pool(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        if let Some(default_names) = self.skill_mapping.get("default") {
            for name in default_names {
                if let Some(pool) = inner.pools.get(name) {
                    if pool.enabled {
                        return Some(name.clone());
                    }
                }
            }
        }
        inner
            .order
            .iter()
            .find(|name| inner.pools.get(*name).is_some_and(|p| p.enabled))
            .cloned()
    }

    pub fn increment_running_count(&self, pool_name: &str) -> Result<(), PoolNotFoundError> {
        let mut inner = self.inner.lock().unwrap();
        let pool = inner
            .pools
            .get_mut(pool_name)
            .ok_or_else(|| PoolNotFoundError::Unknown(pool_name.to_string()))?;
        pool.current_running += 1;
        Ok(())
    }

    pub fn decrement_running_count(&self, pool_name: &str) -> Result<(), PoolNotFoundError> {
        let mut inner = self.inner.lock().unwrap();
        let pool = inner
            .pools
            .get_mut(pool_name)
            .ok_or_else(|| PoolNotFoundError::Unknown(pool_name.to_string()))?;
        if pool.current_running == 0 {
            warn!(pool = pool_name, "running count underflow clamped at zero");
        } else {
            pool.current_running -= 1;
        }
        Ok(())
    }

    pub fn update_resource_usage(
        &self,
        pool_name: &str,
        delta_cpu: f64,
        delta_memory_mb: f64,
    ) -> Result<(), PoolNotFoundError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.pools.contains_key(pool_name) {
            return Err(PoolNotFoundError::Unknown(pool_name.to_string()));
        }
        let pool = inner.pools.get(pool_name).unwrap().clone();
        let usage = inner.resource_usage.entry(pool_name.to_string()).or_default();
        usage.cpu = (usage.cpu + delta_cpu).max(0.0);
        usage.memory_mb = (usage.memory_mb + delta_memory_mb).max(0.0);
        if let Some(quota) = pool.cpu_quota {
            if usage.cpu > quota {
                warn!(pool = pool_name, cpu = usage.cpu, quota, "cpu quota exceeded");
            }
        }
        if let Some(quota) = pool.memory_quota_mb {
            if usage.memory_mb > quota {
                warn!(
                    pool = pool_name,
                    memory = usage.memory_mb,
                    quota,
                    "memory quota exceeded"
                );
            }
        }
        Ok(())
    }

    pub fn enable_pool(&self, pool_name: &str) -> Result<(), PoolNotFoundError> {
        let mut inner = self.inner.lock().unwrap();
        let pool = inner
            .pools
            .get_mut(pool_name)
            .ok_or_else(|| PoolNotFoundError::Unknown(pool_name.to_string()))?;
        pool.enabled = true;
        Ok(())
    }

    pub fn disable_pool(&self, pool_name: &str) -> Result<(), PoolNotFoundError> {
        let mut inner = self.inner.lock().unwrap();
        let pool = inner
            .pools
            .get_mut(pool_name)
            .ok_or_else(|| PoolNotFoundError::Unknown(pool_name.to_string()))?;
        pool.enabled = false;
        Ok(())
    }

    pub fn get_pool_status(&self, pool_name: &str) -> Result<PoolStatus, PoolNotFoundError> {
        let inner = self.inner.lock().unwrap();
        let pool = inner
            .pools
            .get(pool_name)
            .ok_or_else(|| PoolNotFoundError::Unknown(pool_name.to_string()))?;
        let usage = inner
            .resource_usage
            .get(pool_name)
            .cloned()
            .unwrap_or_default();
        Ok(PoolStatus {
            name: pool.name.clone(),
            kind: pool.kind,
            enabled: pool.enabled,
            max_concurrency: pool.max_concurrency,
            current_running: pool.current_running,
            utilization: if pool.max_concurrency == 0 {
                0.0
            } else {
                pool.current_running as f64 / pool.max_concurrency as f64
            },
            cpu_usage: usage.cpu,
            memory_usage_mb: usage.memory_mb,
        })
    }

    pub fn get_all_pool_statuses(&self) -> Vec<PoolStatus> {
        let names: Vec<String> = {
            let inner = self.inner.lock().unwrap();
            inner.order.clone()
        };
        names
            .into_iter()
            .filter_map(|name| self.get_pool_status(&name).ok())
            .collect()
    }

    pub fn pool_snapshot(&self, pool_name: &str) -> Option<AgentPool> {
        self.inner.lock().unwrap().pools.get(pool_name).cloned()
    }

    /// For the FairShare policy: candidates that can currently accept,
    /// given an extra per-round assignment count layered on top of
    /// `current_running`. Ties broken alphabetically.
    pub fn least_loaded_with_round_counts(
        &self,
        round_assignments: &HashMap<String, u32>,
    ) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut candidates: Vec<(u32, String)> = inner
            .order
            .iter()
            .filter_map(|name| {
                let pool = inner.pools.get(name)?;
                let usage = inner.resource_usage.get(name).cloned().unwrap_or_default();
                if !Self::can_accept_locked(pool, &usage) {
                    return None;
                }
                let extra = round_assignments.get(name).copied().unwrap_or(0);
                Some((pool.current_running + extra, name.clone()))
            })
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        candidates.into_iter().map(|(_, name)| name).collect()
    }

    pub fn all_pool_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().order.clone()
    }
}
