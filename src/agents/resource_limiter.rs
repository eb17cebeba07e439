//! Admission control for agent processes.
//!
//! Checks the global cap, the per-role cap and the memory budget, and reserves capacity
//! in the same critical section so concurrent callers can never overshoot a limit.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_active_agents: usize,
    pub default_role_cap: usize,
    pub role_caps: HashMap<String, usize>,
    pub memory_budget_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_active_agents: 20,
            default_role_cap: 5,
            role_caps: HashMap::new(),
            memory_budget_mb: 16 * 1024,
        }
    }
}

impl ResourceLimits {
    pub fn role_cap(&self, role: &str) -> usize {
        self.role_caps
            .get(role)
            .copied()
            .unwrap_or(self.default_role_cap)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("global cap reached ({active}/{cap} active agents)")]
    GlobalCapReached { active: usize, cap: usize },

    #[error("role '{role}' cap reached ({active}/{cap})")]
    RoleCapReached {
        role: String,
        active: usize,
        cap: usize,
    },

    #[error("memory budget exceeded ({reserved_mb}MB reserved + {requested_mb}MB requested > {budget_mb}MB)")]
    MemoryBudgetExceeded {
        reserved_mb: u64,
        requested_mb: u64,
        budget_mb: u64,
    },
}

/// Capacity held on behalf of one agent. Consumed by [`ResourceLimiter::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct Reservation {
    id: u64,
    role: String,
    memory_mb: u64,
}

impl Reservation {
    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn memory_mb(&self) -> u64 {
        self.memory_mb
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    pub active_agents: usize,
    pub active_by_role: HashMap<String, usize>,
    pub reserved_memory_mb: u64,
}

#[derive(Debug)]
pub struct ResourceLimiter {
    limits: ResourceLimits,
    usage: Mutex<ResourceUsage>,
    next_reservation: AtomicU64,
}

impl ResourceLimiter {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            usage: Mutex::new(ResourceUsage::default()),
            next_reservation: AtomicU64::new(1),
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Atomically checks every limit and reserves capacity for one agent of `role`.
    pub fn try_admit(&self, role: &str, memory_mb: u64) -> Result<Reservation, AdmissionError> {
        let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);

        if usage.active_agents >= self.limits.max_active_agents {
            return Err(AdmissionError::GlobalCapReached {
                active: usage.active_agents,
                cap: self.limits.max_active_agents,
            });
        }

        let role_active = usage.active_by_role.get(role).copied().unwrap_or(0);
        let role_cap = self.limits.role_cap(role);
        if role_active >= role_cap {
            return Err(AdmissionError::RoleCapReached {
                role: role.to_string(),
                active: role_active,
                cap: role_cap,
            });
        }

        if usage.reserved_memory_mb + memory_mb > self.limits.memory_budget_mb {
            return Err(AdmissionError::MemoryBudgetExceeded {
                reserved_mb: usage.reserved_memory_mb,
                requested_mb: memory_mb,
                budget_mb: self.limits.memory_budget_mb,
            });
        }

        Self::reserve(&mut usage, role, memory_mb);
        debug!(
            role = %role,
            memory_mb = memory_mb,
            active_agents = usage.active_agents,
            "Admitted agent"
        );
        Ok(self.reservation(role, memory_mb))
    }

    /// Reserves capacity without checking limits, for processes that already exist
    /// (agents found alive during recovery).
    pub fn restore(&self, role: &str, memory_mb: u64) -> Reservation {
        let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
        Self::reserve(&mut usage, role, memory_mb);
        info!(
            role = %role,
            active_agents = usage.active_agents,
            "Restored reservation for surviving agent"
        );
        self.reservation(role, memory_mb)
    }

    pub fn release(&self, reservation: Reservation) {
        let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
        usage.active_agents = usage.active_agents.saturating_sub(1);
        if let Some(count) = usage.active_by_role.get_mut(&reservation.role) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                usage.active_by_role.remove(&reservation.role);
            }
        }
        usage.reserved_memory_mb = usage
            .reserved_memory_mb
            .saturating_sub(reservation.memory_mb);
        debug!(
            role = %reservation.role,
            reservation = reservation.id,
            active_agents = usage.active_agents,
            "Released reservation"
        );
    }

    pub fn usage(&self) -> ResourceUsage {
        self.usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn reserve(usage: &mut ResourceUsage, role: &str, memory_mb: u64) {
        usage.active_agents += 1;
        *usage.active_by_role.entry(role.to_string()).or_insert(0) += 1;
        usage.reserved_memory_mb += memory_mb;
    }

    fn reservation(&self, role: &str, memory_mb: u64) -> Reservation {
        Reservation {
            id: self.next_reservation.fetch_add(1, Ordering::Relaxed),
            role: role.to_string(),
            memory_mb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(global: usize, per_role: usize, memory: u64) -> ResourceLimits {
        ResourceLimits {
            max_active_agents: global,
            default_role_cap: per_role,
            role_caps: HashMap::new(),
            memory_budget_mb: memory,
        }
    }

    #[test]
    fn rejects_when_global_cap_reached() {
        let limiter = ResourceLimiter::new(limits(2, 10, 10_000));
        let _a = limiter.try_admit("engineer", 100).unwrap();
        let _b = limiter.try_admit("qa", 100).unwrap();
        assert!(matches!(
            limiter.try_admit("architect", 100),
            Err(AdmissionError::GlobalCapReached { active: 2, cap: 2 })
        ));
    }

    #[test]
    fn role_caps_override_default() {
        let mut limits = limits(10, 1, 10_000);
        limits.role_caps.insert("engineer".into(), 2);
        let limiter = ResourceLimiter::new(limits);

        let _e1 = limiter.try_admit("engineer", 10).unwrap();
        let _e2 = limiter.try_admit("engineer", 10).unwrap();
        assert!(matches!(
            limiter.try_admit("engineer", 10),
            Err(AdmissionError::RoleCapReached { .. })
        ));
        let _q1 = limiter.try_admit("qa", 10).unwrap();
        assert!(limiter.try_admit("qa", 10).is_err());
    }

    #[test]
    fn memory_budget_is_enforced() {
        let limiter = ResourceLimiter::new(limits(10, 10, 1000));
        let _a = limiter.try_admit("engineer", 600).unwrap();
        assert!(matches!(
            limiter.try_admit("engineer", 500),
            Err(AdmissionError::MemoryBudgetExceeded { .. })
        ));
        assert!(limiter.try_admit("engineer", 400).is_ok());
    }

    #[test]
    fn release_frees_capacity() {
        let limiter = ResourceLimiter::new(limits(1, 1, 1000));
        let reservation = limiter.try_admit("engineer", 500).unwrap();
        assert!(limiter.try_admit("engineer", 500).is_err());

        limiter.release(reservation);
        assert_eq!(limiter.usage(), ResourceUsage::default());
        assert!(limiter.try_admit("engineer", 500).is_ok());
    }

    #[test]
    fn restore_ignores_limits() {
        let limiter = ResourceLimiter::new(limits(1, 1, 100));
        let _a = limiter.try_admit("engineer", 100).unwrap();
        let _b = limiter.restore("engineer", 100);
        let usage = limiter.usage();
        assert_eq!(usage.active_agents, 2);
        assert_eq!(usage.reserved_memory_mb, 200);
    }
}
