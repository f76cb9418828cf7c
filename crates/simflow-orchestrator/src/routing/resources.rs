// Resource requirements and capacity snapshots

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Resources a job declares it needs
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceRequirement {
    /// CPU cores
    pub cpu: f64,
    pub memory_mb: u64,
    pub gpu: u32,
}

impl ResourceRequirement {
    pub fn new(cpu: f64, memory_mb: u64, gpu: u32) -> Self {
        Self { cpu, memory_mb, gpu }
    }
}

/// Capacity available right now
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Idle CPU cores
    pub cpu_available: f64,
    pub memory_available_mb: u64,
    pub gpu_available: u32,
}

impl ResourceSnapshot {
    pub fn new(cpu_available: f64, memory_available_mb: u64, gpu_available: u32) -> Self {
        Self {
            cpu_available,
            memory_available_mb,
            gpu_available,
        }
    }

    /// Effectively unbounded capacity
    pub fn unlimited() -> Self {
        Self::new(f64::MAX, u64::MAX, u32::MAX)
    }

    /// Names of the resources that fall short of `requirement`
    pub fn shortfalls(&self, requirement: &ResourceRequirement) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.cpu_available < requirement.cpu {
            missing.push("cpu");
        }
        if self.memory_available_mb < requirement.memory_mb {
            missing.push("memory");
        }
        if self.gpu_available < requirement.gpu {
            missing.push("gpu");
        }
        missing
    }

    pub fn satisfies(&self, requirement: &ResourceRequirement) -> bool {
        self.shortfalls(requirement).is_empty()
    }
}

/// Source of capacity snapshots, queried synchronously at decision time
pub trait CapacityProvider: Send + Sync {
    fn snapshot(&self) -> ResourceSnapshot;
}

/// Fixed capacity that tests and static deployments can adjust
#[derive(Debug, Default)]
pub struct StaticCapacity {
    snapshot: RwLock<ResourceSnapshot>,
}

impl StaticCapacity {
    pub fn new(snapshot: ResourceSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(ResourceSnapshot::unlimited())
    }

    pub fn set(&self, snapshot: ResourceSnapshot) {
        *self.snapshot.write() = snapshot;
    }
}

impl CapacityProvider for StaticCapacity {
    fn snapshot(&self) -> ResourceSnapshot {
        *self.snapshot.read()
    }
}

/// Capacity of the local host via `sysinfo`
///
/// Idle cores are estimated from the average CPU usage since the previous
/// refresh. GPUs are not discoverable through `sysinfo` and are configured.
pub struct SystemCapacity {
    system: Mutex<System>,
    gpu_available: u32,
}

impl SystemCapacity {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
            gpu_available: 0,
        }
    }

    pub fn with_gpus(mut self, gpus: u32) -> Self {
        self.gpu_available = gpus;
        self
    }
}

impl Default for SystemCapacity {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SystemCapacity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemCapacity")
            .field("gpu_available", &self.gpu_available)
            .finish_non_exhaustive()
    }
}

impl CapacityProvider for SystemCapacity {
    fn snapshot(&self) -> ResourceSnapshot {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.refresh_cpu_usage();

        let cpus = system.cpus();
        let cpu_available = if cpus.is_empty() {
            std::thread::available_parallelism()
                .map(|n| n.get() as f64)
                .unwrap_or(1.0)
        } else {
            cpus.iter()
                .map(|cpu| 1.0 - f64::from(cpu.cpu_usage()).clamp(0.0, 100.0) / 100.0)
                .sum()
        };

        ResourceSnapshot {
            cpu_available,
            memory_available_mb: system.available_memory() / (1024 * 1024),
            gpu_available: self.gpu_available,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shortfalls() {
        let snapshot = ResourceSnapshot::new(4.0, 8_192, 0);
        let requirement = ResourceRequirement::new(8.0, 4_096, 1);
        assert_eq!(snapshot.shortfalls(&requirement), vec!["cpu", "gpu"]);
        assert!(!snapshot.satisfies(&requirement));
        assert!(snapshot.satisfies(&ResourceRequirement::new(4.0, 8_192, 0)));
    }

    #[test]
    fn test_static_capacity_can_change() {
        let capacity = StaticCapacity::unlimited();
        assert!(capacity
            .snapshot()
            .satisfies(&ResourceRequirement::new(64.0, 1 << 20, 8)));

        capacity.set(ResourceSnapshot::new(1.0, 512, 0));
        assert_eq!(capacity.snapshot().memory_available_mb, 512);
    }

    #[test]
    fn test_system_capacity_reports_something() {
        let capacity = SystemCapacity::new().with_gpus(2);
        let snapshot = capacity.snapshot();
        assert!(snapshot.cpu_available >= 0.0);
        assert_eq!(snapshot.gpu_available, 2);
    }
}
