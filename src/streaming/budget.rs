//! Memory budget management for the tile cache
//!
//! Tracks CPU and GPU bytes held by resident payloads and turns them into
//! pressure values that drive budget-based eviction.

/// Pressure above which eviction starts
pub const EVICT_PRESSURE: f32 = 0.9;
/// Pressure eviction tries to get back under
pub const TARGET_PRESSURE: f32 = 0.75;

/// Memory budget manager.
///
/// A budget of `None` means unlimited: its pressure is always zero.
#[derive(Clone, Debug, Default)]
pub struct MemoryBudget {
    /// Maximum CPU memory allowed (bytes)
    cpu_budget_bytes: Option<usize>,
    /// Maximum GPU memory allowed (bytes)
    gpu_budget_bytes: Option<usize>,
    cpu_used_bytes: usize,
    gpu_used_bytes: usize,
}

impl MemoryBudget {
    /// Create a budget from megabyte limits
    pub fn new(cpu_budget_mb: Option<usize>, gpu_budget_mb: Option<usize>) -> Self {
        Self {
            cpu_budget_bytes: cpu_budget_mb.map(|mb| mb * 1024 * 1024),
            gpu_budget_bytes: gpu_budget_mb.map(|mb| mb * 1024 * 1024),
            cpu_used_bytes: 0,
            gpu_used_bytes: 0,
        }
    }

    /// Create a budget from byte limits
    pub fn from_bytes(cpu_budget_bytes: Option<usize>, gpu_budget_bytes: Option<usize>) -> Self {
        Self { cpu_budget_bytes, gpu_budget_bytes, ..Default::default() }
    }

    pub fn is_limited(&self) -> bool {
        self.cpu_budget_bytes.is_some() || self.gpu_budget_bytes.is_some()
    }

    /// Replace the tracked usage with a fresh measurement
    pub fn set_usage(&mut self, cpu_bytes: usize, gpu_bytes: usize) {
        self.cpu_used_bytes = cpu_bytes;
        self.gpu_used_bytes = gpu_bytes;
    }

    pub fn cpu_used(&self) -> usize {
        self.cpu_used_bytes
    }

    pub fn gpu_used(&self) -> usize {
        self.gpu_used_bytes
    }

    fn pressure(used: usize, budget: Option<usize>) -> f32 {
        match budget {
            Some(0) => if used > 0 { f32::INFINITY } else { 0.0 },
            Some(budget) => used as f32 / budget as f32,
            None => 0.0,
        }
    }

    /// Get CPU memory pressure (0.0 to 1.0+)
    ///
    /// Values above 1.0 indicate over-budget.
    pub fn cpu_pressure(&self) -> f32 {
        Self::pressure(self.cpu_used_bytes, self.cpu_budget_bytes)
    }

    /// Get GPU memory pressure (0.0 to 1.0+)
    pub fn gpu_pressure(&self) -> f32 {
        Self::pressure(self.gpu_used_bytes, self.gpu_budget_bytes)
    }

    pub fn max_pressure(&self) -> f32 {
        self.cpu_pressure().max(self.gpu_pressure())
    }

    /// Check if we should evict payloads
    ///
    /// Returns true if either CPU or GPU pressure exceeds 0.9 (90% usage)
    pub fn should_evict(&self) -> bool {
        self.max_pressure() > EVICT_PRESSURE
    }

    /// True once eviction has brought usage back under the target
    pub fn is_under_target(&self) -> bool {
        self.max_pressure() <= TARGET_PRESSURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_budget_never_evicts() {
        let mut budget = MemoryBudget::new(None, None);
        budget.set_usage(usize::MAX / 2, usize::MAX / 2);
        assert!(!budget.is_limited());
        assert_eq!(budget.cpu_pressure(), 0.0);
        assert!(!budget.should_evict());
    }

    #[test]
    fn test_budget_pressure() {
        let mut budget = MemoryBudget::new(Some(100), None);
        budget.set_usage(50 * 1024 * 1024, 1 << 30);
        assert!((budget.cpu_pressure() - 0.5).abs() < 0.01);
        assert_eq!(budget.gpu_pressure(), 0.0);
        assert!(!budget.should_evict());
        assert!(budget.is_under_target());
    }

    #[test]
    fn test_should_evict_above_ninety_percent() {
        let mut budget = MemoryBudget::from_bytes(Some(1000), Some(1000));
        budget.set_usage(900, 0);
        assert!(!budget.should_evict());
        budget.set_usage(0, 901);
        assert!(budget.should_evict());
        assert!(!budget.is_under_target());
        budget.set_usage(0, 750);
        assert!(budget.is_under_target());
    }

    #[test]
    fn test_zero_budget() {
        let mut budget = MemoryBudget::from_bytes(Some(0), None);
        assert!(!budget.should_evict());
        budget.set_usage(1, 0);
        assert!(budget.should_evict());
    }
}
