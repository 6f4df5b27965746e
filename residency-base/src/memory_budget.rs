use std::sync::atomic::{AtomicU64, Ordering};

/// The memory pools that resources are charged against. Every resource uses host memory, some
/// additionally occupy GPU memory.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum MemoryDomain {
    Host,
    Gpu,
}

impl MemoryDomain {
    pub fn name(&self) -> &'static str {
        match self {
            MemoryDomain::Host => "host",
            MemoryDomain::Gpu => "gpu",
        }
    }
}

/// Supplied by the application, these are the only numeric inputs to eviction. Implementations are
/// queried from the loader's worker thread.
pub trait MemoryBudget: Send + Sync {
    fn budget_bytes(&self) -> u64;
    fn used_bytes(&self) -> u64;

    fn is_over_budget(&self) -> bool {
        self.used_bytes() >= self.budget_bytes()
    }
}

/// A fixed budget with an atomic usage counter. Resource kinds call `allocate`/`free` as they load and
/// unload so the cache can see usage without asking the platform.
#[derive(Debug)]
pub struct TrackedMemoryBudget {
    budget_bytes: u64,
    used: AtomicU64,
}

impl TrackedMemoryBudget {
    pub fn new(budget_bytes: u64) -> Self {
        TrackedMemoryBudget {
            budget_bytes,
            used: AtomicU64::new(0),
        }
    }

    pub fn allocate(
        &self,
        bytes: u64,
    ) {
        self.used.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn free(
        &self,
        bytes: u64,
    ) {
        let previous = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            })
            .unwrap_or_default();

        if previous < bytes {
            log::warn!(
                "Freed {} bytes but only {} bytes were tracked as used",
                bytes,
                previous
            );
        }
    }
}

impl MemoryBudget for TrackedMemoryBudget {
    fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tracked_budget_reports_pressure_at_the_limit() {
        let budget = TrackedMemoryBudget::new(100);
        assert!(!budget.is_over_budget());

        budget.allocate(60);
        assert!(!budget.is_over_budget());

        // At the budget counts as over
        budget.allocate(40);
        assert!(budget.is_over_budget());

        budget.free(40);
        assert_eq!(budget.used_bytes(), 60);
        assert!(!budget.is_over_budget());
    }

    #[test]
    fn tracked_budget_free_saturates() {
        let budget = TrackedMemoryBudget::new(100);
        budget.allocate(10);
        budget.free(25);
        assert_eq!(budget.used_bytes(), 0);
    }
}
