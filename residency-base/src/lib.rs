pub mod hashing;

mod ids;
pub use ids::{DemandId, ResourceId};

pub mod eviction_queue;
pub use eviction_queue::EvictionQueue;

pub mod memory_budget;
pub use memory_budget::{MemoryBudget, MemoryDomain, TrackedMemoryBudget};
