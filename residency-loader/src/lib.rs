mod error;
pub use error::{ResourceError, ResourceResult};

mod config;
pub use config::{CacheConfiguration, CacheConfigurationJson, CONFIG_FILE_NAME};

pub mod resource;
pub use resource::{LoadContext, ReloadWatcher, Resource, ResourceHandle, ResourceInfo, ResourceKind};

pub mod registry;
pub use registry::{ResourceFactory, ResourceRegistry};

mod demand;
pub use demand::Demand;

pub mod loader;
pub use loader::{replenish_allowance, BackgroundLoader, LoaderStatus};

mod cache;
pub use cache::ResourceCache;

pub use residency_base::{DemandId, MemoryBudget, MemoryDomain, ResourceId, TrackedMemoryBudget};
