use crate::demand::Demand;
use crate::loader::{BackgroundLoader, ReleaseNotifier};
use crate::registry::ResourceRegistry;
use crate::resource::{ResourceHandle, ResourceKind};
use crate::{CacheConfiguration, ResourceResult};
use residency_base::{MemoryBudget, TrackedMemoryBudget};
use std::sync::Arc;

struct CacheInner {
    // Declared first so the worker is shut down and joined before the registry goes away
    loader: BackgroundLoader,
    registry: ResourceRegistry,
    host_budget: Arc<dyn MemoryBudget>,
    gpu_budget: Arc<dyn MemoryBudget>,
    config: CacheConfiguration,
}

/// Owns the resource registry and the background loader. Cheap to clone; the worker thread is
/// stopped when the last clone (including the ones held by demands) is dropped.
#[derive(Clone)]
pub struct ResourceCache {
    inner: Arc<CacheInner>,
}

impl ResourceCache {
    /// Budgets are tracked internally from the configured limits. Use `with_budgets` to supply
    /// the application's own accounting.
    pub fn new(config: CacheConfiguration) -> ResourceResult<Self> {
        let host_budget = Arc::new(TrackedMemoryBudget::new(config.host_ram_budget_bytes));
        let gpu_budget = Arc::new(TrackedMemoryBudget::new(config.gpu_ram_budget_bytes));
        Self::with_budgets(config, host_budget, gpu_budget)
    }

    pub fn with_budgets(
        config: CacheConfiguration,
        host_budget: Arc<dyn MemoryBudget>,
        gpu_budget: Arc<dyn MemoryBudget>,
    ) -> ResourceResult<Self> {
        // Unbounded: the worker posts Released to itself while unloading
        let (command_tx, command_rx) = crossbeam_channel::unbounded();

        let registry = ResourceRegistry::new(ReleaseNotifier::new(command_tx.clone()));
        let loader = BackgroundLoader::new(
            &config,
            command_tx,
            command_rx,
            host_budget.clone(),
            gpu_budget.clone(),
        )?;

        log::info!(
            "Resource cache started (host budget {} bytes, gpu budget {} bytes, allowance {})",
            host_budget.budget_bytes(),
            gpu_budget.budget_bytes(),
            config.initial_allowance
        );

        Ok(ResourceCache {
            inner: Arc::new(CacheInner {
                loader,
                registry,
                host_budget,
                gpu_budget,
                config,
            }),
        })
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.inner.registry
    }

    pub fn loader(&self) -> &BackgroundLoader {
        &self.inner.loader
    }

    pub fn register_kind<F>(
        &self,
        suffix: &str,
        factory: F,
    ) where
        F: Fn(&str, &str) -> Box<dyn ResourceKind> + Send + Sync + 'static,
    {
        self.inner.registry.register_kind(suffix, factory);
    }

    pub fn get_or_make(
        &self,
        name: &str,
    ) -> ResourceResult<ResourceHandle> {
        self.inner.registry.get_or_make(name)
    }

    pub fn host_budget(&self) -> &Arc<dyn MemoryBudget> {
        &self.inner.host_budget
    }

    pub fn gpu_budget(&self) -> &Arc<dyn MemoryBudget> {
        &self.inner.gpu_budget
    }

    pub fn config(&self) -> &CacheConfiguration {
        &self.inner.config
    }

    pub fn new_demand(&self) -> Demand {
        Demand::new(self)
    }
}
