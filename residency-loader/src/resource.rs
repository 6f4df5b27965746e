use crate::loader::ReleaseNotifier;
use crate::registry::{RegistryInner, ResourceRegistry};
use crate::{ResourceError, ResourceResult};
use parking_lot::Mutex;
use residency_base::{MemoryDomain, ResourceId};
use std::sync::{Arc, Weak};

pub type ResourceHandle = Arc<Resource>;

/// Implemented by each concrete kind of resource (mesh, texture, audio, etc.). The generic
/// `Resource` wrapper enforces the lifecycle preconditions and maintains loaded state, ref counts
/// and the dependency graph; a kind only moves its own data in and out of memory.
///
/// `load_impl` and `reload_impl` may be called on the background loader's worker thread.
pub trait ResourceKind: Send {
    /// Perform the actual load. Any other resource this one needs must be declared with
    /// `LoadContext::add_dependency`, which loads it synchronously if it isn't loaded yet.
    fn load_impl(
        &mut self,
        ctx: &mut LoadContext,
    ) -> ResourceResult<()>;

    /// Release the underlying storage. Only called on a loaded resource with no users.
    fn unload_impl(&mut self);

    /// Refresh a loaded resource, for example after the file changed on disk. Kinds that can
    /// update in place should override this.
    fn reload_impl(
        &mut self,
        ctx: &mut LoadContext,
    ) -> ResourceResult<()> {
        self.unload_impl();
        self.load_impl(ctx)
    }

    /// GPU-backed resources are charged against the GPU budget in addition to host memory
    fn is_gpu_backed(&self) -> bool {
        false
    }
}

/// Notified synchronously, on whichever thread did the work, after every successful load or
/// reload of a resource it watches.
pub trait ReloadWatcher: Send + Sync {
    fn resource_reloaded(
        &self,
        resource: &Resource,
    );
}

struct ResourceState {
    loaded: bool,
    users: u32,
    // Only non-empty while loaded. Each entry holds one user count on the dependency.
    dependencies: Vec<ResourceHandle>,
}

pub struct Resource {
    id: ResourceId,
    name: String,
    gpu_backed: bool,

    // Held for the duration of every load/unload/reload, so at most one of them is in flight for
    // this resource. Lock order is always kind before state.
    kind: Mutex<Box<dyn ResourceKind>>,
    state: Mutex<ResourceState>,

    reload_watchers: Mutex<Vec<Weak<dyn ReloadWatcher>>>,

    // Used to resolve dependencies by name during loads
    registry: Weak<RegistryInner>,
    release_notifier: ReleaseNotifier,
}

/// Snapshot of a resource's state for diagnostics. May be stale as soon as it is returned.
#[derive(Debug, Clone)]
pub struct ResourceInfo {
    pub id: ResourceId,
    pub name: String,
    pub loaded: bool,
    pub users: u32,
    pub dependency_count: usize,
    pub gpu_backed: bool,
}

impl Resource {
    pub(crate) fn new(
        name: String,
        kind: Box<dyn ResourceKind>,
        registry: Weak<RegistryInner>,
        release_notifier: ReleaseNotifier,
    ) -> Self {
        let gpu_backed = kind.is_gpu_backed();
        Resource {
            id: ResourceId::allocate(),
            name,
            gpu_backed,
            kind: Mutex::new(kind),
            state: Mutex::new(ResourceState {
                loaded: false,
                users: 0,
                dependencies: Vec::default(),
            }),
            reload_watchers: Mutex::default(),
            registry,
            release_notifier,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_gpu_backed(&self) -> bool {
        self.gpu_backed
    }

    /// The eviction queues this resource goes to when it has no users
    pub fn memory_domains(&self) -> &'static [MemoryDomain] {
        if self.gpu_backed {
            &[MemoryDomain::Host, MemoryDomain::Gpu]
        } else {
            &[MemoryDomain::Host]
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().loaded
    }

    pub fn users(&self) -> u32 {
        self.state.lock().users
    }

    pub fn dependencies(&self) -> Vec<ResourceHandle> {
        self.state.lock().dependencies.clone()
    }

    pub fn info(&self) -> ResourceInfo {
        let state = self.state.lock();
        ResourceInfo {
            id: self.id,
            name: self.name.clone(),
            loaded: state.loaded,
            users: state.users,
            dependency_count: state.dependencies.len(),
            gpu_backed: self.gpu_backed,
        }
    }

    pub fn increment(&self) {
        let mut state = self.state.lock();
        state.users += 1;
    }

    /// Returns true if this was the last user. Scheduling eviction is up to the caller.
    pub fn decrement(&self) -> bool {
        let mut state = self.state.lock();
        assert!(
            state.users > 0,
            "Resource {} \"{}\" decremented with no users",
            self.id,
            self.name
        );
        state.users -= 1;
        state.users == 0
    }

    pub fn add_reload_watcher<W: ReloadWatcher + 'static>(
        &self,
        watcher: &Arc<W>,
    ) {
        let watcher: Weak<dyn ReloadWatcher> = Arc::downgrade(watcher) as Weak<dyn ReloadWatcher>;
        self.reload_watchers.lock().push(watcher);
    }

    /// Load the resource on the calling thread. Loading a resource that is already loaded is a bug
    /// in the caller.
    pub fn load(&self) -> ResourceResult<()> {
        let mut kind = self.kind.lock();
        assert!(
            !self.is_loaded(),
            "Resource {} \"{}\" is already loaded",
            self.id,
            self.name
        );
        self.load_locked(&mut **kind)
    }

    /// Load the resource unless it is already loaded. Returns whether a load actually happened.
    /// If another thread is loading it, this blocks until that load finishes.
    pub fn load_if_unloaded(&self) -> ResourceResult<bool> {
        let mut kind = self.kind.lock();
        if self.is_loaded() {
            return Ok(false);
        }

        self.load_locked(&mut **kind)?;
        Ok(true)
    }

    fn load_locked(
        &self,
        kind: &mut dyn ResourceKind,
    ) -> ResourceResult<()> {
        profiling::scope!("Resource::load");
        log::debug!("load {} {:?}", self.id, self.name);

        let mut ctx = LoadContext::new(self);
        let result = kind.load_impl(&mut ctx);
        let dependencies = ctx.into_dependencies();

        match result {
            Ok(()) => {
                {
                    let mut state = self.state.lock();
                    assert!(state.dependencies.is_empty());
                    state.dependencies = dependencies;
                    state.loaded = true;
                }

                self.notify_reload_watchers();
                Ok(())
            }
            Err(e) => {
                // Anything the failed attempt pulled in is given back
                self.release_dependencies(dependencies);
                Err(e)
            }
        }
    }

    /// Unload the resource on the calling thread. It must be loaded and have no users.
    pub fn unload(&self) {
        let mut kind = self.kind.lock();
        let dependencies = {
            let mut state = self.state.lock();
            assert!(
                state.loaded,
                "Resource {} \"{}\" is not loaded",
                self.id,
                self.name
            );
            assert_eq!(
                state.users, 0,
                "Resource {} \"{}\" unloaded while still in use",
                self.id, self.name
            );
            state.loaded = false;
            std::mem::take(&mut state.dependencies)
        };

        let released = self.unload_locked(&mut **kind, dependencies);
        self.notify_released(released);
    }

    // Unloads only if the resource is still loaded and unused. The check and the flip to unloaded
    // happen under one lock so a consumer incrementing concurrently either sees the resource as
    // unloaded or keeps it alive. Skips resources that are busy loading or reloading.
    //
    // On success returns the dependencies left with no users. The caller owns submitting them for
    // eviction, nothing is sent to the loader.
    pub(crate) fn try_evict(&self) -> Option<Vec<ResourceHandle>> {
        let mut kind = self.kind.try_lock()?;

        let dependencies = {
            let mut state = self.state.lock();
            if !state.loaded || state.users > 0 {
                return None;
            }

            state.loaded = false;
            std::mem::take(&mut state.dependencies)
        };

        Some(self.unload_locked(&mut **kind, dependencies))
    }

    // Returns the dependencies that reached zero users
    fn unload_locked(
        &self,
        kind: &mut dyn ResourceKind,
        dependencies: Vec<ResourceHandle>,
    ) -> Vec<ResourceHandle> {
        profiling::scope!("Resource::unload");
        log::debug!("unload {} {:?}", self.id, self.name);
        let released = decrement_dependencies(dependencies);
        kind.unload_impl();
        released
    }

    /// Refresh a loaded resource in place. If the reload fails, the resource ends up unloaded.
    pub fn reload(&self) -> ResourceResult<()> {
        let mut kind = self.kind.lock();
        assert!(
            self.is_loaded(),
            "Resource {} \"{}\" reloaded while not loaded",
            self.id,
            self.name
        );

        profiling::scope!("Resource::reload");
        log::debug!("reload {} {:?}", self.id, self.name);

        let mut ctx = LoadContext::new(self);
        let result = kind.reload_impl(&mut ctx);
        let new_dependencies = ctx.into_dependencies();

        match result {
            Ok(()) => {
                let old_dependencies = {
                    let mut state = self.state.lock();
                    std::mem::replace(&mut state.dependencies, new_dependencies)
                };

                // Release after the new list is in place so shared dependencies never hit zero
                self.release_dependencies(old_dependencies);
                self.notify_reload_watchers();
                Ok(())
            }
            Err(e) => {
                log::error!("reload of {} {:?} failed: {}", self.id, self.name, e);
                let old_dependencies = {
                    let mut state = self.state.lock();
                    state.loaded = false;
                    std::mem::take(&mut state.dependencies)
                };

                self.release_dependencies(old_dependencies);
                self.release_dependencies(new_dependencies);
                Err(e)
            }
        }
    }

    fn release_dependencies(
        &self,
        dependencies: Vec<ResourceHandle>,
    ) {
        self.notify_released(decrement_dependencies(dependencies));
    }

    fn notify_released(
        &self,
        released: Vec<ResourceHandle>,
    ) {
        for dependency in released {
            self.release_notifier.resource_released(dependency);
        }
    }

    fn notify_reload_watchers(&self) {
        // Collect first so watchers can touch this resource without deadlocking on the list
        let watchers: Vec<Arc<dyn ReloadWatcher>> = {
            let mut reload_watchers = self.reload_watchers.lock();
            reload_watchers.retain(|watcher| watcher.strong_count() > 0);
            reload_watchers
                .iter()
                .filter_map(|watcher| watcher.upgrade())
                .collect()
        };

        for watcher in watchers {
            watcher.resource_reloaded(self);
        }
    }
}

// Drops one user from each dependency, returning the ones nobody uses anymore
fn decrement_dependencies(dependencies: Vec<ResourceHandle>) -> Vec<ResourceHandle> {
    let mut released = Vec::default();
    for dependency in dependencies {
        if dependency.decrement() {
            released.push(dependency);
        }
    }

    released
}

impl std::fmt::Debug for Resource {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Resource")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("loaded", &state.loaded)
            .field("users", &state.users)
            .field("dependencies", &state.dependencies.len())
            .finish()
    }
}

/// Passed to `ResourceKind::load_impl`/`reload_impl`. Collects the dependencies the kind
/// discovers while loading.
pub struct LoadContext<'a> {
    resource: &'a Resource,
    dependencies: Vec<ResourceHandle>,
}

impl<'a> LoadContext<'a> {
    fn new(resource: &'a Resource) -> Self {
        LoadContext {
            resource,
            dependencies: Vec::default(),
        }
    }

    /// Look up (or create) the named resource, take a reference on it and load it now if needed.
    /// The reference is held until the resource being loaded is unloaded.
    pub fn add_dependency(
        &mut self,
        name: &str,
    ) -> ResourceResult<ResourceHandle> {
        let registry = self.registry()?;
        let dependency = registry.get_or_make(name)?;
        self.add_dependency_handle(dependency.clone())?;
        Ok(dependency)
    }

    pub fn add_dependency_handle(
        &mut self,
        dependency: ResourceHandle,
    ) -> ResourceResult<()> {
        assert!(
            !std::ptr::eq(Arc::as_ptr(&dependency), self.resource),
            "Resource {:?} cannot depend on itself",
            self.resource.name
        );

        log::trace!(
            "{:?} depends on {:?}",
            self.resource.name,
            dependency.name()
        );

        dependency.increment();
        if let Err(e) = dependency.load_if_unloaded() {
            if dependency.decrement() {
                self.resource.release_notifier.resource_released(dependency);
            }
            return Err(e);
        }

        self.dependencies.push(dependency);
        Ok(())
    }

    fn registry(&self) -> ResourceResult<ResourceRegistry> {
        ResourceRegistry::upgrade(&self.resource.registry).ok_or_else(|| {
            ResourceError::StringError(format!(
                "Registry was torn down while loading {:?}",
                self.resource.name
            ))
        })
    }

    fn into_dependencies(self) -> Vec<ResourceHandle> {
        self.dependencies
    }
}
