use crate::loader::ReleaseNotifier;
use crate::resource::{Resource, ResourceHandle, ResourceInfo, ResourceKind};
use crate::{ResourceError, ResourceResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};

/// Builds the kind for a newly referenced resource. Called with the resource name and the suffix
/// that matched. Must not call back into the registry.
pub type ResourceFactory = Box<dyn Fn(&str, &str) -> Box<dyn ResourceKind> + Send + Sync>;

struct RegisteredKind {
    // Lowercase, always starts with '.'
    suffix: String,
    factory: ResourceFactory,
}

pub(crate) struct RegistryInner {
    resources: DashMap<String, ResourceHandle>,
    // Sorted longest suffix first so compound suffixes (".envcube.tiff") win over plain ones
    kinds: RwLock<Vec<RegisteredKind>>,
    release_notifier: ReleaseNotifier,
}

/// Maps resource names to the single `Resource` instance for that name, creating resources on
/// first reference. Cloning is cheap, all clones share the same map.
///
/// The registry never unloads anything. Whether a resource's data stays in memory is decided by
/// its user count and the eviction queues.
#[derive(Clone)]
pub struct ResourceRegistry {
    inner: Arc<RegistryInner>,
}

fn normalize_suffix(suffix: &str) -> String {
    let suffix = suffix.to_ascii_lowercase();
    if suffix.starts_with('.') {
        suffix
    } else {
        format!(".{}", suffix)
    }
}

// The part of the name after the last path separator
fn file_name(name: &str) -> &str {
    name.rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(name)
}

impl ResourceRegistry {
    pub(crate) fn new(release_notifier: ReleaseNotifier) -> Self {
        ResourceRegistry {
            inner: Arc::new(RegistryInner {
                resources: DashMap::default(),
                kinds: RwLock::default(),
                release_notifier,
            }),
        }
    }

    pub(crate) fn upgrade(weak: &Weak<RegistryInner>) -> Option<Self> {
        weak.upgrade().map(|inner| ResourceRegistry { inner })
    }

    /// Register a factory for names ending in `suffix` (with or without the leading '.').
    /// Matching is case-insensitive and the longest matching suffix wins.
    pub fn register_kind<F>(
        &self,
        suffix: &str,
        factory: F,
    ) where
        F: Fn(&str, &str) -> Box<dyn ResourceKind> + Send + Sync + 'static,
    {
        let suffix = normalize_suffix(suffix);
        let mut kinds = self.inner.kinds.write();
        if let Some(index) = kinds.iter().position(|kind| kind.suffix == suffix) {
            log::warn!("Replacing resource kind registered for {:?}", suffix);
            kinds.remove(index);
        }

        log::debug!("Registered resource kind for {:?}", suffix);
        kinds.push(RegisteredKind {
            suffix,
            factory: Box::new(factory),
        });
        kinds.sort_by(|a, b| b.suffix.len().cmp(&a.suffix.len()));
    }

    pub fn registered_suffixes(&self) -> Vec<String> {
        self.inner
            .kinds
            .read()
            .iter()
            .map(|kind| kind.suffix.clone())
            .collect()
    }

    /// Returns the resource with this name, creating it (unloaded, no users) if this is the first
    /// time it has been referenced.
    pub fn get_or_make(
        &self,
        name: &str,
    ) -> ResourceResult<ResourceHandle> {
        if let Some(resource) = self.inner.resources.get(name) {
            return Ok(resource.clone());
        }

        let file_name = file_name(name);
        match file_name.rfind('.') {
            Some(index) if index + 1 < file_name.len() => {}
            _ => return Err(ResourceError::MissingExtension(name.to_string())),
        }

        let lowercase_file_name = file_name.to_ascii_lowercase();
        let kinds = self.inner.kinds.read();
        let kind = kinds
            .iter()
            .find(|kind| lowercase_file_name.ends_with(&kind.suffix))
            .ok_or_else(|| ResourceError::UnrecognizedResourceKind(name.to_string()))?;

        // Another thread may have made it since the lookup above, the entry decides who wins
        let resource = match self.inner.resources.entry(name.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let resource_kind = (kind.factory)(name, &kind.suffix);
                let resource = Arc::new(Resource::new(
                    name.to_string(),
                    resource_kind,
                    Arc::downgrade(&self.inner),
                    self.inner.release_notifier.clone(),
                ));

                log::debug!(
                    "Created resource {} {:?} as {:?}",
                    resource.id(),
                    name,
                    kind.suffix
                );
                entry.insert(resource.clone());
                resource
            }
        };

        Ok(resource)
    }

    pub fn get(
        &self,
        name: &str,
    ) -> Option<ResourceHandle> {
        self.inner
            .resources
            .get(name)
            .map(|resource| resource.clone())
    }

    pub fn has(
        &self,
        name: &str,
    ) -> bool {
        self.inner.resources.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.resources.is_empty()
    }

    pub fn all(&self) -> Vec<ResourceHandle> {
        self.inner
            .resources
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn all_loaded(&self) -> Vec<ResourceHandle> {
        self.inner
            .resources
            .iter()
            .filter(|entry| entry.value().is_loaded())
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn loaded_count(&self) -> usize {
        self.inner
            .resources
            .iter()
            .filter(|entry| entry.value().is_loaded())
            .count()
    }

    /// Diagnostic snapshot of every resource, ordered by creation
    pub fn resource_infos(&self) -> Vec<ResourceInfo> {
        let mut infos: Vec<_> = self
            .inner
            .resources
            .iter()
            .map(|entry| entry.value().info())
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resource::LoadContext;

    struct NullKind;

    impl ResourceKind for NullKind {
        fn load_impl(
            &mut self,
            _ctx: &mut LoadContext,
        ) -> ResourceResult<()> {
            Ok(())
        }

        fn unload_impl(&mut self) {}
    }

    fn registry_with_kinds() -> (ResourceRegistry, Arc<parking_lot::Mutex<Vec<String>>>) {
        let (command_tx, _command_rx) = crossbeam_channel::unbounded();
        let registry = ResourceRegistry::new(ReleaseNotifier::new(command_tx));
        let matched = Arc::new(parking_lot::Mutex::new(Vec::default()));

        for suffix in ["tiff", ".envcube.tiff", ".MESH"] {
            let matched = matched.clone();
            registry.register_kind(suffix, move |_name, suffix| {
                matched.lock().push(suffix.to_string());
                Box::new(NullKind)
            });
        }

        (registry, matched)
    }

    #[test]
    fn get_or_make_returns_the_same_instance() {
        let (registry, _) = registry_with_kinds();
        let a = registry.get_or_make("textures/rock.tiff").unwrap();
        let b = registry.get_or_make("textures/rock.tiff").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert!(registry.has("textures/rock.tiff"));
        assert!(Arc::ptr_eq(&registry.get("textures/rock.tiff").unwrap(), &a));
        assert!(registry.get("textures/other.tiff").is_none());
    }

    #[test]
    fn compound_suffix_wins_over_plain_suffix() {
        let (registry, matched) = registry_with_kinds();
        registry.get_or_make("sky/day.envcube.tiff").unwrap();
        registry.get_or_make("sky/day.tiff").unwrap();
        registry.get_or_make("Props/Barrel.Mesh").unwrap();
        assert_eq!(
            *matched.lock(),
            vec![
                ".envcube.tiff".to_string(),
                ".tiff".to_string(),
                ".mesh".to_string()
            ]
        );
    }

    #[test]
    fn bad_names_are_rejected() {
        let (registry, _) = registry_with_kinds();
        assert!(matches!(
            registry.get_or_make("no_extension"),
            Err(ResourceError::MissingExtension(_))
        ));
        assert!(matches!(
            registry.get_or_make("some.dir/no_extension"),
            Err(ResourceError::MissingExtension(_))
        ));
        assert!(matches!(
            registry.get_or_make("trailing."),
            Err(ResourceError::MissingExtension(_))
        ));
        assert!(matches!(
            registry.get_or_make("sound.ogg"),
            Err(ResourceError::UnrecognizedResourceKind(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn enumeration_reflects_loaded_state() {
        let (registry, _) = registry_with_kinds();
        let a = registry.get_or_make("a.mesh").unwrap();
        registry.get_or_make("b.mesh").unwrap();
        a.load().unwrap();

        assert_eq!(registry.all().len(), 2);
        assert_eq!(registry.loaded_count(), 1);
        assert!(Arc::ptr_eq(&registry.all_loaded()[0], &a));

        let infos = registry.resource_infos();
        assert_eq!(infos[0].name, "a.mesh");
        assert!(infos[0].loaded);
        assert_eq!(infos[1].name, "b.mesh");
        assert!(!infos[1].loaded);
    }
}
