use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique ID allocated when a resource is first created by the registry. Stable for the
/// resource's lifetime, and used to key eviction queues and log output.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u64);

/// Process-unique ID allocated when a demand is created. The background loader tracks pending
/// demands by this ID rather than by address.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, PartialOrd, Ord)]
pub struct DemandId(pub u64);

// Both allocators start at 1, 0 never names anything
static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_DEMAND_ID: AtomicU64 = AtomicU64::new(1);

impl ResourceId {
    pub fn allocate() -> Self {
        ResourceId(NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl DemandId {
    pub fn allocate() -> Self {
        DemandId(NEXT_DEMAND_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

impl std::fmt::Display for DemandId {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "d{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocated_ids_are_unique_and_never_null() {
        let a = ResourceId::allocate();
        let b = ResourceId::allocate();
        assert_ne!(a, b);
        assert_ne!(a.0, 0);
        assert_ne!(b.0, 0);

        let d = DemandId::allocate();
        assert_ne!(d.0, 0);
        assert_eq!(format!("{}", ResourceId(7)), "r7");
    }
}
