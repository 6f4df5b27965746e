use crate::resource::ResourceHandle;
use crate::{ResourceCache, ResourceResult};
use parking_lot::Mutex;
use residency_base::DemandId;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

struct TicketState {
    // Ticket of the registration currently queued, or 0 if not queued
    queued_ticket: u64,
    caused_error: bool,
}

// The part of a demand the background loader can see. The worker never touches the demand's
// resource list directly, it gets a copy with each registration.
pub(crate) struct DemandShared {
    pub(crate) id: DemandId,
    // The queued ticket and the error flag change together so a stale service pass can't set the
    // error on a newer registration
    tickets: Mutex<TicketState>,
    distance_bits: AtomicU32,
}

impl DemandShared {
    fn new() -> Self {
        DemandShared {
            id: DemandId::allocate(),
            tickets: Mutex::new(TicketState {
                queued_ticket: 0,
                caused_error: false,
            }),
            distance_bits: AtomicU32::new(f32::INFINITY.to_bits()),
        }
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.tickets.lock().queued_ticket != 0
    }

    pub(crate) fn distance(&self) -> f32 {
        f32::from_bits(self.distance_bits.load(Ordering::Relaxed))
    }

    // NaN would never compare as nearest (or as anything), treat it as infinitely far away
    pub(crate) fn set_distance(
        &self,
        distance: f32,
    ) {
        let distance = if distance.is_nan() {
            f32::INFINITY
        } else {
            distance
        };
        self.distance_bits
            .store(distance.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn caused_error(&self) -> bool {
        self.tickets.lock().caused_error
    }

    // Only used by the immediate (calling thread) paths
    pub(crate) fn set_caused_error(
        &self,
        caused_error: bool,
    ) {
        self.tickets.lock().caused_error = caused_error;
    }

    pub(crate) fn begin_ticket(
        &self,
        ticket: u64,
    ) {
        debug_assert_ne!(ticket, 0);
        let mut tickets = self.tickets.lock();
        tickets.caused_error = false;
        tickets.queued_ticket = ticket;
    }

    // Returns the ticket that was queued, if any
    pub(crate) fn cancel_ticket(&self) -> Option<u64> {
        let mut tickets = self.tickets.lock();
        match std::mem::take(&mut tickets.queued_ticket) {
            0 => None,
            ticket => Some(ticket),
        }
    }

    // Marks the demand satisfied and records the outcome, but only if this ticket is still the
    // queued one. Returns false (and changes nothing) if the demand was retracted or resubmitted
    // in the meantime.
    pub(crate) fn finish_ticket(
        &self,
        ticket: u64,
        caused_error: bool,
    ) -> bool {
        let mut tickets = self.tickets.lock();
        if tickets.queued_ticket != ticket {
            return false;
        }

        tickets.queued_ticket = 0;
        tickets.caused_error = caused_error;
        true
    }
}

/// A consumer's handle on the set of resources it currently needs.
///
/// Build it up with `add_resource`, then call `request_load` with the distance to the viewer (any
/// monotonic priority works, nearer is loaded first). Poll `is_in_background_queue` until it
/// returns false, at which point every resource is loaded unless `caused_error` is set. Call
/// `finished_with` (or drop the demand) when the resources are no longer needed.
pub struct Demand {
    cache: ResourceCache,
    shared: Arc<DemandShared>,
    resources: Vec<ResourceHandle>,
    // True while this demand holds a user count on each of its resources
    incremented: bool,
}

impl Demand {
    pub fn new(cache: &ResourceCache) -> Self {
        Demand {
            cache: cache.clone(),
            shared: Arc::new(DemandShared::new()),
            resources: Vec::default(),
            incremented: false,
        }
    }

    pub fn id(&self) -> DemandId {
        self.shared.id
    }

    /// Look up (or create) the named resource and add it to this demand
    pub fn add_resource(
        &mut self,
        name: &str,
    ) -> ResourceResult<ResourceHandle> {
        let resource = self.cache.registry().get_or_make(name)?;
        self.add_resource_handle(resource.clone());
        Ok(resource)
    }

    /// Adding a resource that is already part of this demand does nothing
    pub fn add_resource_handle(
        &mut self,
        resource: ResourceHandle,
    ) {
        if self
            .resources
            .iter()
            .any(|existing| Arc::ptr_eq(existing, &resource))
        {
            return;
        }

        // Keep the user counts balanced for the eventual finished_with()
        if self.incremented {
            resource.increment();
        }

        self.resources.push(resource);
    }

    pub fn resources(&self) -> &[ResourceHandle] {
        &self.resources
    }

    pub fn distance(&self) -> f32 {
        self.shared.distance()
    }

    /// Returns false if the demand is already queued (the new distance is still applied), true
    /// otherwise. If every resource is already loaded the demand is satisfied immediately and is
    /// never queued.
    pub fn request_load(
        &mut self,
        distance: f32,
    ) -> bool {
        self.shared.set_distance(distance);

        if self.shared.is_queued() {
            return false;
        }

        self.increment_resources();

        if self.all_loaded() {
            return true;
        }

        let loader = self.cache.loader();
        if self.cache.host_budget().is_over_budget() || self.cache.gpu_budget().is_over_budget() {
            loader.check_ram();
        }

        loader.add(&self.shared, self.resources.clone());
        true
    }

    pub fn is_in_background_queue(&self) -> bool {
        self.shared.is_queued()
    }

    /// Set if any resource failed to load during the last background pass or immediate load
    pub fn caused_error(&self) -> bool {
        self.shared.caused_error()
    }

    pub fn all_loaded(&self) -> bool {
        self.resources.iter().all(|resource| resource.is_loaded())
    }

    /// Retract the demand from the background queue and release this demand's hold on its
    /// resources. Resources left with no users become candidates for eviction. Safe to call more
    /// than once.
    pub fn finished_with(&mut self) {
        let loader = self.cache.loader();
        loader.remove(&self.shared);

        if self.incremented {
            for resource in &self.resources {
                if resource.decrement() {
                    loader.resource_released(resource.clone());
                }
            }

            self.incremented = false;
        }
    }

    /// Load every resource on the calling thread, bypassing the background loader. Every resource
    /// is attempted even if an earlier one fails, the first error is returned.
    pub fn immediate_load(&mut self) -> ResourceResult<()> {
        profiling::scope!("Demand::immediate_load");
        self.increment_resources();
        self.shared.set_caused_error(false);

        let mut first_error = None;
        for resource in &self.resources {
            if let Err(e) = resource.load_if_unloaded() {
                log::error!(
                    "Immediate load of {} {:?} failed: {}",
                    resource.id(),
                    resource.name(),
                    e
                );
                first_error.get_or_insert(e);
            }
        }

        self.finish_immediate(first_error)
    }

    /// Reload every loaded resource (and load any that aren't) on the calling thread
    pub fn immediate_reload(&mut self) -> ResourceResult<()> {
        profiling::scope!("Demand::immediate_reload");
        self.increment_resources();
        self.shared.set_caused_error(false);

        let mut first_error = None;
        for resource in &self.resources {
            // We hold a user count, so nothing can evict it between the check and the reload
            let result = if resource.is_loaded() {
                resource.reload()
            } else {
                resource.load_if_unloaded().map(|_| ())
            };

            if let Err(e) = result {
                log::error!(
                    "Immediate reload of {} {:?} failed: {}",
                    resource.id(),
                    resource.name(),
                    e
                );
                first_error.get_or_insert(e);
            }
        }

        self.finish_immediate(first_error)
    }

    fn finish_immediate(
        &self,
        first_error: Option<crate::ResourceError>,
    ) -> ResourceResult<()> {
        match first_error {
            Some(e) => {
                self.shared.set_caused_error(true);
                Err(e)
            }
            None => Ok(()),
        }
    }

    fn increment_resources(&mut self) {
        if !self.incremented {
            for resource in &self.resources {
                resource.increment();
            }

            self.incremented = true;
        }
    }
}

impl Drop for Demand {
    fn drop(&mut self) {
        self.finished_with();
    }
}

impl std::fmt::Debug for Demand {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Demand")
            .field("id", &self.shared.id)
            .field("distance", &self.shared.distance())
            .field("queued", &self.shared.is_queued())
            .field("caused_error", &self.shared.caused_error())
            .field("resources", &self.resources.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stale_ticket_does_not_clear_a_resubmission() {
        let shared = DemandShared::new();
        shared.begin_ticket(1);
        assert_eq!(shared.cancel_ticket(), Some(1));
        assert_eq!(shared.cancel_ticket(), None);

        shared.begin_ticket(2);
        assert!(!shared.finish_ticket(1, false));
        assert!(shared.is_queued());
        assert!(shared.finish_ticket(2, false));
        assert!(!shared.is_queued());
    }

    #[test]
    fn stale_error_does_not_reach_a_resubmission() {
        let shared = DemandShared::new();
        shared.begin_ticket(1);

        // Retracted and resubmitted while the worker was still servicing ticket 1
        shared.cancel_ticket();
        shared.begin_ticket(2);
        assert!(!shared.finish_ticket(1, true));
        assert!(!shared.caused_error());
        assert!(shared.is_queued());

        assert!(shared.finish_ticket(2, false));
        assert!(!shared.caused_error());

        shared.begin_ticket(3);
        assert!(shared.finish_ticket(3, true));
        assert!(shared.caused_error());

        // A new registration starts clean
        shared.begin_ticket(4);
        assert!(!shared.caused_error());
    }

    #[test]
    fn nan_distance_sorts_last() {
        let shared = DemandShared::new();
        shared.set_distance(f32::NAN);
        assert_eq!(shared.distance(), f32::INFINITY);
        shared.set_distance(2.5);
        assert_eq!(shared.distance(), 2.5);
    }
}
