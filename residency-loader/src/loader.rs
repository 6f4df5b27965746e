use crate::demand::DemandShared;
use crate::resource::ResourceHandle;
use crate::CacheConfiguration;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use residency_base::hashing::HashMap;
use residency_base::{DemandId, EvictionQueue, MemoryBudget, MemoryDomain, ResourceId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

//
// The background loader owns one worker thread. All scheduling state (the pending demands, the
// demand being serviced, the allowance, both eviction queues and the orphan list) lives on that
// thread. Everything else talks to it through the command channel:
//
// consumer (Demand) ---Add/Remove---> [command channel] ---> worker: pick nearest, load, retire
// Resource unload   ---Released--->                          worker: push onto death row(s)
// application       ---SetAllowance/CheckMemory/ReconcileOrphans--->
//
// Whether a demand is still queued, its error flag and its distance are shared atomics so the
// consumer can poll them without a round trip.
//

pub(crate) enum LoaderCommand {
    // A demand was registered and wants its unloaded resources loaded
    Add(PendingDemand),
    // A demand was retracted by its consumer
    Remove(DemandId),
    SetAllowance(f32),
    // A resource's user count dropped to zero, it may now be evicted
    Released(ResourceHandle),
    CheckMemory,
    ReconcileOrphans,
    // Acknowledged once every command sent before it has been handled
    Sync(Sender<()>),
    Shutdown,
}

pub(crate) struct PendingDemand {
    pub(crate) shared: Arc<DemandShared>,
    // Identifies this particular registration of the demand
    pub(crate) ticket: u64,
    pub(crate) resources: Vec<ResourceHandle>,
}

/// Lets resources report that a dependency they released has no users left
#[derive(Clone)]
pub(crate) struct ReleaseNotifier {
    command_tx: Sender<LoaderCommand>,
}

impl ReleaseNotifier {
    pub(crate) fn new(command_tx: Sender<LoaderCommand>) -> Self {
        ReleaseNotifier { command_tx }
    }

    pub(crate) fn resource_released(
        &self,
        resource: ResourceHandle,
    ) {
        log::trace!(
            "resource {} {:?} has no users",
            resource.id(),
            resource.name()
        );
        // Only fails during shutdown, when nothing will be evicted anymore
        let _ = self.command_tx.send(LoaderCommand::Released(resource));
    }
}

/// Snapshot of the worker's state, published by the worker between iterations
#[derive(Debug, Clone, Default)]
pub struct LoaderStatus {
    pub allowance: f32,
    pub pending_demands: usize,
    pub host_death_row: usize,
    pub gpu_death_row: usize,
    pub orphans: usize,
    pub loads_completed: u64,
    pub load_failures: u64,
    pub evictions: u64,
    // Load errors on demands that were retracted before they could be told about it
    pub orphaned_errors: u64,
}

/// Raising the allowance always helps, lowering it never drives it below the delta just supplied.
pub fn replenish_allowance(
    allowance: f32,
    delta: f32,
) -> f32 {
    (allowance + delta).max(delta)
}

pub struct BackgroundLoader {
    command_tx: Sender<LoaderCommand>,
    status: Arc<Mutex<LoaderStatus>>,
    // 0 means "not queued" so tickets start at 1
    next_ticket: AtomicU64,
    join_handle: Option<JoinHandle<()>>,
}

impl BackgroundLoader {
    pub(crate) fn new(
        config: &CacheConfiguration,
        command_tx: Sender<LoaderCommand>,
        command_rx: Receiver<LoaderCommand>,
        host_budget: Arc<dyn MemoryBudget>,
        gpu_budget: Arc<dyn MemoryBudget>,
    ) -> std::io::Result<Self> {
        let status = Arc::new(Mutex::new(LoaderStatus {
            allowance: config.initial_allowance,
            ..Default::default()
        }));

        let worker = LoaderWorker {
            command_rx,
            pending: HashMap::default(),
            current: None,
            in_flight: None,
            allowance: config.initial_allowance,
            death_row_host: EvictionQueue::new(),
            death_row_gpu: EvictionQueue::new(),
            host_budget,
            gpu_budget,
            orphans: Vec::default(),
            status: status.clone(),
            loads_completed: 0,
            load_failures: 0,
            evictions: 0,
            orphaned_errors: 0,
        };

        let thread_name = config.worker_thread_name.clone();
        let join_handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                profiling::register_thread!(&thread_name);
                worker.run();
            })?;

        Ok(BackgroundLoader {
            command_tx,
            status,
            next_ticket: AtomicU64::new(1),
            join_handle: Some(join_handle),
        })
    }

    fn send(
        &self,
        command: LoaderCommand,
    ) {
        if self.command_tx.send(command).is_err() {
            log::error!("Background loader worker is gone, command dropped");
        }
    }

    // Marks the demand queued under a fresh ticket and hands its resource list to the worker
    pub(crate) fn add(
        &self,
        shared: &Arc<DemandShared>,
        resources: Vec<ResourceHandle>,
    ) {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        shared.begin_ticket(ticket);

        log::trace!(
            "add demand {} ticket {} distance {} ({} resources)",
            shared.id,
            ticket,
            shared.distance(),
            resources.len()
        );

        self.send(LoaderCommand::Add(PendingDemand {
            shared: shared.clone(),
            ticket,
            resources,
        }));
    }

    // No-op if the demand isn't queued
    pub(crate) fn remove(
        &self,
        shared: &DemandShared,
    ) {
        if let Some(ticket) = shared.cancel_ticket() {
            log::trace!("remove demand {} ticket {}", shared.id, ticket);
            self.send(LoaderCommand::Remove(shared.id));
        }
    }

    pub(crate) fn resource_released(
        &self,
        resource: ResourceHandle,
    ) {
        self.send(LoaderCommand::Released(resource));
    }

    /// `allowance = max(allowance + delta, delta)`, then wake the worker. Typically called once
    /// per frame with the number of loads the application can afford.
    pub fn set_allowance(
        &self,
        delta: f32,
    ) {
        self.send(LoaderCommand::SetAllowance(delta));
    }

    /// Evict unused resources until host and GPU usage are under budget (or nothing evictable is
    /// left). Runs on the worker.
    pub fn check_ram(&self) {
        self.send(LoaderCommand::CheckMemory);
    }

    /// Route resources that were loaded for retracted demands to eviction. Call at a convenient
    /// point, for example once per frame.
    pub fn reconcile_orphans(&self) {
        self.send(LoaderCommand::ReconcileOrphans);
    }

    /// Blocks until the worker has handled every command sent before this call. For tooling and
    /// tests, this can wait on a long-running load.
    pub fn sync(&self) {
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        if self.command_tx.send(LoaderCommand::Sync(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    pub fn status(&self) -> LoaderStatus {
        self.status.lock().clone()
    }
}

impl Drop for BackgroundLoader {
    fn drop(&mut self) {
        let _ = self.command_tx.send(LoaderCommand::Shutdown);
        if let Some(join_handle) = self.join_handle.take() {
            if join_handle.join().is_err() {
                log::error!("Background loader worker panicked");
            }
        }
    }
}

// The demand serviced by the previous iteration, retired at the start of the next one
struct InFlightDemand {
    id: DemandId,
    ticket: u64,
    shared: Arc<DemandShared>,
    // Resources this iteration actually loaded, as opposed to ones that were already loaded
    loaded: Vec<ResourceHandle>,
    caused_error: bool,
}

struct LoaderWorker {
    command_rx: Receiver<LoaderCommand>,

    pending: HashMap<DemandId, PendingDemand>,
    // Cleared if the demand is retracted while it is being serviced
    current: Option<DemandId>,
    in_flight: Option<InFlightDemand>,

    allowance: f32,

    // Resources that had no users when they were submitted, oldest first. GPU-backed resources
    // are in both.
    death_row_host: EvictionQueue<ResourceId, ResourceHandle>,
    death_row_gpu: EvictionQueue<ResourceId, ResourceHandle>,
    host_budget: Arc<dyn MemoryBudget>,
    gpu_budget: Arc<dyn MemoryBudget>,

    // Loaded on behalf of a demand that was retracted mid-flight
    orphans: Vec<ResourceHandle>,

    status: Arc<Mutex<LoaderStatus>>,
    loads_completed: u64,
    load_failures: u64,
    evictions: u64,
    orphaned_errors: u64,
}

impl LoaderWorker {
    fn run(mut self) {
        log::debug!("background loader started");
        loop {
            while let Ok(command) = self.command_rx.try_recv() {
                if !self.handle_command(command) {
                    log::debug!("background loader shutting down");
                    return;
                }
            }

            self.retire_in_flight();
            self.publish_status();

            if self.allowance <= 0.0 || self.pending.is_empty() {
                // Nothing to do until a command changes that
                match self.command_rx.recv() {
                    Ok(command) => {
                        if !self.handle_command(command) {
                            log::debug!("background loader shutting down");
                            return;
                        }
                    }
                    Err(_) => return,
                }
                continue;
            }

            self.check_ram();

            if let Some(pending) = self.select_nearest() {
                let in_flight = self.service(pending);
                self.in_flight = Some(in_flight);
            }
        }
    }

    // Returns false when the worker should stop
    fn handle_command(
        &mut self,
        command: LoaderCommand,
    ) -> bool {
        match command {
            LoaderCommand::Add(pending) => {
                let id = pending.shared.id;
                self.pending.insert(id, pending);
            }
            LoaderCommand::Remove(id) => {
                self.pending.remove(&id);
                if self.current == Some(id) {
                    log::debug!("demand {} retracted while being serviced", id);
                    self.current = None;
                }
            }
            LoaderCommand::SetAllowance(delta) => {
                self.allowance = replenish_allowance(self.allowance, delta);
                log::trace!("allowance is now {}", self.allowance);
            }
            LoaderCommand::Released(resource) => self.submit_for_eviction(resource),
            LoaderCommand::CheckMemory => self.check_ram(),
            LoaderCommand::ReconcileOrphans => self.reconcile_orphans(),
            LoaderCommand::Sync(ack_tx) => {
                // Anything serviced before the sync was sent is retired before acknowledging
                self.retire_in_flight();
                self.publish_status();
                let _ = ack_tx.send(());
            }
            LoaderCommand::Shutdown => return false,
        }

        true
    }

    fn retire_in_flight(&mut self) {
        let in_flight = match self.in_flight.take() {
            Some(in_flight) => in_flight,
            None => return,
        };

        if self.current == Some(in_flight.id) {
            self.current = None;

            if self
                .pending
                .get(&in_flight.id)
                .map_or(false, |pending| pending.ticket == in_flight.ticket)
            {
                self.pending.remove(&in_flight.id);
            }

            // Fails if the consumer retracted and resubmitted after the last drain. The error
            // belongs to the old registration and must not leak into the new one.
            if !in_flight
                .shared
                .finish_ticket(in_flight.ticket, in_flight.caused_error)
                && in_flight.caused_error
            {
                log::warn!(
                    "dropping load error for demand {}, it was resubmitted before the load finished",
                    in_flight.id
                );
                self.orphaned_errors += 1;
            }

            log::debug!(
                "demand {} serviced, {} loads{}",
                in_flight.id,
                in_flight.loaded.len(),
                if in_flight.caused_error {
                    " with errors"
                } else {
                    ""
                }
            );
        } else {
            // The consumer let go while we were loading. Whatever we loaded is nobody's yet.
            if in_flight.caused_error {
                log::warn!(
                    "dropping load error for demand {}, it was retracted before the load finished",
                    in_flight.id
                );
                self.orphaned_errors += 1;
            }

            for resource in in_flight.loaded {
                log::debug!(
                    "resource {} {:?} orphaned by demand {}",
                    resource.id(),
                    resource.name(),
                    in_flight.id
                );
                self.orphans.push(resource);
            }
        }
    }

    // Nearest first, ties go to whichever is found first
    fn select_nearest(&mut self) -> Option<PendingDemand> {
        let mut nearest: Option<(DemandId, f32)> = None;
        for (id, pending) in &self.pending {
            let distance = pending.shared.distance();
            if nearest.map_or(true, |(_, nearest_distance)| distance < nearest_distance) {
                nearest = Some((*id, distance));
            }
        }

        let (id, _) = nearest?;
        self.pending.get(&id).map(|pending| PendingDemand {
            shared: pending.shared.clone(),
            ticket: pending.ticket,
            resources: pending.resources.clone(),
        })
    }

    #[profiling::function]
    fn service(
        &mut self,
        pending: PendingDemand,
    ) -> InFlightDemand {
        let id = pending.shared.id;
        self.current = Some(id);
        log::debug!(
            "servicing demand {} at distance {} ({} resources, allowance {})",
            id,
            pending.shared.distance(),
            pending.resources.len(),
            self.allowance
        );

        let mut in_flight = InFlightDemand {
            id,
            ticket: pending.ticket,
            shared: pending.shared,
            loaded: Vec::default(),
            caused_error: false,
        };

        // One bad resource doesn't stop the rest of the demand from loading
        for resource in pending.resources {
            match resource.load_if_unloaded() {
                Ok(true) => {
                    self.allowance -= 1.0;
                    self.loads_completed += 1;
                    in_flight.loaded.push(resource);
                }
                Ok(false) => {}
                Err(e) => {
                    log::error!(
                        "Failed to load {} {:?} for demand {}: {}",
                        resource.id(),
                        resource.name(),
                        id,
                        e
                    );
                    self.load_failures += 1;
                    in_flight.caused_error = true;
                }
            }
        }

        self.publish_status();
        in_flight
    }

    fn submit_for_eviction(
        &mut self,
        resource: ResourceHandle,
    ) {
        push_to_death_rows(resource, &mut self.death_row_host, &mut self.death_row_gpu);
    }

    fn reconcile_orphans(&mut self) {
        let orphans = std::mem::take(&mut self.orphans);
        for resource in orphans {
            if resource.users() == 0 && resource.is_loaded() {
                self.submit_for_eviction(resource);
            } else {
                log::trace!(
                    "orphan {} {:?} was reclaimed or already unloaded",
                    resource.id(),
                    resource.name()
                );
            }
        }
    }

    fn check_ram(&mut self) {
        self.evictions += evict_until_under_budget(
            MemoryDomain::Host,
            &*self.host_budget,
            &mut self.death_row_host,
            &mut self.death_row_gpu,
        );
        self.evictions += evict_until_under_budget(
            MemoryDomain::Gpu,
            &*self.gpu_budget,
            &mut self.death_row_host,
            &mut self.death_row_gpu,
        );
    }

    fn publish_status(&self) {
        *self.status.lock() = LoaderStatus {
            allowance: self.allowance,
            pending_demands: self.pending.len(),
            host_death_row: self.death_row_host.len(),
            gpu_death_row: self.death_row_gpu.len(),
            orphans: self.orphans.len(),
            loads_completed: self.loads_completed,
            load_failures: self.load_failures,
            evictions: self.evictions,
            orphaned_errors: self.orphaned_errors,
        };
    }
}

fn push_to_death_rows(
    resource: ResourceHandle,
    death_row_host: &mut EvictionQueue<ResourceId, ResourceHandle>,
    death_row_gpu: &mut EvictionQueue<ResourceId, ResourceHandle>,
) {
    for domain in resource.memory_domains() {
        match domain {
            MemoryDomain::Host => death_row_host.push(resource.id(), resource.clone()),
            MemoryDomain::Gpu => death_row_gpu.push(resource.id(), resource.clone()),
        }
    }
}

// Pops the least recently freed candidates from the domain's queue until the budget is met. A
// candidate may have been reclaimed (or already unloaded) since it was queued, in which case it is
// just dropped from the queue. Dependencies an eviction leaves unused are queued right away so the
// same pass can evict them too.
#[profiling::function]
fn evict_until_under_budget(
    domain: MemoryDomain,
    budget: &dyn MemoryBudget,
    death_row_host: &mut EvictionQueue<ResourceId, ResourceHandle>,
    death_row_gpu: &mut EvictionQueue<ResourceId, ResourceHandle>,
) -> u64 {
    let mut evicted = 0;
    while budget.is_over_budget() {
        let candidate = match domain {
            MemoryDomain::Host => death_row_host.pop_oldest(),
            MemoryDomain::Gpu => death_row_gpu.pop_oldest(),
        };

        let (id, resource) = match candidate {
            Some(candidate) => candidate,
            None => break,
        };

        match resource.try_evict() {
            Some(released) => {
                log::debug!(
                    "evicted {} {:?} ({} ram {} / {})",
                    id,
                    resource.name(),
                    domain.name(),
                    budget.used_bytes(),
                    budget.budget_bytes()
                );
                death_row_host.remove(&id);
                death_row_gpu.remove(&id);
                evicted += 1;

                for dependency in released {
                    log::trace!(
                        "{} {:?} unused after evicting {}",
                        dependency.id(),
                        dependency.name(),
                        id
                    );
                    push_to_death_rows(dependency, death_row_host, death_row_gpu);
                }
            }
            None => {
                log::trace!(
                    "skipped eviction of {} {:?}, in use or not loaded",
                    id,
                    resource.name()
                );
            }
        }
    }

    evicted
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allowance_clamp() {
        assert_eq!(replenish_allowance(2.0, 3.0), 5.0);
        assert_eq!(replenish_allowance(5.0, -10.0), -5.0);
        assert_eq!(replenish_allowance(5.0, -100.0), -95.0);
        // Deep in debt, a positive delta still makes progress possible
        assert_eq!(replenish_allowance(-50.0, 2.0), 2.0);
    }
}
