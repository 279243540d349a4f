//! HostScheduler — places instances onto hosts.
//!
//! Both placement paths run under a per-pool mutex held across the read of
//! current allocation counters and the write that commits the reservation,
//! so the check-then-commit is atomic per pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use deskplane_state::{
    Capacity, Host, HostId, PoolId, RentalMode, ResourceSpec, StateStore, VirtualMachine,
};

use crate::accountant;
use crate::error::{SchedulerError, SchedulerResult};

/// A committed placement decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub pool_id: PoolId,
    pub host_id: HostId,
    pub rental_mode: RentalMode,
    /// Set for shared placements; exclusive rentals have no VM record.
    pub virtual_machine_id: Option<String>,
}

/// The scheduler owns all Host and VirtualMachine mutations.
pub struct HostScheduler {
    store: StateStore,
    /// Per-pool serialization of check-then-commit sections.
    pool_locks: RwLock<HashMap<PoolId, Arc<Mutex<()>>>>,
}

impl HostScheduler {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            pool_locks: RwLock::new(HashMap::new()),
        }
    }

    /// Place an instance in a pool under the given rental mode.
    pub async fn place(
        &self,
        pool_id: &str,
        instance_id: &str,
        mode: RentalMode,
        spec: &ResourceSpec,
    ) -> SchedulerResult<Placement> {
        let lock = self.pool_lock(pool_id).await;
        let _guard = lock.lock().await;

        if self.store.get_pool(pool_id)?.is_none() {
            return Err(SchedulerError::PoolNotFound(pool_id.to_string()));
        }

        let request = Capacity::from_spec(spec);
        match mode {
            RentalMode::Exclusive => self.place_exclusive(pool_id, instance_id, &request),
            RentalMode::Shared => self.place_shared(pool_id, instance_id, &request),
        }
    }

    /// Release a previously-committed placement. For shared rentals the
    /// VM's recorded reservation is decremented and the record deleted;
    /// exclusive hosts are zeroed unconditionally.
    pub async fn release(&self, placement: &Placement) -> SchedulerResult<()> {
        let lock = self.pool_lock(&placement.pool_id).await;
        let _guard = lock.lock().await;

        match placement.rental_mode {
            RentalMode::Exclusive => self.release_exclusive(placement),
            RentalMode::Shared => self.release_shared(placement),
        }
    }

    // ── Exclusive rental ───────────────────────────────────────────

    /// Whole-host placement: among placeable EXCLUSIVE hosts with zero
    /// allocation, pick the lowest-allocated-cpu candidate (all zero, so
    /// effectively stable key order) whose full capacity covers the spec,
    /// and allocate the entire host.
    fn place_exclusive(
        &self,
        pool_id: &str,
        instance_id: &str,
        request: &Capacity,
    ) -> SchedulerResult<Placement> {
        let mut hosts = self.candidates(pool_id, RentalMode::Exclusive)?;
        hosts.retain(|h| h.allocated.is_zero());
        hosts.sort_by_key(|h| h.allocated.cpu_cores);

        for mut host in hosts {
            if !host.capacity.covers(request) {
                debug!(host = %host.id, "exclusive host too small, skipping");
                continue;
            }
            // Whole-host semantics: allocated flips from zero to total.
            host.allocated = host.capacity;
            self.store.put_host(&host)?;
            accountant::charge_allocated(&self.store, pool_id, &host.capacity)?;

            info!(
                pool = pool_id,
                host = %host.id,
                instance = instance_id,
                "exclusive host allocated"
            );
            return Ok(Placement {
                pool_id: pool_id.to_string(),
                host_id: host.id,
                rental_mode: RentalMode::Exclusive,
                virtual_machine_id: None,
            });
        }

        Err(self.exhausted(pool_id, RentalMode::Exclusive, request))
    }

    fn release_exclusive(&self, placement: &Placement) -> SchedulerResult<()> {
        let mut host = self
            .store
            .get_host(&placement.pool_id, &placement.host_id)?
            .ok_or_else(|| SchedulerError::HostNotFound(placement.host_id.clone()))?;

        // Exclusive hosts never share: zero the counters unconditionally.
        let released = host.allocated;
        host.allocated = Capacity::default();
        self.store.put_host(&host)?;
        accountant::release_allocated(&self.store, &placement.pool_id, &released)?;

        info!(pool = %placement.pool_id, host = %host.id, "exclusive host released");
        Ok(())
    }

    // ── Shared rental ──────────────────────────────────────────────

    /// First-fit bin-packing: scan placeable SHARED hosts in ascending
    /// allocated-cpu order and take the first one whose headroom covers
    /// the request. A lower-allocated host without headroom is skipped in
    /// favor of a later, fuller host that still fits.
    fn place_shared(
        &self,
        pool_id: &str,
        instance_id: &str,
        request: &Capacity,
    ) -> SchedulerResult<Placement> {
        let mut hosts = self.candidates(pool_id, RentalMode::Shared)?;
        hosts.sort_by_key(|h| h.allocated.cpu_cores);

        for mut host in hosts {
            if !host.free().covers(request) {
                debug!(host = %host.id, "insufficient headroom, skipping");
                continue;
            }

            let vm = VirtualMachine {
                id: uuid::Uuid::new_v4().to_string(),
                host_id: host.id.clone(),
                pool_id: pool_id.to_string(),
                instance_id: instance_id.to_string(),
                reservation: *request,
                created_at: epoch_secs(),
            };
            host.allocated.add(request);
            self.store.put_vm(&vm)?;
            self.store.put_host(&host)?;
            accountant::charge_allocated(&self.store, pool_id, request)?;

            info!(
                pool = pool_id,
                host = %host.id,
                vm = %vm.id,
                instance = instance_id,
                cpu = request.cpu_cores,
                memory_gb = request.memory_gb,
                "virtual machine placed"
            );
            return Ok(Placement {
                pool_id: pool_id.to_string(),
                host_id: host.id,
                rental_mode: RentalMode::Shared,
                virtual_machine_id: Some(vm.id),
            });
        }

        Err(self.exhausted(pool_id, RentalMode::Shared, request))
    }

    fn release_shared(&self, placement: &Placement) -> SchedulerResult<()> {
        let vm_id = placement
            .virtual_machine_id
            .as_deref()
            .ok_or_else(|| SchedulerError::VmNotFound("<missing binding>".to_string()))?;
        let vm = self
            .store
            .get_vm(vm_id)?
            .ok_or_else(|| SchedulerError::VmNotFound(vm_id.to_string()))?;
        let mut host = self
            .store
            .get_host(&placement.pool_id, &vm.host_id)?
            .ok_or_else(|| SchedulerError::HostNotFound(vm.host_id.clone()))?;

        host.allocated.sub(&vm.reservation);
        self.store.put_host(&host)?;
        self.store.delete_vm(&vm.id)?;
        accountant::release_allocated(&self.store, &placement.pool_id, &vm.reservation)?;

        info!(pool = %placement.pool_id, host = %host.id, vm = %vm.id, "virtual machine released");
        Ok(())
    }

    // ── Internal helpers ───────────────────────────────────────────

    /// Placeable hosts (ACTIVE or MAINTENANCE) of the given rental mode,
    /// in key order.
    fn candidates(&self, pool_id: &str, mode: RentalMode) -> SchedulerResult<Vec<Host>> {
        let hosts = self.store.list_hosts_in_pool(pool_id)?;
        Ok(hosts
            .into_iter()
            .filter(|h| h.is_placeable() && h.rental_mode == mode)
            .collect())
    }

    fn exhausted(&self, pool_id: &str, mode: RentalMode, request: &Capacity) -> SchedulerError {
        SchedulerError::Exhausted {
            pool_id: pool_id.to_string(),
            mode,
            cpu_cores: request.cpu_cores,
            memory_gb: request.memory_gb,
            storage_gb: request.storage_gb,
            gpu_count: request.gpu_count,
        }
    }

    async fn pool_lock(&self, pool_id: &str) -> Arc<Mutex<()>> {
        {
            let locks = self.pool_locks.read().await;
            if let Some(lock) = locks.get(pool_id) {
                return lock.clone();
            }
        }
        let mut locks = self.pool_locks.write().await;
        locks
            .entry(pool_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
