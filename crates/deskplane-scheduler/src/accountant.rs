//! Pool- and datacenter-level capacity accounting.
//!
//! Host counters are adjusted incrementally by the scheduler; the pool and
//! datacenter aggregates are adjusted incrementally here in the same
//! operation, and a periodic reconciliation pass recomputes them from the
//! member hosts, overwriting and logging any drift.

use tracing::{debug, info, warn};

use deskplane_state::{Capacity, EdgeDataCenter, Host, HostStatus, ResourcePool, StateStore};

use crate::error::{SchedulerError, SchedulerResult};

// ── Registration ──────────────────────────────────────────────────

/// Register an edge datacenter with empty aggregates.
pub fn register_datacenter(
    store: &StateStore,
    id: &str,
    name: &str,
) -> SchedulerResult<EdgeDataCenter> {
    let dc = EdgeDataCenter {
        id: id.to_string(),
        name: name.to_string(),
        capacity: Capacity::default(),
        allocated: Capacity::default(),
    };
    store.put_datacenter(&dc)?;
    info!(dc = id, name, "datacenter registered");
    Ok(dc)
}

/// Register a resource pool inside an existing datacenter.
pub fn register_pool(
    store: &StateStore,
    id: &str,
    datacenter_id: &str,
    name: &str,
    ip_pool_id: Option<String>,
) -> SchedulerResult<ResourcePool> {
    if store.get_datacenter(datacenter_id)?.is_none() {
        return Err(SchedulerError::DatacenterNotFound(datacenter_id.to_string()));
    }
    let pool = ResourcePool {
        id: id.to_string(),
        datacenter_id: datacenter_id.to_string(),
        name: name.to_string(),
        ip_pool_id,
        capacity: Capacity::default(),
        allocated: Capacity::default(),
    };
    store.put_pool(&pool)?;
    info!(pool = id, dc = datacenter_id, name, "resource pool registered");
    Ok(pool)
}

/// Register a host in an existing pool. Capacity is fixed here; the host
/// starts with zero allocation regardless of what the caller passed.
pub fn register_host(store: &StateStore, mut host: Host) -> SchedulerResult<Host> {
    let mut pool = store
        .get_pool(&host.pool_id)?
        .ok_or_else(|| SchedulerError::PoolNotFound(host.pool_id.clone()))?;

    host.allocated = Capacity::default();
    store.put_host(&host)?;

    pool.capacity.add(&host.capacity);
    store.put_pool(&pool)?;
    if let Some(mut dc) = store.get_datacenter(&pool.datacenter_id)? {
        dc.capacity.add(&host.capacity);
        store.put_datacenter(&dc)?;
    }

    info!(
        pool = %host.pool_id,
        host = %host.id,
        cpu = host.capacity.cpu_cores,
        memory_gb = host.capacity.memory_gb,
        "host registered"
    );
    Ok(host)
}

/// Change a host's operational status (ACTIVE / MAINTENANCE / OFFLINE).
pub fn set_host_status(
    store: &StateStore,
    pool_id: &str,
    host_id: &str,
    status: HostStatus,
) -> SchedulerResult<Host> {
    let mut host = store
        .get_host(pool_id, host_id)?
        .ok_or_else(|| SchedulerError::HostNotFound(host_id.to_string()))?;
    host.status = status;
    store.put_host(&host)?;
    info!(pool = pool_id, host = host_id, ?status, "host status changed");
    Ok(host)
}

// ── Incremental aggregates ────────────────────────────────────────

/// Add a committed reservation to the pool and datacenter aggregates.
pub(crate) fn charge_allocated(
    store: &StateStore,
    pool_id: &str,
    delta: &Capacity,
) -> SchedulerResult<()> {
    adjust_allocated(store, pool_id, delta, true)
}

/// Subtract a released reservation from the pool and datacenter aggregates.
pub(crate) fn release_allocated(
    store: &StateStore,
    pool_id: &str,
    delta: &Capacity,
) -> SchedulerResult<()> {
    adjust_allocated(store, pool_id, delta, false)
}

fn adjust_allocated(
    store: &StateStore,
    pool_id: &str,
    delta: &Capacity,
    add: bool,
) -> SchedulerResult<()> {
    let mut pool = store
        .get_pool(pool_id)?
        .ok_or_else(|| SchedulerError::PoolNotFound(pool_id.to_string()))?;
    if add {
        pool.allocated.add(delta);
    } else {
        pool.allocated.sub(delta);
    }
    store.put_pool(&pool)?;

    if let Some(mut dc) = store.get_datacenter(&pool.datacenter_id)? {
        if add {
            dc.allocated.add(delta);
        } else {
            dc.allocated.sub(delta);
        }
        store.put_datacenter(&dc)?;
    }
    Ok(())
}

// ── Reconciliation ────────────────────────────────────────────────

/// Result of reconciling one pool against its member hosts.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ReconcileReport {
    pub pool_id: String,
    pub capacity_drifted: bool,
    pub allocated_drifted: bool,
}

impl ReconcileReport {
    pub fn drifted(&self) -> bool {
        self.capacity_drifted || self.allocated_drifted
    }
}

/// Recompute a pool's aggregates from its member hosts' counters.
///
/// The host counters are the source of truth. Drift is overwritten and
/// logged; the owning datacenter is then recomputed from its pools.
pub fn reconcile_pool(store: &StateStore, pool_id: &str) -> SchedulerResult<ReconcileReport> {
    let mut pool = store
        .get_pool(pool_id)?
        .ok_or_else(|| SchedulerError::PoolNotFound(pool_id.to_string()))?;

    let mut capacity = Capacity::default();
    let mut allocated = Capacity::default();
    for host in store.list_hosts_in_pool(pool_id)? {
        capacity.add(&host.capacity);
        allocated.add(&host.allocated);
    }

    let report = ReconcileReport {
        pool_id: pool_id.to_string(),
        capacity_drifted: pool.capacity != capacity,
        allocated_drifted: pool.allocated != allocated,
    };

    if report.drifted() {
        warn!(
            pool = pool_id,
            stored_cpu = pool.allocated.cpu_cores,
            actual_cpu = allocated.cpu_cores,
            stored_mem = pool.allocated.memory_gb,
            actual_mem = allocated.memory_gb,
            "pool aggregates drifted from host counters, correcting"
        );
        pool.capacity = capacity;
        pool.allocated = allocated;
        store.put_pool(&pool)?;
    } else {
        debug!(pool = pool_id, "pool aggregates consistent");
    }

    reconcile_datacenter(store, &pool.datacenter_id)?;
    Ok(report)
}

/// Recompute a datacenter's aggregates from its member pools.
fn reconcile_datacenter(store: &StateStore, dc_id: &str) -> SchedulerResult<()> {
    let Some(mut dc) = store.get_datacenter(dc_id)? else {
        return Ok(());
    };

    let mut capacity = Capacity::default();
    let mut allocated = Capacity::default();
    for pool in store.list_pools()? {
        if pool.datacenter_id == dc_id {
            capacity.add(&pool.capacity);
            allocated.add(&pool.allocated);
        }
    }

    if dc.capacity != capacity || dc.allocated != allocated {
        warn!(dc = dc_id, "datacenter aggregates drifted, correcting");
        dc.capacity = capacity;
        dc.allocated = allocated;
        store.put_datacenter(&dc)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskplane_state::RentalMode;

    fn test_store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    fn test_host(pool_id: &str, id: &str, cpu: u32) -> Host {
        Host {
            id: id.to_string(),
            pool_id: pool_id.to_string(),
            rental_mode: RentalMode::Shared,
            status: HostStatus::Active,
            capacity: Capacity {
                cpu_cores: cpu,
                memory_gb: cpu * 4,
                storage_gb: u64::from(cpu) * 100,
                gpu_count: 0,
            },
            allocated: Capacity::default(),
        }
    }

    #[test]
    fn register_host_requires_pool() {
        let store = test_store();
        let result = register_host(&store, test_host("ghost", "h-1", 8));
        assert!(matches!(result, Err(SchedulerError::PoolNotFound(_))));
    }

    #[test]
    fn registration_accumulates_capacity_upward() {
        let store = test_store();
        register_datacenter(&store, "dc-1", "edge-east").unwrap();
        register_pool(&store, "pool-1", "dc-1", "general", None).unwrap();

        register_host(&store, test_host("pool-1", "h-1", 8)).unwrap();
        register_host(&store, test_host("pool-1", "h-2", 16)).unwrap();

        let pool = store.get_pool("pool-1").unwrap().unwrap();
        assert_eq!(pool.capacity.cpu_cores, 24);
        let dc = store.get_datacenter("dc-1").unwrap().unwrap();
        assert_eq!(dc.capacity.cpu_cores, 24);
    }

    #[test]
    fn register_host_forces_zero_allocation() {
        let store = test_store();
        register_datacenter(&store, "dc-1", "edge-east").unwrap();
        register_pool(&store, "pool-1", "dc-1", "general", None).unwrap();

        let mut dirty = test_host("pool-1", "h-1", 8);
        dirty.allocated.cpu_cores = 5;
        let stored = register_host(&store, dirty).unwrap();
        assert!(stored.allocated.is_zero());
    }

    #[test]
    fn reconcile_detects_and_corrects_drift() {
        let store = test_store();
        register_datacenter(&store, "dc-1", "edge-east").unwrap();
        register_pool(&store, "pool-1", "dc-1", "general", None).unwrap();
        register_host(&store, test_host("pool-1", "h-1", 8)).unwrap();

        // Corrupt the pool aggregate behind the accountant's back.
        let mut pool = store.get_pool("pool-1").unwrap().unwrap();
        pool.allocated.cpu_cores = 99;
        store.put_pool(&pool).unwrap();

        let report = reconcile_pool(&store, "pool-1").unwrap();
        assert!(report.allocated_drifted);
        assert!(!report.capacity_drifted);

        let fixed = store.get_pool("pool-1").unwrap().unwrap();
        assert_eq!(fixed.allocated.cpu_cores, 0);

        // A second pass finds nothing to fix.
        let report = reconcile_pool(&store, "pool-1").unwrap();
        assert!(!report.drifted());
    }

    #[test]
    fn reconcile_fixes_datacenter_from_pools() {
        let store = test_store();
        register_datacenter(&store, "dc-1", "edge-east").unwrap();
        register_pool(&store, "pool-1", "dc-1", "general", None).unwrap();
        register_host(&store, test_host("pool-1", "h-1", 8)).unwrap();

        let mut dc = store.get_datacenter("dc-1").unwrap().unwrap();
        dc.capacity.cpu_cores = 1;
        store.put_datacenter(&dc).unwrap();

        reconcile_pool(&store, "pool-1").unwrap();

        let fixed = store.get_datacenter("dc-1").unwrap().unwrap();
        assert_eq!(fixed.capacity.cpu_cores, 8);
    }
}
