//! IpAllocator — allocation, release, and status transitions for address rows.
//!
//! All mutations for one pool run under that pool's mutex, held across the
//! candidate search and the status commit, so concurrent allocators cannot
//! hand out the same address. Multi-row updates (range allocation, range
//! release, pool materialization) go through the store's batched write so
//! partial transitions are never observable.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use deskplane_state::{AllocationStrategy, IpAddress, IpPool, IpStatus, StateStore};

use crate::cidr;
use crate::error::{IpamError, IpamResult};

/// Upper bound on contiguous range allocations.
pub const MAX_RANGE_SIZE: u16 = 255;

/// Configuration for creating a pool from a CIDR block.
#[derive(Debug, Clone)]
pub struct IpPoolConfig {
    pub name: String,
    pub cidr: String,
    /// Reserved at creation when set.
    pub gateway: Option<Ipv4Addr>,
    /// Marked RESERVED at creation, in addition to the gateway.
    pub reserved: Vec<Ipv4Addr>,
    pub strategy: AllocationStrategy,
    pub allow_range: bool,
}

/// The three allocation modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationRequest {
    /// Caller names an exact address; it must be AVAILABLE.
    Specified { address: Ipv4Addr },
    /// Single address chosen by the pool's configured strategy.
    Auto,
    /// Contiguous block of `size` addresses allocated as a unit.
    Range { size: u16 },
}

/// Pool-level occupancy counters, recomputed by scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct IpPoolStats {
    pub total: u32,
    pub available: u32,
    pub allocated: u32,
    pub reserved: u32,
    pub frozen: u32,
}

/// The allocator owns all IpAddress mutations.
pub struct IpAllocator {
    store: StateStore,
    /// Per-pool serialization of search-then-commit sections.
    pool_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl IpAllocator {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            pool_locks: RwLock::new(HashMap::new()),
        }
    }

    // ── Pool creation ──────────────────────────────────────────────

    /// Materialize a pool from its CIDR: one row per usable address,
    /// AVAILABLE except the gateway and configured reservations.
    pub async fn create_pool(&self, config: IpPoolConfig) -> IpamResult<IpPool> {
        let net = cidr::parse_pool_cidr(&config.cidr)?;

        if let Some(gateway) = config.gateway {
            if !cidr::is_usable(&net, gateway) {
                return Err(IpamError::InvalidRequest(format!(
                    "gateway {gateway} is outside the usable range of {}",
                    config.cidr
                )));
            }
        }
        for addr in &config.reserved {
            if !cidr::is_usable(&net, *addr) {
                return Err(IpamError::InvalidRequest(format!(
                    "reserved address {addr} is outside the usable range of {}",
                    config.cidr
                )));
            }
        }

        let pool = IpPool {
            id: uuid::Uuid::new_v4().to_string(),
            name: config.name,
            cidr: net.to_string(),
            gateway: config.gateway,
            reserved: config.reserved.clone(),
            strategy: config.strategy,
            allow_range: config.allow_range,
            created_at: epoch_secs(),
        };

        let rows: Vec<IpAddress> = cidr::usable_addresses(&net)
            .map(|address| {
                let reserved =
                    config.gateway == Some(address) || config.reserved.contains(&address);
                IpAddress {
                    address,
                    pool_id: pool.id.clone(),
                    status: if reserved {
                        IpStatus::Reserved
                    } else {
                        IpStatus::Available
                    },
                    instance_id: None,
                    is_range_start: false,
                    range_size: 1,
                    allocated_at: None,
                    allocated_by: None,
                }
            })
            .collect();

        self.store.put_ip_pool(&pool)?;
        self.store.put_ips(&rows)?;

        info!(
            pool = %pool.id,
            cidr = %pool.cidr,
            usable = rows.len(),
            strategy = ?pool.strategy,
            "ip pool created"
        );
        Ok(pool)
    }

    // ── Allocation ─────────────────────────────────────────────────

    /// Allocate one address or a contiguous block for an instance.
    ///
    /// Every allocated row records the instance, the allocating principal,
    /// and the allocation time. For ranges, only the first row carries
    /// `is_range_start` and the block size, so releasing the start releases
    /// the whole block.
    pub async fn allocate(
        &self,
        pool_id: &str,
        instance_id: &str,
        allocated_by: &str,
        request: AllocationRequest,
    ) -> IpamResult<Vec<IpAddress>> {
        // Shape validation happens before the pool is even loaded.
        if let AllocationRequest::Range { size } = request {
            if size == 0 || size > MAX_RANGE_SIZE {
                return Err(IpamError::InvalidRequest(format!(
                    "range size {size} out of 1..={MAX_RANGE_SIZE}"
                )));
            }
        }

        let lock = self.pool_lock(pool_id).await;
        let _guard = lock.lock().await;

        let pool = self
            .store
            .get_ip_pool(pool_id)?
            .ok_or_else(|| IpamError::PoolNotFound(pool_id.to_string()))?;

        let rows = self.store.list_ips_in_pool(pool_id)?;
        let indices: Vec<usize> = match request {
            AllocationRequest::Specified { address } => {
                let idx = rows
                    .iter()
                    .position(|r| r.address == address)
                    .ok_or(IpamError::AddressNotFound(address))?;
                if rows[idx].status != IpStatus::Available {
                    return Err(IpamError::InvalidState {
                        address,
                        status: rows[idx].status,
                        op: "allocate",
                    });
                }
                vec![idx]
            }
            AllocationRequest::Auto => {
                let idx = pick_single(&rows, pool.strategy).ok_or(IpamError::Exhausted {
                    pool_id: pool_id.to_string(),
                    requested: 1,
                })?;
                vec![idx]
            }
            AllocationRequest::Range { size } => {
                if !pool.allow_range {
                    return Err(IpamError::InvalidRequest(format!(
                        "pool {pool_id} does not permit range allocation"
                    )));
                }
                let start =
                    pick_range(&rows, size as usize, pool.strategy).ok_or(IpamError::Exhausted {
                        pool_id: pool_id.to_string(),
                        requested: size,
                    })?;
                (start..start + size as usize).collect()
            }
        };

        let now = epoch_secs();
        let is_range = matches!(request, AllocationRequest::Range { .. });
        let updated: Vec<IpAddress> = indices
            .iter()
            .enumerate()
            .map(|(k, &i)| {
                let mut row = rows[i].clone();
                row.status = IpStatus::Allocated;
                row.instance_id = Some(instance_id.to_string());
                row.allocated_by = Some(allocated_by.to_string());
                row.allocated_at = Some(now);
                row.is_range_start = is_range && k == 0;
                row.range_size = if is_range && k == 0 {
                    indices.len() as u16
                } else {
                    1
                };
                row
            })
            .collect();

        self.store.put_ips(&updated)?;
        info!(
            pool = pool_id,
            instance = instance_id,
            first = %updated[0].address,
            count = updated.len(),
            "addresses allocated"
        );
        Ok(updated)
    }

    // ── Release ────────────────────────────────────────────────────

    /// Release an allocated address back to AVAILABLE.
    ///
    /// If the address is a range start, the entire contiguous block is
    /// released — recomputed from the stored start + size and matched
    /// against currently-ALLOCATED rows of the same instance. The
    /// last-allocation timestamp is kept as the recency marker for the
    /// least_used strategy.
    pub async fn release(&self, pool_id: &str, address: Ipv4Addr) -> IpamResult<Vec<IpAddress>> {
        let lock = self.pool_lock(pool_id).await;
        let _guard = lock.lock().await;

        let row = self
            .store
            .get_ip(pool_id, address)?
            .ok_or(IpamError::AddressNotFound(address))?;
        if row.status != IpStatus::Allocated {
            return Err(IpamError::InvalidState {
                address,
                status: row.status,
                op: "release",
            });
        }

        let mut block = vec![row.clone()];
        if row.is_range_start && row.range_size > 1 {
            for step in 1..u32::from(row.range_size) {
                let Some(next) = cidr::offset(address, step) else {
                    break;
                };
                let Some(member) = self.store.get_ip(pool_id, next)? else {
                    break;
                };
                if member.status == IpStatus::Allocated && member.instance_id == row.instance_id {
                    block.push(member);
                }
            }
        }

        let released: Vec<IpAddress> = block
            .into_iter()
            .map(|mut r| {
                r.status = IpStatus::Available;
                r.instance_id = None;
                r.allocated_by = None;
                r.is_range_start = false;
                r.range_size = 1;
                r
            })
            .collect();

        self.store.put_ips(&released)?;
        info!(
            pool = pool_id,
            first = %address,
            count = released.len(),
            "addresses released"
        );
        Ok(released)
    }

    /// Release every address still allocated to an instance, across pools.
    /// Returns the number of rows released.
    pub async fn release_for_instance(&self, instance_id: &str) -> IpamResult<u32> {
        let bound = self.store.list_ips_for_instance(instance_id)?;
        let mut released = 0u32;
        // Group by pool so each pool's rows are rewritten under its lock.
        let mut by_pool: HashMap<String, Vec<IpAddress>> = HashMap::new();
        for row in bound {
            by_pool.entry(row.pool_id.clone()).or_default().push(row);
        }

        for (pool_id, rows) in by_pool {
            let lock = self.pool_lock(&pool_id).await;
            let _guard = lock.lock().await;
            let cleared: Vec<IpAddress> = rows
                .into_iter()
                .map(|mut r| {
                    r.status = IpStatus::Available;
                    r.instance_id = None;
                    r.allocated_by = None;
                    r.is_range_start = false;
                    r.range_size = 1;
                    r
                })
                .collect();
            released += cleared.len() as u32;
            self.store.put_ips(&cleared)?;
            debug!(pool = %pool_id, instance = instance_id, count = cleared.len(), "instance addresses released");
        }
        Ok(released)
    }

    // ── Status transitions ─────────────────────────────────────────

    /// AVAILABLE → RESERVED.
    pub async fn reserve(&self, pool_id: &str, address: Ipv4Addr) -> IpamResult<IpAddress> {
        self.transition(pool_id, address, "reserve", &[IpStatus::Available], IpStatus::Reserved)
            .await
    }

    /// AVAILABLE/RESERVED → FROZEN. An allocated address cannot be frozen.
    pub async fn freeze(&self, pool_id: &str, address: Ipv4Addr) -> IpamResult<IpAddress> {
        self.transition(
            pool_id,
            address,
            "freeze",
            &[IpStatus::Available, IpStatus::Reserved],
            IpStatus::Frozen,
        )
        .await
    }

    /// FROZEN → AVAILABLE.
    pub async fn unfreeze(&self, pool_id: &str, address: Ipv4Addr) -> IpamResult<IpAddress> {
        self.transition(pool_id, address, "unfreeze", &[IpStatus::Frozen], IpStatus::Available)
            .await
    }

    async fn transition(
        &self,
        pool_id: &str,
        address: Ipv4Addr,
        op: &'static str,
        from: &[IpStatus],
        to: IpStatus,
    ) -> IpamResult<IpAddress> {
        let lock = self.pool_lock(pool_id).await;
        let _guard = lock.lock().await;

        let mut row = self
            .store
            .get_ip(pool_id, address)?
            .ok_or(IpamError::AddressNotFound(address))?;
        if !from.contains(&row.status) {
            return Err(IpamError::InvalidState {
                address,
                status: row.status,
                op,
            });
        }
        row.status = to;
        self.store.put_ip(&row)?;
        debug!(pool = pool_id, %address, ?to, "address status changed");
        Ok(row)
    }

    // ── Stats ──────────────────────────────────────────────────────

    /// Occupancy counters for a pool, recomputed by scanning its rows.
    pub async fn pool_stats(&self, pool_id: &str) -> IpamResult<IpPoolStats> {
        if self.store.get_ip_pool(pool_id)?.is_none() {
            return Err(IpamError::PoolNotFound(pool_id.to_string()));
        }
        let mut stats = IpPoolStats::default();
        for row in self.store.list_ips_in_pool(pool_id)? {
            stats.total += 1;
            match row.status {
                IpStatus::Available => stats.available += 1,
                IpStatus::Allocated => stats.allocated += 1,
                IpStatus::Reserved => stats.reserved += 1,
                IpStatus::Frozen => stats.frozen += 1,
            }
        }
        Ok(stats)
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

// ── Selection ─────────────────────────────────────────────────────

/// Pick one AVAILABLE row index per the pool's strategy.
fn pick_single(rows: &[IpAddress], strategy: AllocationStrategy) -> Option<usize> {
    let available: Vec<usize> = rows
        .iter()
        .enumerate()
        .filter(|(_, r)| r.status == IpStatus::Available)
        .map(|(i, _)| i)
        .collect();
    if available.is_empty() {
        return None;
    }

    match strategy {
        // Rows arrive in ascending address order, so the first available
        // row is the lowest-numbered address.
        AllocationStrategy::Sequential => available.first().copied(),
        AllocationStrategy::Random => {
            let pick = rand::thread_rng().gen_range(0..available.len());
            Some(available[pick])
        }
        // Never-allocated first (None sorts before Some), then the oldest
        // last-allocation time, ties broken by lowest address.
        AllocationStrategy::LeastUsed => available
            .into_iter()
            .min_by_key(|&i| (rows[i].allocated_at, u32::from(rows[i].address))),
    }
}

/// Pick a start index such that `rows[start..start + size]` is a contiguous
/// run of AVAILABLE addresses.
fn pick_range(rows: &[IpAddress], size: usize, strategy: AllocationStrategy) -> Option<usize> {
    // Length of the contiguous available run starting at each index,
    // computed right-to-left in one pass.
    let mut run = vec![0usize; rows.len()];
    for i in (0..rows.len()).rev() {
        if rows[i].status != IpStatus::Available {
            continue;
        }
        let continues = i + 1 < rows.len()
            && run[i + 1] > 0
            && cidr::offset(rows[i].address, 1) == Some(rows[i + 1].address);
        run[i] = if continues { run[i + 1] + 1 } else { 1 };
    }

    let candidates: Vec<usize> = (0..rows.len()).filter(|&i| run[i] >= size).collect();
    if candidates.is_empty() {
        return None;
    }

    match strategy {
        // least_used degrades to a sequential start scan for ranges.
        AllocationStrategy::Sequential | AllocationStrategy::LeastUsed => {
            candidates.first().copied()
        }
        AllocationStrategy::Random => {
            let pick = rand::thread_rng().gen_range(0..candidates.len());
            Some(candidates[pick])
        }
    }
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
