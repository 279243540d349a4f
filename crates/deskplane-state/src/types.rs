//! Domain types for the DeskPlane state store.
//!
//! These types represent the persisted state of instances, hosts, virtual
//! machines, resource pools, datacenters, IP pools, and quota configs. All
//! types are serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Unique identifier for an instance.
pub type InstanceId = String;

/// Unique identifier for a physical host.
pub type HostId = String;

/// Unique identifier for a resource pool.
pub type PoolId = String;

// ── Resource spec ──────────────────────────────────────────────────

/// Declarative resource request carried by an instance.
///
/// Immutable once the instance is created except through explicit resize.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceSpec {
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub storage_gb: u64,
    pub gpu_count: u32,
    pub bandwidth_gbps: u32,
    /// Image the instance boots from.
    pub image_id: Option<String>,
    pub image_version_id: Option<String>,
}

// ── Instance ──────────────────────────────────────────────────────

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Creating,
    Initializing,
    Running,
    Suspended,
    Stopping,
    Stopped,
    Terminating,
    Deleted,
}

impl InstanceStatus {
    /// CPU and memory count toward quota only while the instance is in
    /// one of these states.
    pub fn holds_compute(self) -> bool {
        matches!(
            self,
            Self::Creating | Self::Initializing | Self::Running | Self::Suspended
        )
    }

    /// Storage and the instance-count slot are held in any non-deleted state.
    pub fn holds_storage(self) -> bool {
        self != Self::Deleted
    }

    /// States in which the placement binding fields must be non-null.
    pub fn has_placement(self) -> bool {
        matches!(
            self,
            Self::Initializing | Self::Running | Self::Suspended | Self::Stopping
        )
    }

    /// Terminal or transient-terminal states reject all start/stop calls.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminating | Self::Deleted)
    }
}

/// How an instance occupies its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RentalMode {
    /// Whole host dedicated to one instance.
    Exclusive,
    /// A slice of a shared host, tracked by a VirtualMachine record.
    Shared,
}

impl std::fmt::Display for RentalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exclusive => write!(f, "exclusive"),
            Self::Shared => write!(f, "shared"),
        }
    }
}

/// Tenant-scoped compute request.
///
/// Placement binding fields (`resource_pool_id`, `host_id`,
/// `virtual_machine_id`) are non-null iff `status.has_placement()`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    pub tenant_id: String,
    pub user_id: String,
    pub template_id: Option<String>,
    pub status: InstanceStatus,
    /// Set once a placement decision is made; None while stopped-and-unallocated.
    pub rental_mode: Option<RentalMode>,
    pub resource_pool_id: Option<PoolId>,
    pub host_id: Option<HostId>,
    pub virtual_machine_id: Option<String>,
    pub spec: ResourceSpec,
    /// Unix timestamp (seconds) when this instance was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last status change.
    pub updated_at: u64,
}

impl Instance {
    /// Null out every placement binding field.
    pub fn clear_placement(&mut self) {
        self.rental_mode = None;
        self.resource_pool_id = None;
        self.host_id = None;
        self.virtual_machine_id = None;
    }
}

// ── Host ──────────────────────────────────────────────────────────

/// Operational status of a host. ACTIVE and MAINTENANCE hosts accept
/// placements; OFFLINE hosts are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Active,
    Maintenance,
    Offline,
}

/// A bundle of capacity counters. Used both for host totals and for
/// allocation counters (and, summed, for pool/datacenter aggregates).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capacity {
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub storage_gb: u64,
    pub gpu_count: u32,
}

impl Capacity {
    pub fn from_spec(spec: &ResourceSpec) -> Self {
        Self {
            cpu_cores: spec.cpu_cores,
            memory_gb: spec.memory_gb,
            storage_gb: spec.storage_gb,
            gpu_count: spec.gpu_count,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.cpu_cores == 0 && self.memory_gb == 0 && self.storage_gb == 0 && self.gpu_count == 0
    }

    /// Component-wise `self >= other`.
    pub fn covers(&self, other: &Capacity) -> bool {
        self.cpu_cores >= other.cpu_cores
            && self.memory_gb >= other.memory_gb
            && self.storage_gb >= other.storage_gb
            && self.gpu_count >= other.gpu_count
    }

    pub fn add(&mut self, other: &Capacity) {
        self.cpu_cores += other.cpu_cores;
        self.memory_gb += other.memory_gb;
        self.storage_gb += other.storage_gb;
        self.gpu_count += other.gpu_count;
    }

    pub fn sub(&mut self, other: &Capacity) {
        self.cpu_cores = self.cpu_cores.saturating_sub(other.cpu_cores);
        self.memory_gb = self.memory_gb.saturating_sub(other.memory_gb);
        self.storage_gb = self.storage_gb.saturating_sub(other.storage_gb);
        self.gpu_count = self.gpu_count.saturating_sub(other.gpu_count);
    }
}

/// A physical machine inside a resource pool.
///
/// Capacity is fixed at registration; only the allocation counters mutate
/// during scheduling. EXCLUSIVE hosts are allocated all-or-nothing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Host {
    pub id: HostId,
    pub pool_id: PoolId,
    pub rental_mode: RentalMode,
    pub status: HostStatus,
    pub capacity: Capacity,
    pub allocated: Capacity,
}

impl Host {
    /// Headroom left on this host, component-wise.
    pub fn free(&self) -> Capacity {
        let mut free = self.capacity;
        free.sub(&self.allocated);
        free
    }

    pub fn is_placeable(&self) -> bool {
        matches!(self.status, HostStatus::Active | HostStatus::Maintenance)
    }
}

/// A shared-host placement record binding one instance to one host's slice
/// of capacity. Deleted when the instance stops.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VirtualMachine {
    pub id: String,
    pub host_id: HostId,
    pub pool_id: PoolId,
    pub instance_id: InstanceId,
    /// The capacity reserved on the host; released verbatim on stop.
    pub reservation: Capacity,
    pub created_at: u64,
}

// ── Resource pool / datacenter ────────────────────────────────────

/// A named group of hosts within an edge site, used as the scheduling
/// domain. Aggregate counters are maintained incrementally and verified
/// by the reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourcePool {
    pub id: PoolId,
    pub datacenter_id: String,
    pub name: String,
    /// Address space instances placed here draw their network identity from.
    pub ip_pool_id: Option<String>,
    pub capacity: Capacity,
    pub allocated: Capacity,
}

/// An edge site aggregating resource pools.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeDataCenter {
    pub id: String,
    pub name: String,
    pub capacity: Capacity,
    pub allocated: Capacity,
}

// ── IP pool / address ─────────────────────────────────────────────

/// How the pool picks an address for `auto` allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Lowest-numbered available address.
    Sequential,
    /// Uniform-random pick among available addresses.
    Random,
    /// Available address with the oldest (or null) last-allocation time.
    LeastUsed,
}

/// CIDR-derived address space.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpPool {
    pub id: String,
    pub name: String,
    pub cidr: String,
    /// Reserved at creation when set; a pool without a gateway exposes its
    /// full usable range.
    pub gateway: Option<Ipv4Addr>,
    /// Addresses marked RESERVED at creation, in addition to the gateway.
    pub reserved: Vec<Ipv4Addr>,
    pub strategy: AllocationStrategy,
    /// Whether contiguous range allocation is permitted in this pool.
    pub allow_range: bool,
    pub created_at: u64,
}

/// Status of a single address row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpStatus {
    Available,
    Reserved,
    Allocated,
    Frozen,
}

impl std::fmt::Display for IpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::Reserved => write!(f, "reserved"),
            Self::Allocated => write!(f, "allocated"),
            Self::Frozen => write!(f, "frozen"),
        }
    }
}

/// One row per usable address in a pool. Rows are created in bulk when the
/// pool is materialized from its CIDR and only ever transition between
/// statuses afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpAddress {
    pub address: Ipv4Addr,
    pub pool_id: String,
    pub status: IpStatus,
    /// Set iff status is ALLOCATED.
    pub instance_id: Option<InstanceId>,
    /// First address of a contiguous block allocated as a unit. Releasing
    /// a range start releases the whole block.
    pub is_range_start: bool,
    pub range_size: u16,
    /// Last time this address was allocated. Survives release so the
    /// least_used strategy can prefer long-idle addresses.
    pub allocated_at: Option<u64>,
    pub allocated_by: Option<String>,
}

// ── Quota ─────────────────────────────────────────────────────────

/// Whether a quota applies at tenant or user scope. Both are enforced
/// independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaScope {
    Tenant,
    User,
}

impl std::fmt::Display for QuotaScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tenant => write!(f, "tenant"),
            Self::User => write!(f, "user"),
        }
    }
}

/// Configured ceilings for one tenant or user. A `None` field means the
/// dimension is unbounded.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaConfig {
    pub max_instances: Option<u32>,
    pub max_cpu_cores: Option<u32>,
    pub max_memory_gb: Option<u32>,
    pub max_storage_gb: Option<u64>,
    pub max_bandwidth_gbps: Option<u32>,
    pub max_ip_addresses: Option<u32>,
}

// ── Table keys ────────────────────────────────────────────────────

impl Host {
    /// Build the composite key for the hosts table.
    pub fn table_key(&self) -> String {
        host_key(&self.pool_id, &self.id)
    }
}

impl IpAddress {
    /// Build the composite key for the ip_addresses table.
    pub fn table_key(&self) -> String {
        ip_key(&self.pool_id, self.address)
    }
}

/// Key for a host row: `{pool_id}:{host_id}`.
pub fn host_key(pool_id: &str, host_id: &str) -> String {
    format!("{pool_id}:{host_id}")
}

/// Key for an address row: `{pool_id}:{address_u32:010}`.
///
/// Zero-padding keeps lexicographic key order equal to numeric address order.
pub fn ip_key(pool_id: &str, address: Ipv4Addr) -> String {
    format!("{pool_id}:{:010}", u32::from(address))
}

/// Key for a quota config row: `{scope}:{id}`.
pub fn quota_key(scope: QuotaScope, id: &str) -> String {
    format!("{scope}:{id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_key_orders_numerically() {
        let low = ip_key("pool-1", Ipv4Addr::new(10, 0, 0, 2));
        let high = ip_key("pool-1", Ipv4Addr::new(10, 0, 1, 1));
        assert!(low < high);
    }

    #[test]
    fn compute_held_only_in_active_states() {
        assert!(InstanceStatus::Running.holds_compute());
        assert!(InstanceStatus::Initializing.holds_compute());
        assert!(InstanceStatus::Suspended.holds_compute());
        assert!(!InstanceStatus::Stopped.holds_compute());
        assert!(!InstanceStatus::Deleted.holds_compute());
    }

    #[test]
    fn storage_held_until_deleted() {
        assert!(InstanceStatus::Stopped.holds_storage());
        assert!(InstanceStatus::Stopping.holds_storage());
        assert!(!InstanceStatus::Deleted.holds_storage());
    }

    #[test]
    fn capacity_covers_is_component_wise() {
        let big = Capacity {
            cpu_cores: 8,
            memory_gb: 32,
            storage_gb: 500,
            gpu_count: 1,
        };
        let small = Capacity {
            cpu_cores: 4,
            memory_gb: 16,
            storage_gb: 100,
            gpu_count: 0,
        };
        assert!(big.covers(&small));
        assert!(!small.covers(&big));
        // One lacking component fails the whole check.
        let wide_mem = Capacity {
            cpu_cores: 1,
            memory_gb: 64,
            storage_gb: 1,
            gpu_count: 0,
        };
        assert!(!big.covers(&wide_mem));
    }

    #[test]
    fn capacity_sub_saturates() {
        let mut a = Capacity {
            cpu_cores: 2,
            memory_gb: 4,
            storage_gb: 10,
            gpu_count: 0,
        };
        let b = Capacity {
            cpu_cores: 4,
            memory_gb: 2,
            storage_gb: 20,
            gpu_count: 1,
        };
        a.sub(&b);
        assert_eq!(a.cpu_cores, 0);
        assert_eq!(a.memory_gb, 2);
        assert_eq!(a.storage_gb, 0);
    }

    #[test]
    fn clear_placement_nulls_all_bindings() {
        let mut inst = Instance {
            id: "i-1".to_string(),
            tenant_id: "t-1".to_string(),
            user_id: "u-1".to_string(),
            template_id: None,
            status: InstanceStatus::Running,
            rental_mode: Some(RentalMode::Shared),
            resource_pool_id: Some("pool-1".to_string()),
            host_id: Some("host-1".to_string()),
            virtual_machine_id: Some("vm-1".to_string()),
            spec: ResourceSpec {
                cpu_cores: 2,
                memory_gb: 4,
                storage_gb: 50,
                gpu_count: 0,
                bandwidth_gbps: 1,
                image_id: None,
                image_version_id: None,
            },
            created_at: 1000,
            updated_at: 1000,
        };
        inst.clear_placement();
        assert!(inst.rental_mode.is_none());
        assert!(inst.resource_pool_id.is_none());
        assert!(inst.host_id.is_none());
        assert!(inst.virtual_machine_id.is_none());
    }
}
