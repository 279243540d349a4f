//! redb table definitions for the DeskPlane state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Composite keys follow the pattern `{parent_id}:{child_id}`.

use redb::TableDefinition;

/// Instances keyed by `{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Hosts keyed by `{pool_id}:{host_id}`.
pub const HOSTS: TableDefinition<&str, &[u8]> = TableDefinition::new("hosts");

/// Virtual machine placement records keyed by `{vm_id}`.
pub const VIRTUAL_MACHINES: TableDefinition<&str, &[u8]> = TableDefinition::new("virtual_machines");

/// Resource pools keyed by `{pool_id}`.
pub const RESOURCE_POOLS: TableDefinition<&str, &[u8]> = TableDefinition::new("resource_pools");

/// Edge datacenters keyed by `{dc_id}`.
pub const DATACENTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("datacenters");

/// IP pools keyed by `{ip_pool_id}`.
pub const IP_POOLS: TableDefinition<&str, &[u8]> = TableDefinition::new("ip_pools");

/// IP address rows keyed by `{ip_pool_id}:{address_u32:010}`.
///
/// The zero-padded numeric key makes a prefix scan yield addresses in
/// ascending order, which the sequential allocation strategy relies on.
pub const IP_ADDRESSES: TableDefinition<&str, &[u8]> = TableDefinition::new("ip_addresses");

/// Quota configs keyed by `tenant:{id}` or `user:{id}`.
pub const QUOTAS: TableDefinition<&str, &[u8]> = TableDefinition::new("quotas");
