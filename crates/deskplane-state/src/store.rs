//! StateStore — redb-backed state persistence for DeskPlane.
//!
//! Provides typed CRUD operations over instances, hosts, virtual machines,
//! resource pools, datacenters, IP pools, IP addresses, and quota configs.
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).
//!
//! Compound mutations that must be atomic (bulk address materialization,
//! guarded instance status swaps) run inside a single write transaction;
//! redb serializes write transactions, so a guarded swap is a true
//! compare-and-swap.

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Outcome of a guarded (compare-and-swap) instance update.
#[derive(Debug, Clone)]
pub enum GuardedUpdate {
    /// The guard held; the mutation was applied and committed.
    Applied(Instance),
    /// The guard failed against the current row; nothing was written.
    Rejected(Instance),
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(HOSTS).map_err(map_err!(Table))?;
        txn.open_table(VIRTUAL_MACHINES).map_err(map_err!(Table))?;
        txn.open_table(RESOURCE_POOLS).map_err(map_err!(Table))?;
        txn.open_table(DATACENTERS).map_err(map_err!(Table))?;
        txn.open_table(IP_POOLS).map_err(map_err!(Table))?;
        txn.open_table(IP_ADDRESSES).map_err(map_err!(Table))?;
        txn.open_table(QUOTAS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put_json<T: Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Scan a table, deserializing every row whose key starts with `prefix`
    /// (empty prefix scans the whole table). Iteration follows key order.
    fn scan_json<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        prefix: &str,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    fn delete_key(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or update an instance.
    pub fn put_instance(&self, instance: &Instance) -> StateResult<()> {
        self.put_json(INSTANCES, &instance.id, instance)
    }

    /// Get an instance by ID.
    pub fn get_instance(&self, id: &str) -> StateResult<Option<Instance>> {
        self.get_json(INSTANCES, id)
    }

    /// List all instances (every status, DELETED included).
    pub fn list_instances(&self) -> StateResult<Vec<Instance>> {
        self.scan_json(INSTANCES, "")
    }

    /// Delete an instance row outright. Returns true if it existed.
    ///
    /// Lifecycle deletion is a soft status change; this is for test cleanup.
    pub fn delete_instance(&self, id: &str) -> StateResult<bool> {
        self.delete_key(INSTANCES, id)
    }

    /// Compare-and-swap update of an instance row.
    ///
    /// Re-reads the row inside a write transaction, applies `mutate` only if
    /// `guard` accepts the current value, and commits. Returns the rejected
    /// current value otherwise, with nothing written. Errors with `NotFound`
    /// if the row is absent.
    pub fn update_instance_guarded(
        &self,
        id: &str,
        guard: impl FnOnce(&Instance) -> bool,
        mutate: impl FnOnce(&mut Instance),
    ) -> StateResult<GuardedUpdate> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome;
        {
            let mut t = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let current: Instance = match t.get(id).map_err(map_err!(Read))? {
                Some(bytes) => {
                    serde_json::from_slice(bytes.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(format!("instance {id}"))),
            };
            if guard(&current) {
                let mut updated = current;
                mutate(&mut updated);
                let bytes = serde_json::to_vec(&updated).map_err(map_err!(Serialize))?;
                t.insert(id, bytes.as_slice()).map_err(map_err!(Write))?;
                outcome = GuardedUpdate::Applied(updated);
            } else {
                outcome = GuardedUpdate::Rejected(current);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(outcome)
    }

    // ── Hosts ──────────────────────────────────────────────────────

    /// Insert or update a host.
    pub fn put_host(&self, host: &Host) -> StateResult<()> {
        self.put_json(HOSTS, &host.table_key(), host)
    }

    /// Get a host by pool and host ID.
    pub fn get_host(&self, pool_id: &str, host_id: &str) -> StateResult<Option<Host>> {
        self.get_json(HOSTS, &host_key(pool_id, host_id))
    }

    /// List all hosts in a pool, in key order.
    pub fn list_hosts_in_pool(&self, pool_id: &str) -> StateResult<Vec<Host>> {
        self.scan_json(HOSTS, &format!("{pool_id}:"))
    }

    /// Delete a host. Returns true if it existed.
    pub fn delete_host(&self, pool_id: &str, host_id: &str) -> StateResult<bool> {
        self.delete_key(HOSTS, &host_key(pool_id, host_id))
    }

    // ── Virtual machines ───────────────────────────────────────────

    /// Insert or update a virtual machine placement record.
    pub fn put_vm(&self, vm: &VirtualMachine) -> StateResult<()> {
        self.put_json(VIRTUAL_MACHINES, &vm.id, vm)
    }

    /// Get a virtual machine by ID.
    pub fn get_vm(&self, id: &str) -> StateResult<Option<VirtualMachine>> {
        self.get_json(VIRTUAL_MACHINES, id)
    }

    /// Delete a virtual machine record. Returns true if it existed.
    pub fn delete_vm(&self, id: &str) -> StateResult<bool> {
        self.delete_key(VIRTUAL_MACHINES, id)
    }

    /// List all virtual machines placed on a host.
    pub fn list_vms_on_host(&self, host_id: &str) -> StateResult<Vec<VirtualMachine>> {
        let all: Vec<VirtualMachine> = self.scan_json(VIRTUAL_MACHINES, "")?;
        Ok(all.into_iter().filter(|vm| vm.host_id == host_id).collect())
    }

    // ── Resource pools / datacenters ───────────────────────────────

    /// Insert or update a resource pool.
    pub fn put_pool(&self, pool: &ResourcePool) -> StateResult<()> {
        self.put_json(RESOURCE_POOLS, &pool.id, pool)
    }

    /// Get a resource pool by ID.
    pub fn get_pool(&self, id: &str) -> StateResult<Option<ResourcePool>> {
        self.get_json(RESOURCE_POOLS, id)
    }

    /// List all resource pools.
    pub fn list_pools(&self) -> StateResult<Vec<ResourcePool>> {
        self.scan_json(RESOURCE_POOLS, "")
    }

    /// Insert or update a datacenter.
    pub fn put_datacenter(&self, dc: &EdgeDataCenter) -> StateResult<()> {
        self.put_json(DATACENTERS, &dc.id, dc)
    }

    /// Get a datacenter by ID.
    pub fn get_datacenter(&self, id: &str) -> StateResult<Option<EdgeDataCenter>> {
        self.get_json(DATACENTERS, id)
    }

    // ── IP pools ───────────────────────────────────────────────────

    /// Insert or update an IP pool.
    pub fn put_ip_pool(&self, pool: &IpPool) -> StateResult<()> {
        self.put_json(IP_POOLS, &pool.id, pool)
    }

    /// Get an IP pool by ID.
    pub fn get_ip_pool(&self, id: &str) -> StateResult<Option<IpPool>> {
        self.get_json(IP_POOLS, id)
    }

    /// List all IP pools.
    pub fn list_ip_pools(&self) -> StateResult<Vec<IpPool>> {
        self.scan_json(IP_POOLS, "")
    }

    // ── IP addresses ───────────────────────────────────────────────

    /// Insert or update a single address row.
    pub fn put_ip(&self, ip: &IpAddress) -> StateResult<()> {
        self.put_json(IP_ADDRESSES, &ip.table_key(), ip)
    }

    /// Insert or update a batch of address rows in one transaction.
    ///
    /// Used for pool materialization and for multi-address allocations,
    /// where partial writes must never be observable.
    pub fn put_ips(&self, ips: &[IpAddress]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(IP_ADDRESSES).map_err(map_err!(Table))?;
            for ip in ips {
                let bytes = serde_json::to_vec(ip).map_err(map_err!(Serialize))?;
                t.insert(ip.table_key().as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get one address row.
    pub fn get_ip(&self, pool_id: &str, address: Ipv4Addr) -> StateResult<Option<IpAddress>> {
        self.get_json(IP_ADDRESSES, &ip_key(pool_id, address))
    }

    /// List every address row in a pool, in ascending address order.
    pub fn list_ips_in_pool(&self, pool_id: &str) -> StateResult<Vec<IpAddress>> {
        self.scan_json(IP_ADDRESSES, &format!("{pool_id}:"))
    }

    /// List every address row currently bound to an instance, across pools.
    pub fn list_ips_for_instance(&self, instance_id: &str) -> StateResult<Vec<IpAddress>> {
        let all: Vec<IpAddress> = self.scan_json(IP_ADDRESSES, "")?;
        Ok(all
            .into_iter()
            .filter(|ip| ip.instance_id.as_deref() == Some(instance_id))
            .collect())
    }

    /// List every ALLOCATED address row, across pools. Used for quota
    /// usage sums.
    pub fn list_allocated_ips(&self) -> StateResult<Vec<IpAddress>> {
        let all: Vec<IpAddress> = self.scan_json(IP_ADDRESSES, "")?;
        Ok(all
            .into_iter()
            .filter(|ip| ip.status == IpStatus::Allocated)
            .collect())
    }

    // ── Quotas ─────────────────────────────────────────────────────

    /// Insert or update a quota config for a tenant or user.
    pub fn put_quota(&self, scope: QuotaScope, id: &str, config: &QuotaConfig) -> StateResult<()> {
        self.put_json(QUOTAS, &quota_key(scope, id), config)
    }

    /// Get the quota config for a tenant or user, if one is configured.
    pub fn get_quota(&self, scope: QuotaScope, id: &str) -> StateResult<Option<QuotaConfig>> {
        self.get_json(QUOTAS, &quota_key(scope, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_spec() -> ResourceSpec {
        ResourceSpec {
            cpu_cores: 4,
            memory_gb: 8,
            storage_gb: 100,
            gpu_count: 0,
            bandwidth_gbps: 1,
            image_id: Some("img-ubuntu".to_string()),
            image_version_id: None,
        }
    }

    fn test_instance(id: &str) -> Instance {
        Instance {
            id: id.to_string(),
            tenant_id: "tenant-1".to_string(),
            user_id: "user-1".to_string(),
            template_id: None,
            status: InstanceStatus::Stopped,
            rental_mode: None,
            resource_pool_id: None,
            host_id: None,
            virtual_machine_id: None,
            spec: test_spec(),
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_host(pool_id: &str, id: &str) -> Host {
        Host {
            id: id.to_string(),
            pool_id: pool_id.to_string(),
            rental_mode: RentalMode::Shared,
            status: HostStatus::Active,
            capacity: Capacity {
                cpu_cores: 32,
                memory_gb: 128,
                storage_gb: 2000,
                gpu_count: 2,
            },
            allocated: Capacity::default(),
        }
    }

    fn test_ip(pool_id: &str, last_octet: u8) -> IpAddress {
        IpAddress {
            address: Ipv4Addr::new(10, 0, 0, last_octet),
            pool_id: pool_id.to_string(),
            status: IpStatus::Available,
            instance_id: None,
            is_range_start: false,
            range_size: 1,
            allocated_at: None,
            allocated_by: None,
        }
    }

    // ── Instance CRUD ──────────────────────────────────────────────

    #[test]
    fn instance_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let inst = test_instance("i-1");

        store.put_instance(&inst).unwrap();
        let retrieved = store.get_instance("i-1").unwrap();

        assert_eq!(retrieved, Some(inst));
    }

    #[test]
    fn instance_get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_instance("nope").unwrap().is_none());
    }

    #[test]
    fn instance_list_all() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&test_instance("i-1")).unwrap();
        store.put_instance(&test_instance("i-2")).unwrap();

        assert_eq!(store.list_instances().unwrap().len(), 2);
    }

    #[test]
    fn guarded_update_applies_when_guard_holds() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&test_instance("i-1")).unwrap();

        let outcome = store
            .update_instance_guarded(
                "i-1",
                |i| i.status == InstanceStatus::Stopped,
                |i| i.status = InstanceStatus::Initializing,
            )
            .unwrap();

        match outcome {
            GuardedUpdate::Applied(inst) => {
                assert_eq!(inst.status, InstanceStatus::Initializing)
            }
            GuardedUpdate::Rejected(_) => panic!("guard should have held"),
        }
        let stored = store.get_instance("i-1").unwrap().unwrap();
        assert_eq!(stored.status, InstanceStatus::Initializing);
    }

    #[test]
    fn guarded_update_rejects_without_writing() {
        let store = StateStore::open_in_memory().unwrap();
        let mut inst = test_instance("i-1");
        inst.status = InstanceStatus::Running;
        store.put_instance(&inst).unwrap();

        let outcome = store
            .update_instance_guarded(
                "i-1",
                |i| i.status == InstanceStatus::Stopped,
                |i| i.status = InstanceStatus::Initializing,
            )
            .unwrap();

        match outcome {
            GuardedUpdate::Rejected(current) => {
                assert_eq!(current.status, InstanceStatus::Running)
            }
            GuardedUpdate::Applied(_) => panic!("guard should have failed"),
        }
        let stored = store.get_instance("i-1").unwrap().unwrap();
        assert_eq!(stored.status, InstanceStatus::Running);
    }

    #[test]
    fn guarded_update_missing_row_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let result = store.update_instance_guarded("ghost", |_| true, |_| {});
        assert!(matches!(result, Err(StateError::NotFound(_))));
    }

    // ── Host CRUD ──────────────────────────────────────────────────

    #[test]
    fn host_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let host = test_host("pool-1", "host-1");

        store.put_host(&host).unwrap();
        let retrieved = store.get_host("pool-1", "host-1").unwrap();

        assert_eq!(retrieved, Some(host));
    }

    #[test]
    fn hosts_scoped_to_pool() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_host(&test_host("pool-1", "host-a")).unwrap();
        store.put_host(&test_host("pool-1", "host-b")).unwrap();
        store.put_host(&test_host("pool-2", "host-c")).unwrap();

        assert_eq!(store.list_hosts_in_pool("pool-1").unwrap().len(), 2);
        assert_eq!(store.list_hosts_in_pool("pool-2").unwrap().len(), 1);
        assert!(store.list_hosts_in_pool("pool-3").unwrap().is_empty());
    }

    // ── VM CRUD ────────────────────────────────────────────────────

    #[test]
    fn vm_lifecycle() {
        let store = StateStore::open_in_memory().unwrap();
        let vm = VirtualMachine {
            id: "vm-1".to_string(),
            host_id: "host-1".to_string(),
            pool_id: "pool-1".to_string(),
            instance_id: "i-1".to_string(),
            reservation: Capacity {
                cpu_cores: 4,
                memory_gb: 8,
                storage_gb: 100,
                gpu_count: 0,
            },
            created_at: 1000,
        };

        store.put_vm(&vm).unwrap();
        assert_eq!(store.get_vm("vm-1").unwrap(), Some(vm));
        assert_eq!(store.list_vms_on_host("host-1").unwrap().len(), 1);

        assert!(store.delete_vm("vm-1").unwrap());
        assert!(!store.delete_vm("vm-1").unwrap());
        assert!(store.get_vm("vm-1").unwrap().is_none());
    }

    // ── IP address CRUD ────────────────────────────────────────────

    #[test]
    fn ip_rows_iterate_in_address_order() {
        let store = StateStore::open_in_memory().unwrap();
        // Insert out of order; scan must come back ascending.
        store.put_ip(&test_ip("ipp-1", 200)).unwrap();
        store.put_ip(&test_ip("ipp-1", 3)).unwrap();
        store.put_ip(&test_ip("ipp-1", 47)).unwrap();

        let rows = store.list_ips_in_pool("ipp-1").unwrap();
        let octets: Vec<u8> = rows.iter().map(|r| r.address.octets()[3]).collect();
        assert_eq!(octets, vec![3, 47, 200]);
    }

    #[test]
    fn put_ips_bulk_and_filter_by_instance() {
        let store = StateStore::open_in_memory().unwrap();
        let mut rows: Vec<IpAddress> = (1..=5).map(|i| test_ip("ipp-1", i)).collect();
        rows[2].status = IpStatus::Allocated;
        rows[2].instance_id = Some("i-9".to_string());
        store.put_ips(&rows).unwrap();

        assert_eq!(store.list_ips_in_pool("ipp-1").unwrap().len(), 5);
        let bound = store.list_ips_for_instance("i-9").unwrap();
        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].address, Ipv4Addr::new(10, 0, 0, 3));
    }

    // ── Quota CRUD ─────────────────────────────────────────────────

    #[test]
    fn quota_scopes_are_independent() {
        let store = StateStore::open_in_memory().unwrap();
        let tenant_quota = QuotaConfig {
            max_instances: Some(10),
            ..Default::default()
        };
        let user_quota = QuotaConfig {
            max_instances: Some(3),
            ..Default::default()
        };

        store.put_quota(QuotaScope::Tenant, "acme", &tenant_quota).unwrap();
        store.put_quota(QuotaScope::User, "acme", &user_quota).unwrap();

        assert_eq!(
            store.get_quota(QuotaScope::Tenant, "acme").unwrap(),
            Some(tenant_quota)
        );
        assert_eq!(
            store.get_quota(QuotaScope::User, "acme").unwrap(),
            Some(user_quota)
        );
        assert!(store.get_quota(QuotaScope::User, "other").unwrap().is_none());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_instance(&test_instance("i-1")).unwrap();
            store.put_host(&test_host("pool-1", "host-1")).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        assert!(store.get_instance("i-1").unwrap().is_some());
        assert!(store.get_host("pool-1", "host-1").unwrap().is_some());
    }

    // ── Edge cases ─────────────────────────────────────────────────

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_instances().unwrap().is_empty());
        assert!(store.list_pools().unwrap().is_empty());
        assert!(store.list_ip_pools().unwrap().is_empty());
        assert!(store.list_ips_in_pool("any").unwrap().is_empty());
        assert!(store.list_ips_for_instance("any").unwrap().is_empty());
        assert!(!store.delete_instance("nope").unwrap());
        assert!(!store.delete_host("nope", "nope").unwrap());
    }
}
