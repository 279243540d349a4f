//! InstanceLifecycleManager — the orchestration point for instance
//! state transitions.
//!
//! Ordering contract for `start`: quota admission and the flip to
//! INITIALIZING happen under the admission lock; scheduler and IP counters
//! are only incremented by their owning components after that commit; any
//! later failure triggers synchronous compensating releases in the same
//! path before the error is surfaced. A failed start always leaves the
//! instance STOPPED with cleared bindings.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use deskplane_ipam::{AllocationRequest, IpAllocator};
use deskplane_quota::{DimensionUsage, QuotaEnforcer, ResourceDelta};
use deskplane_scheduler::{HostScheduler, Placement};
use deskplane_state::{
    GuardedUpdate, Instance, InstanceStatus, IpAddress, QuotaScope, RentalMode, ResourceSpec,
    StateStore,
};

use crate::catalog::{DiskAttacher, ImageCatalog, TemplateCatalog};
use crate::error::{OrchestratorError, OrchestratorResult};

/// Partial resource spec supplied at creation; template defaults fill the
/// gaps.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct SpecRequest {
    pub cpu_cores: Option<u32>,
    pub memory_gb: Option<u32>,
    pub storage_gb: Option<u64>,
    pub gpu_count: Option<u32>,
    pub bandwidth_gbps: Option<u32>,
    pub image_id: Option<String>,
    pub image_version_id: Option<String>,
}

/// Request to create a stopped, unallocated instance.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CreateInstanceRequest {
    pub tenant_id: String,
    pub user_id: String,
    pub template_id: Option<String>,
    #[serde(default)]
    pub spec: SpecRequest,
}

/// The orchestrator. Owns all Instance mutations; Host and IpAddress rows
/// are only touched through their owning components.
pub struct InstanceLifecycleManager {
    store: StateStore,
    quota: QuotaEnforcer,
    scheduler: Arc<HostScheduler>,
    ipam: Arc<IpAllocator>,
    images: Arc<dyn ImageCatalog>,
    templates: Arc<dyn TemplateCatalog>,
    disks: Arc<dyn DiskAttacher>,
    /// Serializes quota check-then-commit sections so two concurrent
    /// admissions cannot both pass against the same stale usage snapshot.
    admission: Mutex<()>,
}

impl InstanceLifecycleManager {
    pub fn new(
        store: StateStore,
        scheduler: Arc<HostScheduler>,
        ipam: Arc<IpAllocator>,
        images: Arc<dyn ImageCatalog>,
        templates: Arc<dyn TemplateCatalog>,
        disks: Arc<dyn DiskAttacher>,
    ) -> Self {
        let quota = QuotaEnforcer::new(store.clone());
        Self {
            store,
            quota,
            scheduler,
            ipam,
            images,
            templates,
            disks,
            admission: Mutex::new(()),
        }
    }

    // ── Create ─────────────────────────────────────────────────────

    /// Validate and persist a stopped, unallocated instance. No physical
    /// resource is committed here; only the count and storage quota
    /// dimensions are consumed.
    pub async fn create(&self, req: CreateInstanceRequest) -> OrchestratorResult<Instance> {
        let spec = self.resolve_spec(&req)?;
        self.check_image_minimums(&spec)?;

        let _admission = self.admission.lock().await;
        self.quota
            .admit(&req.tenant_id, &req.user_id, &ResourceDelta::for_create(&spec))?;

        let now = epoch_secs();
        let instance = Instance {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: req.tenant_id,
            user_id: req.user_id,
            template_id: req.template_id,
            status: InstanceStatus::Stopped,
            rental_mode: None,
            resource_pool_id: None,
            host_id: None,
            virtual_machine_id: None,
            spec,
            created_at: now,
            updated_at: now,
        };
        self.store.put_instance(&instance)?;

        info!(
            instance = %instance.id,
            tenant = %instance.tenant_id,
            user = %instance.user_id,
            cpu = instance.spec.cpu_cores,
            memory_gb = instance.spec.memory_gb,
            "instance created"
        );
        Ok(instance)
    }

    // ── Start ──────────────────────────────────────────────────────

    /// Move an instance to RUNNING: quota admission, placement, IP
    /// provisioning, then the status flip. Fails back to STOPPED with
    /// cleared bindings if any step raises.
    pub async fn start(
        &self,
        instance_id: &str,
        pool_id: Option<&str>,
        mode: Option<RentalMode>,
    ) -> OrchestratorResult<Instance> {
        let instance = self.load(instance_id)?;
        match instance.status {
            // INITIALIZING here means a prior start died mid-flight.
            InstanceStatus::Stopped | InstanceStatus::Initializing => {}
            status => {
                return Err(OrchestratorError::InvalidState {
                    instance_id: instance_id.to_string(),
                    status,
                    op: "start",
                });
            }
        }

        let pool_id = pool_id
            .map(str::to_string)
            .or_else(|| instance.resource_pool_id.clone())
            .ok_or_else(|| {
                OrchestratorError::InvalidRequest("a resource pool is required to start".into())
            })?;
        let mode = mode.or(instance.rental_mode).unwrap_or(RentalMode::Shared);
        let pool = self
            .store
            .get_pool(&pool_id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("resource pool {pool_id}")))?;

        // Admission: the quota check and the flip to INITIALIZING (which
        // makes this instance's compute count toward usage) are one unit.
        {
            let _admission = self.admission.lock().await;
            self.quota.admit(
                &instance.tenant_id,
                &instance.user_id,
                &ResourceDelta::for_start(&instance.spec),
            )?;
            let outcome = self.store.update_instance_guarded(
                instance_id,
                |i| matches!(i.status, InstanceStatus::Stopped | InstanceStatus::Initializing),
                |i| {
                    i.status = InstanceStatus::Initializing;
                    i.rental_mode = Some(mode);
                    i.resource_pool_id = Some(pool_id.clone());
                    i.updated_at = epoch_secs();
                },
            )?;
            if let GuardedUpdate::Rejected(current) = outcome {
                return Err(OrchestratorError::Conflict(format!(
                    "instance {instance_id} moved to {:?} during start",
                    current.status
                )));
            }
        }

        // Placement. The scheduler's own per-pool lock makes the headroom
        // check and counter commit atomic.
        let placement = match self
            .scheduler
            .place(&pool_id, instance_id, mode, &instance.spec)
            .await
        {
            Ok(placement) => placement,
            Err(e) => {
                self.unwind_to_stopped(instance_id);
                return Err(e.into());
            }
        };

        if let Err(e) = self.record_binding(instance_id, &placement) {
            self.compensate_placement(&placement).await;
            self.unwind_to_stopped(instance_id);
            return Err(e);
        }

        // Network identity, if the pool carries an address space.
        if let Some(ip_pool_id) = &pool.ip_pool_id {
            if let Err(e) = self.provision_address(ip_pool_id, &instance).await {
                self.compensate_placement(&placement).await;
                self.unwind_to_stopped(instance_id);
                return Err(e);
            }
        }

        let running = match self.store.update_instance_guarded(
            instance_id,
            |i| i.status == InstanceStatus::Initializing,
            |i| {
                i.status = InstanceStatus::Running;
                i.updated_at = epoch_secs();
            },
        )? {
            GuardedUpdate::Applied(i) => i,
            GuardedUpdate::Rejected(current) => {
                self.release_network(instance_id).await;
                self.compensate_placement(&placement).await;
                self.unwind_to_stopped(instance_id);
                return Err(OrchestratorError::Conflict(format!(
                    "instance {instance_id} moved to {:?} during start",
                    current.status
                )));
            }
        };

        info!(
            instance = instance_id,
            pool = %pool_id,
            host = %placement.host_id,
            %mode,
            "instance running"
        );

        // Best-effort: attach previously-provisioned private disks. Failure
        // is logged, never propagated — the instance is already RUNNING.
        let disks = self.disks.clone();
        let attach_instance = running.id.clone();
        let attach_user = running.user_id.clone();
        tokio::spawn(async move {
            if let Err(e) = disks.auto_attach(&attach_instance, &attach_user).await {
                warn!(
                    instance = %attach_instance,
                    error = %e,
                    "disk auto-attach failed (non-fatal)"
                );
            }
        });

        Ok(running)
    }

    // ── Stop ───────────────────────────────────────────────────────

    /// Release the placement and network resources and return the
    /// instance to STOPPED. Stopping an already-STOPPED instance is a
    /// no-op returning the record unchanged.
    pub async fn stop(&self, instance_id: &str) -> OrchestratorResult<Instance> {
        let instance = self.load(instance_id)?;
        match instance.status {
            InstanceStatus::Stopped => {
                debug!(instance = instance_id, "already stopped, nothing to do");
                return Ok(instance);
            }
            InstanceStatus::Running | InstanceStatus::Suspended | InstanceStatus::Initializing => {}
            status => {
                return Err(OrchestratorError::InvalidState {
                    instance_id: instance_id.to_string(),
                    status,
                    op: "stop",
                });
            }
        }

        let stopping = match self.store.update_instance_guarded(
            instance_id,
            |i| {
                matches!(
                    i.status,
                    InstanceStatus::Running | InstanceStatus::Suspended | InstanceStatus::Initializing
                )
            },
            |i| {
                i.status = InstanceStatus::Stopping;
                i.updated_at = epoch_secs();
            },
        )? {
            GuardedUpdate::Applied(i) => i,
            // Lost a race against a concurrent stop that already finished.
            GuardedUpdate::Rejected(current) if current.status == InstanceStatus::Stopped => {
                return Ok(current);
            }
            GuardedUpdate::Rejected(current) => {
                return Err(OrchestratorError::Conflict(format!(
                    "instance {instance_id} moved to {:?} during stop",
                    current.status
                )));
            }
        };

        if let Some(placement) = binding_of(&stopping) {
            match self.scheduler.release(&placement).await {
                Ok(()) => {}
                // A half-recorded binding from a crashed start: nothing to
                // release, keep going so the instance still reaches STOPPED.
                Err(deskplane_scheduler::SchedulerError::VmNotFound(_))
                | Err(deskplane_scheduler::SchedulerError::HostNotFound(_)) => {
                    warn!(instance = instance_id, "placement binding already gone");
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.release_network(instance_id).await;

        match self.store.update_instance_guarded(
            instance_id,
            |i| i.status == InstanceStatus::Stopping,
            |i| {
                i.status = InstanceStatus::Stopped;
                i.clear_placement();
                i.updated_at = epoch_secs();
            },
        )? {
            GuardedUpdate::Applied(stopped) => {
                info!(instance = instance_id, "instance stopped");
                Ok(stopped)
            }
            GuardedUpdate::Rejected(current) => Err(OrchestratorError::Conflict(format!(
                "instance {instance_id} moved to {:?} during stop",
                current.status
            ))),
        }
    }

    // ── Delete ─────────────────────────────────────────────────────

    /// Soft-delete: stop first if needed, then move to the terminal
    /// DELETED status. The row is kept; the id is never reused.
    pub async fn delete(&self, instance_id: &str) -> OrchestratorResult<()> {
        let instance = self.load(instance_id)?;
        if instance.status == InstanceStatus::Deleted {
            return Ok(());
        }
        if matches!(
            instance.status,
            InstanceStatus::Running | InstanceStatus::Suspended | InstanceStatus::Initializing
        ) {
            self.stop(instance_id).await?;
        }

        let outcome = self.store.update_instance_guarded(
            instance_id,
            |i| matches!(i.status, InstanceStatus::Stopped | InstanceStatus::Creating),
            |i| {
                i.status = InstanceStatus::Terminating;
                i.updated_at = epoch_secs();
            },
        )?;
        if let GuardedUpdate::Rejected(current) = outcome {
            return Err(OrchestratorError::Conflict(format!(
                "instance {instance_id} moved to {:?} during delete",
                current.status
            )));
        }

        self.store.update_instance_guarded(
            instance_id,
            |i| i.status == InstanceStatus::Terminating,
            |i| {
                i.status = InstanceStatus::Deleted;
                i.updated_at = epoch_secs();
            },
        )?;
        info!(instance = instance_id, "instance deleted");
        Ok(())
    }

    // ── Address operations ─────────────────────────────────────────

    /// Allocate addresses for an instance, enforcing the address quota
    /// dimension at both scopes before touching the pool.
    pub async fn allocate_ip(
        &self,
        ip_pool_id: &str,
        instance_id: &str,
        request: AllocationRequest,
    ) -> OrchestratorResult<Vec<IpAddress>> {
        let instance = self.load(instance_id)?;
        if instance.status == InstanceStatus::Deleted {
            return Err(OrchestratorError::InvalidState {
                instance_id: instance_id.to_string(),
                status: instance.status,
                op: "allocate addresses for",
            });
        }

        let count = match request {
            AllocationRequest::Range { size } => u64::from(size),
            _ => 1,
        };

        let _admission = self.admission.lock().await;
        self.quota.admit(
            &instance.tenant_id,
            &instance.user_id,
            &ResourceDelta::for_addresses(count),
        )?;
        let rows = self
            .ipam
            .allocate(ip_pool_id, instance_id, &instance.user_id, request)
            .await?;
        Ok(rows)
    }

    /// Release a single address (or its whole range, if it is a range start).
    pub async fn release_ip(
        &self,
        ip_pool_id: &str,
        address: Ipv4Addr,
    ) -> OrchestratorResult<Vec<IpAddress>> {
        Ok(self.ipam.release(ip_pool_id, address).await?)
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn get_instance(&self, instance_id: &str) -> OrchestratorResult<Instance> {
        self.load(instance_id)
    }

    /// All non-deleted instances, optionally filtered by tenant.
    pub fn list_instances(&self, tenant_id: Option<&str>) -> OrchestratorResult<Vec<Instance>> {
        let instances = self.store.list_instances()?;
        Ok(instances
            .into_iter()
            .filter(|i| i.status != InstanceStatus::Deleted)
            .filter(|i| tenant_id.is_none_or(|t| i.tenant_id == t))
            .collect())
    }

    /// Per-dimension usage/cap report for a tenant or user.
    pub fn quota_usage(
        &self,
        scope: QuotaScope,
        subject: &str,
    ) -> OrchestratorResult<Vec<DimensionUsage>> {
        Ok(self.quota.usage_report(scope, subject)?)
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn load(&self, instance_id: &str) -> OrchestratorResult<Instance> {
        self.store
            .get_instance(instance_id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("instance {instance_id}")))
    }

    /// Merge the request spec with template defaults and validate the
    /// result is complete.
    fn resolve_spec(&self, req: &CreateInstanceRequest) -> OrchestratorResult<ResourceSpec> {
        let defaults = match &req.template_id {
            Some(template_id) => Some(self.templates.template_defaults(template_id).ok_or_else(
                || OrchestratorError::NotFound(format!("template {template_id}")),
            )?),
            None => None,
        };
        let d = defaults.as_ref();

        let spec = ResourceSpec {
            cpu_cores: req.spec.cpu_cores.or(d.map(|d| d.cpu_cores)).unwrap_or(0),
            memory_gb: req.spec.memory_gb.or(d.map(|d| d.memory_gb)).unwrap_or(0),
            storage_gb: req.spec.storage_gb.or(d.map(|d| d.storage_gb)).unwrap_or(0),
            gpu_count: req.spec.gpu_count.or(d.map(|d| d.gpu_count)).unwrap_or(0),
            bandwidth_gbps: req
                .spec
                .bandwidth_gbps
                .or(d.map(|d| d.bandwidth_gbps))
                .unwrap_or(0),
            image_id: req.spec.image_id.clone().or_else(|| d.and_then(|d| d.image_id.clone())),
            image_version_id: req
                .spec
                .image_version_id
                .clone()
                .or_else(|| d.and_then(|d| d.image_version_id.clone())),
        };

        if spec.cpu_cores == 0 || spec.memory_gb == 0 || spec.storage_gb == 0 {
            return Err(OrchestratorError::InvalidRequest(
                "cpu_cores, memory_gb, and storage_gb must be positive (directly or via template)"
                    .into(),
            ));
        }
        if spec.image_id.is_none() {
            return Err(OrchestratorError::InvalidRequest(
                "an image is required (directly or via template)".into(),
            ));
        }
        Ok(spec)
    }

    fn check_image_minimums(&self, spec: &ResourceSpec) -> OrchestratorResult<()> {
        let image_id = spec.image_id.as_deref().unwrap_or_default();
        let minimums = self
            .images
            .image_minimums(image_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("image {image_id}")))?;

        if spec.cpu_cores < minimums.min_cpu_cores
            || spec.memory_gb < minimums.min_memory_gb
            || spec.storage_gb < minimums.min_storage_gb
        {
            return Err(OrchestratorError::InvalidRequest(format!(
                "spec ({} cores / {} GiB mem / {} GiB storage) is below image {image_id} minimums \
                 ({} cores / {} GiB mem / {} GiB storage)",
                spec.cpu_cores,
                spec.memory_gb,
                spec.storage_gb,
                minimums.min_cpu_cores,
                minimums.min_memory_gb,
                minimums.min_storage_gb,
            )));
        }
        Ok(())
    }

    /// Write the host/VM binding onto the INITIALIZING instance.
    fn record_binding(&self, instance_id: &str, placement: &Placement) -> OrchestratorResult<()> {
        match self.store.update_instance_guarded(
            instance_id,
            |i| i.status == InstanceStatus::Initializing,
            |i| {
                i.host_id = Some(placement.host_id.clone());
                i.virtual_machine_id = placement.virtual_machine_id.clone();
            },
        )? {
            GuardedUpdate::Applied(_) => Ok(()),
            GuardedUpdate::Rejected(current) => Err(OrchestratorError::Conflict(format!(
                "instance {instance_id} moved to {:?} during start",
                current.status
            ))),
        }
    }

    /// Auto-allocate one address for a freshly-placed instance, enforcing
    /// the address quota dimension.
    async fn provision_address(
        &self,
        ip_pool_id: &str,
        instance: &Instance,
    ) -> OrchestratorResult<()> {
        let _admission = self.admission.lock().await;
        self.quota.admit(
            &instance.tenant_id,
            &instance.user_id,
            &ResourceDelta::for_addresses(1),
        )?;
        let rows = self
            .ipam
            .allocate(ip_pool_id, &instance.id, &instance.user_id, AllocationRequest::Auto)
            .await?;
        debug!(instance = %instance.id, address = %rows[0].address, "network identity attached");
        Ok(())
    }

    /// Compensating release for a committed placement on the failure path.
    /// A failure here is logged, not propagated — the caller is already
    /// surfacing the original error.
    async fn compensate_placement(&self, placement: &Placement) {
        if let Err(e) = self.scheduler.release(placement).await {
            error!(
                pool = %placement.pool_id,
                host = %placement.host_id,
                error = %e,
                "compensating release failed; reconciliation will correct the counters"
            );
        }
    }

    /// Release every address bound to the instance, logging failures.
    async fn release_network(&self, instance_id: &str) {
        match self.ipam.release_for_instance(instance_id).await {
            Ok(0) => {}
            Ok(count) => debug!(instance = instance_id, count, "addresses released"),
            Err(e) => error!(instance = instance_id, error = %e, "address release failed"),
        }
    }

    /// Restore STOPPED with cleared bindings after a failed start.
    fn unwind_to_stopped(&self, instance_id: &str) {
        let result = self.store.update_instance_guarded(
            instance_id,
            |_| true,
            |i| {
                i.status = InstanceStatus::Stopped;
                i.clear_placement();
                i.updated_at = epoch_secs();
            },
        );
        if let Err(e) = result {
            error!(instance = instance_id, error = %e, "failed to unwind instance to stopped");
        }
    }
}

/// Reconstruct the scheduler binding from an instance's placement fields.
fn binding_of(instance: &Instance) -> Option<Placement> {
    let pool_id = instance.resource_pool_id.clone()?;
    let host_id = instance.host_id.clone()?;
    let rental_mode = instance.rental_mode?;
    Some(Placement {
        pool_id,
        host_id,
        rental_mode,
        virtual_machine_id: instance.virtual_machine_id.clone(),
    })
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use deskplane_ipam::IpPoolConfig;
    use deskplane_scheduler::accountant;
    use deskplane_state::{
        AllocationStrategy, Capacity, Host, HostStatus, QuotaConfig,
    };

    use crate::catalog::{ImageMinimums, NoopDiskAttacher, StaticCatalog};

    const IMAGE: &str = "img-desktop";
    const TEMPLATE: &str = "tpl-standard";

    struct FailingDiskAttacher;

    #[async_trait]
    impl DiskAttacher for FailingDiskAttacher {
        async fn auto_attach(&self, _instance_id: &str, _user_id: &str) -> anyhow::Result<()> {
            anyhow::bail!("storage service unreachable")
        }
    }

    struct Harness {
        store: StateStore,
        manager: InstanceLifecycleManager,
        ipam: Arc<IpAllocator>,
        ip_pool_id: String,
    }

    fn template_spec() -> ResourceSpec {
        ResourceSpec {
            cpu_cores: 2,
            memory_gb: 4,
            storage_gb: 50,
            gpu_count: 0,
            bandwidth_gbps: 1,
            image_id: Some(IMAGE.to_string()),
            image_version_id: None,
        }
    }

    async fn harness_with_disks(disks: Arc<dyn DiskAttacher>) -> Harness {
        let store = StateStore::open_in_memory().unwrap();
        let scheduler = Arc::new(HostScheduler::new(store.clone()));
        let ipam = Arc::new(IpAllocator::new(store.clone()));

        let catalog = Arc::new(
            StaticCatalog::new()
                .with_image(
                    IMAGE,
                    ImageMinimums {
                        min_cpu_cores: 1,
                        min_memory_gb: 2,
                        min_storage_gb: 20,
                    },
                )
                .with_template(TEMPLATE, template_spec()),
        );

        // One datacenter, one pool with an address space, two hosts.
        let ip_pool = ipam
            .create_pool(IpPoolConfig {
                name: "desktop-net".to_string(),
                cidr: "10.20.0.0/24".to_string(),
                gateway: Some("10.20.0.1".parse().unwrap()),
                reserved: Vec::new(),
                strategy: AllocationStrategy::Sequential,
                allow_range: true,
            })
            .await
            .unwrap();
        accountant::register_datacenter(&store, "dc-1", "edge-east").unwrap();
        accountant::register_pool(&store, "pool-1", "dc-1", "general", Some(ip_pool.id.clone()))
            .unwrap();
        accountant::register_host(
            &store,
            Host {
                id: "host-shared".to_string(),
                pool_id: "pool-1".to_string(),
                rental_mode: RentalMode::Shared,
                status: HostStatus::Active,
                capacity: Capacity {
                    cpu_cores: 16,
                    memory_gb: 64,
                    storage_gb: 1000,
                    gpu_count: 0,
                },
                allocated: Capacity::default(),
            },
        )
        .unwrap();
        accountant::register_host(
            &store,
            Host {
                id: "host-exclusive".to_string(),
                pool_id: "pool-1".to_string(),
                rental_mode: RentalMode::Exclusive,
                status: HostStatus::Active,
                capacity: Capacity {
                    cpu_cores: 8,
                    memory_gb: 32,
                    storage_gb: 500,
                    gpu_count: 0,
                },
                allocated: Capacity::default(),
            },
        )
        .unwrap();

        let manager = InstanceLifecycleManager::new(
            store.clone(),
            scheduler,
            ipam.clone(),
            catalog.clone(),
            catalog,
            disks,
        );

        Harness {
            store,
            manager,
            ipam,
            ip_pool_id: ip_pool.id,
        }
    }

    async fn harness() -> Harness {
        harness_with_disks(Arc::new(NoopDiskAttacher)).await
    }

    fn create_request() -> CreateInstanceRequest {
        CreateInstanceRequest {
            tenant_id: "acme".to_string(),
            user_id: "alice".to_string(),
            template_id: Some(TEMPLATE.to_string()),
            spec: SpecRequest::default(),
        }
    }

    fn shared_host(h: &Harness) -> Host {
        h.store.get_host("pool-1", "host-shared").unwrap().unwrap()
    }

    // ── Create ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn create_fills_template_defaults() {
        let h = harness().await;
        let instance = h.manager.create(create_request()).await.unwrap();

        assert_eq!(instance.status, InstanceStatus::Stopped);
        assert_eq!(instance.spec, template_spec());
        assert!(instance.rental_mode.is_none());
        assert!(instance.host_id.is_none());
    }

    #[tokio::test]
    async fn create_request_overrides_template() {
        let h = harness().await;
        let mut req = create_request();
        req.spec.cpu_cores = Some(8);
        let instance = h.manager.create(req).await.unwrap();
        assert_eq!(instance.spec.cpu_cores, 8);
        assert_eq!(instance.spec.memory_gb, 4); // template default kept
    }

    #[tokio::test]
    async fn create_rejects_below_image_minimums() {
        let h = harness().await;
        let mut req = create_request();
        req.spec.memory_gb = Some(1); // image requires 2
        let result = h.manager.create(req).await;
        assert!(matches!(result, Err(OrchestratorError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn create_rejects_unknown_image() {
        let h = harness().await;
        let mut req = create_request();
        req.template_id = None;
        req.spec = SpecRequest {
            cpu_cores: Some(2),
            memory_gb: Some(4),
            storage_gb: Some(50),
            image_id: Some("img-ghost".to_string()),
            ..Default::default()
        };
        let result = h.manager.create(req).await;
        assert!(matches!(result, Err(OrchestratorError::NotFound(_))));
    }

    #[tokio::test]
    async fn create_rejects_incomplete_spec() {
        let h = harness().await;
        let mut req = create_request();
        req.template_id = None; // no defaults to fall back on
        req.spec.cpu_cores = Some(2);
        let result = h.manager.create(req).await;
        assert!(matches!(result, Err(OrchestratorError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn create_enforces_instance_count_quota() {
        let h = harness().await;
        h.store
            .put_quota(
                QuotaScope::User,
                "alice",
                &QuotaConfig {
                    max_instances: Some(1),
                    ..Default::default()
                },
            )
            .unwrap();

        h.manager.create(create_request()).await.unwrap();
        let result = h.manager.create(create_request()).await;
        assert!(matches!(result, Err(OrchestratorError::Quota(_))));
    }

    // ── Start ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn start_places_provisions_and_runs() {
        let h = harness().await;
        let created = h.manager.create(create_request()).await.unwrap();

        let running = h
            .manager
            .start(&created.id, Some("pool-1"), Some(RentalMode::Shared))
            .await
            .unwrap();

        assert_eq!(running.status, InstanceStatus::Running);
        assert_eq!(running.resource_pool_id.as_deref(), Some("pool-1"));
        assert_eq!(running.host_id.as_deref(), Some("host-shared"));
        assert!(running.virtual_machine_id.is_some());

        // Host counters hold exactly the spec.
        let host = shared_host(&h);
        assert_eq!(host.allocated.cpu_cores, 2);
        assert_eq!(host.allocated.memory_gb, 4);

        // One address allocated from the pool's address space.
        let ips = h.store.list_ips_for_instance(&created.id).unwrap();
        assert_eq!(ips.len(), 1);
        assert_eq!(ips[0].allocated_by.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn start_exclusive_takes_whole_host() {
        let h = harness().await;
        let created = h.manager.create(create_request()).await.unwrap();

        let running = h
            .manager
            .start(&created.id, Some("pool-1"), Some(RentalMode::Exclusive))
            .await
            .unwrap();

        assert_eq!(running.host_id.as_deref(), Some("host-exclusive"));
        assert!(running.virtual_machine_id.is_none());
        let host = h.store.get_host("pool-1", "host-exclusive").unwrap().unwrap();
        assert_eq!(host.allocated, host.capacity);
    }

    #[tokio::test]
    async fn start_requires_a_pool() {
        let h = harness().await;
        let created = h.manager.create(create_request()).await.unwrap();
        let result = h.manager.start(&created.id, None, None).await;
        assert!(matches!(result, Err(OrchestratorError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn start_unknown_instance_is_not_found() {
        let h = harness().await;
        let result = h.manager.start("ghost", Some("pool-1"), None).await;
        assert!(matches!(result, Err(OrchestratorError::NotFound(_))));
    }

    #[tokio::test]
    async fn start_running_instance_is_invalid_state() {
        let h = harness().await;
        let created = h.manager.create(create_request()).await.unwrap();
        h.manager
            .start(&created.id, Some("pool-1"), None)
            .await
            .unwrap();

        let result = h.manager.start(&created.id, Some("pool-1"), None).await;
        assert!(matches!(
            result,
            Err(OrchestratorError::InvalidState {
                status: InstanceStatus::Running,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn start_quota_rejection_leaves_instance_stopped() {
        let h = harness().await;
        h.store
            .put_quota(
                QuotaScope::Tenant,
                "acme",
                &QuotaConfig {
                    max_cpu_cores: Some(1), // spec needs 2
                    ..Default::default()
                },
            )
            .unwrap();
        let created = h.manager.create(create_request()).await.unwrap();

        let result = h.manager.start(&created.id, Some("pool-1"), None).await;
        assert!(matches!(result, Err(OrchestratorError::Quota(_))));

        let instance = h.store.get_instance(&created.id).unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Stopped);
        assert!(instance.host_id.is_none());
        assert!(shared_host(&h).allocated.is_zero());
    }

    #[tokio::test]
    async fn start_exhaustion_rolls_back_to_stopped() {
        let h = harness().await;
        let mut req = create_request();
        req.spec.cpu_cores = Some(64); // bigger than any host
        let created = h.manager.create(req).await.unwrap();

        let result = h.manager.start(&created.id, Some("pool-1"), None).await;
        assert!(matches!(result, Err(OrchestratorError::Scheduler(_))));

        let instance = h.store.get_instance(&created.id).unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Stopped);
        assert!(instance.rental_mode.is_none());
        assert!(instance.resource_pool_id.is_none());
        assert!(shared_host(&h).allocated.is_zero());
    }

    #[tokio::test]
    async fn start_ip_failure_releases_placement() {
        let h = harness().await;
        // Drain the address space so provisioning must fail.
        let usable = 254u16;
        h.ipam
            .allocate(
                &h.ip_pool_id,
                "squatter",
                "eve",
                AllocationRequest::Range { size: usable - 1 }, // gateway took one
            )
            .await
            .unwrap();

        let created = h.manager.create(create_request()).await.unwrap();
        let result = h.manager.start(&created.id, Some("pool-1"), None).await;
        assert!(matches!(result, Err(OrchestratorError::Ipam(_))));

        // The committed placement was compensated and the instance is
        // fully unwound.
        let instance = h.store.get_instance(&created.id).unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Stopped);
        assert!(instance.host_id.is_none());
        assert!(shared_host(&h).allocated.is_zero());
        assert!(h.store.list_ips_for_instance(&created.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_disk_attach_does_not_fail_start() {
        let h = harness_with_disks(Arc::new(FailingDiskAttacher)).await;
        let created = h.manager.create(create_request()).await.unwrap();

        let running = h
            .manager
            .start(&created.id, Some("pool-1"), None)
            .await
            .unwrap();
        assert_eq!(running.status, InstanceStatus::Running);
    }

    // ── Stop ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn stop_releases_placement_and_network() {
        let h = harness().await;
        let created = h.manager.create(create_request()).await.unwrap();
        let running = h
            .manager
            .start(&created.id, Some("pool-1"), None)
            .await
            .unwrap();
        let vm_id = running.virtual_machine_id.clone().unwrap();

        let stopped = h.manager.stop(&created.id).await.unwrap();

        assert_eq!(stopped.status, InstanceStatus::Stopped);
        assert!(stopped.host_id.is_none());
        assert!(stopped.virtual_machine_id.is_none());
        assert!(shared_host(&h).allocated.is_zero());
        assert!(h.store.get_vm(&vm_id).unwrap().is_none());
        assert!(h.store.list_ips_for_instance(&created.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_already_stopped_is_noop() {
        let h = harness().await;
        let created = h.manager.create(create_request()).await.unwrap();

        let stopped = h.manager.stop(&created.id).await.unwrap();
        assert_eq!(stopped, created);
        assert!(shared_host(&h).allocated.is_zero());
    }

    #[tokio::test]
    async fn stop_deleted_instance_is_invalid_state() {
        let h = harness().await;
        let created = h.manager.create(create_request()).await.unwrap();
        h.manager.delete(&created.id).await.unwrap();

        let result = h.manager.stop(&created.id).await;
        assert!(matches!(
            result,
            Err(OrchestratorError::InvalidState {
                status: InstanceStatus::Deleted,
                ..
            })
        ));
    }

    // ── Delete ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn delete_running_instance_stops_it_first() {
        let h = harness().await;
        let created = h.manager.create(create_request()).await.unwrap();
        h.manager
            .start(&created.id, Some("pool-1"), None)
            .await
            .unwrap();

        h.manager.delete(&created.id).await.unwrap();

        let instance = h.store.get_instance(&created.id).unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Deleted);
        assert!(shared_host(&h).allocated.is_zero());
        assert!(h.store.list_ips_for_instance(&created.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_keeps_the_row() {
        let h = harness().await;
        let created = h.manager.create(create_request()).await.unwrap();

        h.manager.delete(&created.id).await.unwrap();
        h.manager.delete(&created.id).await.unwrap();

        // Soft delete: the row survives in its terminal status.
        let instance = h.store.get_instance(&created.id).unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Deleted);
    }

    #[tokio::test]
    async fn deleted_instance_rejects_start() {
        let h = harness().await;
        let created = h.manager.create(create_request()).await.unwrap();
        h.manager.delete(&created.id).await.unwrap();

        let result = h.manager.start(&created.id, Some("pool-1"), None).await;
        assert!(matches!(
            result,
            Err(OrchestratorError::InvalidState {
                status: InstanceStatus::Deleted,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn deleted_instance_frees_quota() {
        let h = harness().await;
        h.store
            .put_quota(
                QuotaScope::User,
                "alice",
                &QuotaConfig {
                    max_instances: Some(1),
                    ..Default::default()
                },
            )
            .unwrap();

        let created = h.manager.create(create_request()).await.unwrap();
        h.manager.delete(&created.id).await.unwrap();

        // The slot is free again.
        assert!(h.manager.create(create_request()).await.is_ok());
    }

    // ── Address operations ─────────────────────────────────────────

    #[tokio::test]
    async fn allocate_ip_enforces_address_quota() {
        let h = harness().await;
        h.store
            .put_quota(
                QuotaScope::User,
                "alice",
                &QuotaConfig {
                    max_ip_addresses: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        let created = h.manager.create(create_request()).await.unwrap();

        h.manager
            .allocate_ip(&h.ip_pool_id, &created.id, AllocationRequest::Auto)
            .await
            .unwrap();
        // A 2-address range would land at 3 total.
        let result = h
            .manager
            .allocate_ip(&h.ip_pool_id, &created.id, AllocationRequest::Range { size: 2 })
            .await;
        assert!(matches!(result, Err(OrchestratorError::Quota(_))));
    }

    #[tokio::test]
    async fn list_instances_hides_deleted() {
        let h = harness().await;
        let a = h.manager.create(create_request()).await.unwrap();
        let _b = h.manager.create(create_request()).await.unwrap();
        h.manager.delete(&a.id).await.unwrap();

        assert_eq!(h.manager.list_instances(None).unwrap().len(), 1);
        assert_eq!(h.manager.list_instances(Some("acme")).unwrap().len(), 1);
        assert!(h.manager.list_instances(Some("other")).unwrap().is_empty());
    }
}
