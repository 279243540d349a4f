//! Quota admission checks.
//!
//! Usage is always recomputed from the live instance set at check time —
//! nothing is cached. CPU, memory, and bandwidth count only while an
//! instance is in an active state; storage and the instance-count slot are
//! held until the instance is deleted.

use serde::{Deserialize, Serialize};
use tracing::debug;

use deskplane_state::{Instance, QuotaConfig, QuotaScope, ResourceSpec, StateStore};

use crate::error::{QuotaError, QuotaResult};

/// The independently-enforced quota dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaDimension {
    Instances,
    CpuCores,
    MemoryGb,
    StorageGb,
    BandwidthGbps,
    IpAddresses,
}

impl std::fmt::Display for QuotaDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Instances => write!(f, "instances"),
            Self::CpuCores => write!(f, "cpu_cores"),
            Self::MemoryGb => write!(f, "memory_gb"),
            Self::StorageGb => write!(f, "storage_gb"),
            Self::BandwidthGbps => write!(f, "bandwidth_gbps"),
            Self::IpAddresses => write!(f, "ip_addresses"),
        }
    }
}

/// A proposed consumption change, per dimension. Dimensions not touched by
/// an operation stay zero and are skipped by the check.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceDelta {
    pub instances: u64,
    pub cpu_cores: u64,
    pub memory_gb: u64,
    pub storage_gb: u64,
    pub bandwidth_gbps: u64,
    pub ip_addresses: u64,
}

impl ResourceDelta {
    /// Delta for creating a stopped, unallocated instance: one count slot
    /// plus its storage. Compute dimensions are not yet held.
    pub fn for_create(spec: &ResourceSpec) -> Self {
        Self {
            instances: 1,
            storage_gb: spec.storage_gb,
            ..Default::default()
        }
    }

    /// Delta for starting an instance: the compute dimensions that become
    /// held once the status leaves STOPPED. Count and storage are already
    /// attributed to the existing row.
    pub fn for_start(spec: &ResourceSpec) -> Self {
        Self {
            cpu_cores: u64::from(spec.cpu_cores),
            memory_gb: u64::from(spec.memory_gb),
            bandwidth_gbps: u64::from(spec.bandwidth_gbps),
            ..Default::default()
        }
    }

    /// Delta for allocating `count` IP addresses.
    pub fn for_addresses(count: u64) -> Self {
        Self {
            ip_addresses: count,
            ..Default::default()
        }
    }
}

/// Current consumption for one tenant or user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub instances: u64,
    pub cpu_cores: u64,
    pub memory_gb: u64,
    pub storage_gb: u64,
    pub bandwidth_gbps: u64,
    pub ip_addresses: u64,
}

/// One line of a usage report: a dimension, its usage, and its cap (if any).
#[derive(Debug, Clone, Serialize)]
pub struct DimensionUsage {
    pub dimension: QuotaDimension,
    pub used: u64,
    pub cap: Option<u64>,
}

/// Admission control over tenant- and user-level resource ceilings.
#[derive(Clone)]
pub struct QuotaEnforcer {
    store: StateStore,
}

impl QuotaEnforcer {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Compute current consumption for a tenant or user by summing over
    /// the live instance set and the allocated address rows.
    pub fn usage(&self, scope: QuotaScope, subject: &str) -> QuotaResult<QuotaUsage> {
        let instances = self.store.list_instances()?;
        let in_scope: Vec<&Instance> = instances
            .iter()
            .filter(|i| match scope {
                QuotaScope::Tenant => i.tenant_id == subject,
                QuotaScope::User => i.user_id == subject,
            })
            .collect();

        let mut usage = QuotaUsage::default();
        for inst in &in_scope {
            if inst.status.holds_storage() {
                usage.instances += 1;
                usage.storage_gb += inst.spec.storage_gb;
            }
            if inst.status.holds_compute() {
                usage.cpu_cores += u64::from(inst.spec.cpu_cores);
                usage.memory_gb += u64::from(inst.spec.memory_gb);
                usage.bandwidth_gbps += u64::from(inst.spec.bandwidth_gbps);
            }
        }

        // Addresses are attributed through the instance they are bound to.
        let owned: std::collections::HashSet<&str> = in_scope
            .iter()
            .filter(|i| i.status.holds_storage())
            .map(|i| i.id.as_str())
            .collect();
        for ip in self.store.list_allocated_ips()? {
            if ip
                .instance_id
                .as_deref()
                .is_some_and(|id| owned.contains(id))
            {
                usage.ip_addresses += 1;
            }
        }

        Ok(usage)
    }

    /// Check a proposed delta against one scope's configured ceilings.
    ///
    /// A subject with no quota config is unbounded. Dimensions with no
    /// configured cap are skipped; the first violated dimension rejects.
    pub fn check(
        &self,
        scope: QuotaScope,
        subject: &str,
        delta: &ResourceDelta,
    ) -> QuotaResult<()> {
        let Some(config) = self.store.get_quota(scope, subject)? else {
            return Ok(());
        };
        let usage = self.usage(scope, subject)?;

        let checks: [(QuotaDimension, u64, u64, Option<u64>); 6] = [
            (
                QuotaDimension::Instances,
                usage.instances,
                delta.instances,
                config.max_instances.map(u64::from),
            ),
            (
                QuotaDimension::CpuCores,
                usage.cpu_cores,
                delta.cpu_cores,
                config.max_cpu_cores.map(u64::from),
            ),
            (
                QuotaDimension::MemoryGb,
                usage.memory_gb,
                delta.memory_gb,
                config.max_memory_gb.map(u64::from),
            ),
            (
                QuotaDimension::StorageGb,
                usage.storage_gb,
                delta.storage_gb,
                config.max_storage_gb,
            ),
            (
                QuotaDimension::BandwidthGbps,
                usage.bandwidth_gbps,
                delta.bandwidth_gbps,
                config.max_bandwidth_gbps.map(u64::from),
            ),
            (
                QuotaDimension::IpAddresses,
                usage.ip_addresses,
                delta.ip_addresses,
                config.max_ip_addresses.map(u64::from),
            ),
        ];

        for (dimension, used, requested, cap) in checks {
            let Some(cap) = cap else { continue };
            if used + requested > cap {
                debug!(
                    %scope, subject, %dimension, used, requested, cap,
                    "quota check rejected"
                );
                return Err(QuotaError::Exceeded {
                    scope,
                    subject: subject.to_string(),
                    dimension,
                    usage: used,
                    requested,
                    cap,
                });
            }
        }
        Ok(())
    }

    /// Admit a delta against both the user's and the tenant's ceilings.
    /// Either scope may reject independently.
    pub fn admit(
        &self,
        tenant_id: &str,
        user_id: &str,
        delta: &ResourceDelta,
    ) -> QuotaResult<()> {
        self.check(QuotaScope::User, user_id, delta)?;
        self.check(QuotaScope::Tenant, tenant_id, delta)?;
        Ok(())
    }

    /// Per-dimension usage report for one tenant or user, pairing each
    /// dimension's usage with its configured cap.
    pub fn usage_report(
        &self,
        scope: QuotaScope,
        subject: &str,
    ) -> QuotaResult<Vec<DimensionUsage>> {
        let usage = self.usage(scope, subject)?;
        let config = self
            .store
            .get_quota(scope, subject)?
            .unwrap_or(QuotaConfig::default());

        Ok(vec![
            DimensionUsage {
                dimension: QuotaDimension::Instances,
                used: usage.instances,
                cap: config.max_instances.map(u64::from),
            },
            DimensionUsage {
                dimension: QuotaDimension::CpuCores,
                used: usage.cpu_cores,
                cap: config.max_cpu_cores.map(u64::from),
            },
            DimensionUsage {
                dimension: QuotaDimension::MemoryGb,
                used: usage.memory_gb,
                cap: config.max_memory_gb.map(u64::from),
            },
            DimensionUsage {
                dimension: QuotaDimension::StorageGb,
                used: usage.storage_gb,
                cap: config.max_storage_gb,
            },
            DimensionUsage {
                dimension: QuotaDimension::BandwidthGbps,
                used: usage.bandwidth_gbps,
                cap: config.max_bandwidth_gbps.map(u64::from),
            },
            DimensionUsage {
                dimension: QuotaDimension::IpAddresses,
                used: usage.ip_addresses,
                cap: config.max_ip_addresses.map(u64::from),
            },
        ])
    }
}
