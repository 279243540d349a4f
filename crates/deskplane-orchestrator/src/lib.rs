//! deskplane-orchestrator — the instance lifecycle engine.
//!
//! Drives the instance state machine and composes the other subsystems:
//!
//! ```text
//! InstanceLifecycleManager
//!   ├── QuotaEnforcer (admission before any commit)
//!   ├── HostScheduler (placement + release)
//!   ├── IpAllocator (network identity for placed instances)
//!   ├── ImageCatalog / TemplateCatalog (read-only, external)
//!   └── DiskAttacher (best-effort, fire-and-forget after start)
//! ```
//!
//! `create` only validates and persists a stopped, unallocated record.
//! `start` is the orchestration point: quota admission, placement, IP
//! provisioning, then RUNNING — any failure unwinds the instance to
//! STOPPED with cleared bindings and compensating releases. `stop`
//! releases the placement and the instance's addresses.

pub mod catalog;
pub mod error;
pub mod lifecycle;

pub use catalog::{
    DiskAttacher, ImageCatalog, ImageMinimums, NoopDiskAttacher, StaticCatalog, TemplateCatalog,
};
pub use error::{OrchestratorError, OrchestratorResult};
pub use lifecycle::{CreateInstanceRequest, InstanceLifecycleManager, SpecRequest};
