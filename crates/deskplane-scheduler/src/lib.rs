//! deskplane-scheduler — host placement for DeskPlane.
//!
//! Implements the two rental modes:
//!
//! - **Exclusive**: a whole host dedicated to one instance, allocated
//!   all-or-nothing.
//! - **Shared**: first-fit bin-packing onto hosts scanned in ascending
//!   current-allocation order, tracked by VirtualMachine records.
//!
//! # Architecture
//!
//! ```text
//! HostScheduler
//!   ├── StateStore (read hosts, write hosts + virtual machines)
//!   ├── Per-pool mutex (serializes check-then-commit per pool)
//!   └── accountant (pool/datacenter aggregates + reconciliation)
//! ```
//!
//! The scheduler is the only writer of Host rows; the per-pool mutex is
//! held across the headroom check and the allocation commit so two
//! concurrent placements cannot both pass against the same stale snapshot.

pub mod accountant;
pub mod error;
pub mod scheduler;

pub use accountant::{ReconcileReport, reconcile_pool};
pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{HostScheduler, Placement};
