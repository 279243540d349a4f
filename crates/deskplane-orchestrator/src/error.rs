//! Orchestrator error taxonomy.
//!
//! Validation errors (NotFound / InvalidState / InvalidRequest / quota)
//! are raised before any mutation. Exhaustion and conflicts surface from
//! the atomic commit steps with no partial state left behind.

use deskplane_ipam::IpamError;
use deskplane_quota::QuotaError;
use deskplane_scheduler::SchedulerError;
use deskplane_state::{InstanceStatus, StateError};
use thiserror::Error;

/// Errors surfaced by lifecycle operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("instance {instance_id} is {status:?}: cannot {op}")]
    InvalidState {
        instance_id: String,
        status: InstanceStatus,
        op: &'static str,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Ipam(#[from] IpamError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
