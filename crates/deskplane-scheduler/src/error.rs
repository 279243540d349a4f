//! Scheduler error types.

use deskplane_state::{RentalMode, StateError};
use thiserror::Error;

/// Errors that can occur during placement operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("resource pool not found: {0}")]
    PoolNotFound(String),

    #[error("datacenter not found: {0}")]
    DatacenterNotFound(String),

    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("virtual machine not found: {0}")]
    VmNotFound(String),

    #[error(
        "no {mode} host in pool {pool_id} can satisfy \
         {cpu_cores} cores / {memory_gb} GiB mem / {storage_gb} GiB storage / {gpu_count} gpu"
    )]
    Exhausted {
        pool_id: String,
        mode: RentalMode,
        cpu_cores: u32,
        memory_gb: u32,
        storage_gb: u64,
        gpu_count: u32,
    },

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
