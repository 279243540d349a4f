//! IPAM error types.

use std::net::Ipv4Addr;

use deskplane_state::{IpStatus, StateError};
use thiserror::Error;

/// Errors that can occur during IP pool operations.
#[derive(Debug, Error)]
pub enum IpamError {
    #[error("ip pool not found: {0}")]
    PoolNotFound(String),

    #[error("address not found in pool: {0}")]
    AddressNotFound(Ipv4Addr),

    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("cannot {op} address {address} in status {status}")]
    InvalidState {
        address: Ipv4Addr,
        status: IpStatus,
        op: &'static str,
    },

    #[error("pool {pool_id} has no available block of {requested} address(es)")]
    Exhausted { pool_id: String, requested: u16 },

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type IpamResult<T> = Result<T, IpamError>;
