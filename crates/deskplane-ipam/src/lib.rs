//! deskplane-ipam — IP address pool management for DeskPlane.
//!
//! Owns CIDR parsing, address-space materialization, and the
//! allocate/release/reserve/freeze state machine for individual addresses
//! and contiguous ranges.
//!
//! # Architecture
//!
//! A pool is derived from an IPv4 CIDR block: one AVAILABLE row per usable
//! address, with the gateway and configured reserved addresses marked
//! RESERVED instead. Rows are never deleted, only transitioned between
//! statuses. Allocation strategy (sequential / random / least_used) is
//! fixed per pool.
//!
//! The allocator is the only writer of IpAddress rows; a per-pool mutex is
//! held across the candidate search and the status commit.

pub mod allocator;
pub mod cidr;
pub mod error;

pub use allocator::{
    AllocationRequest, IpAllocator, IpPoolConfig, IpPoolStats, MAX_RANGE_SIZE,
};
pub use error::{IpamError, IpamResult};
