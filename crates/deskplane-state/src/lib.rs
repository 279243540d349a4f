//! deskplane-state — embedded state store for DeskPlane.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for instances, hosts, virtual machines, resource pools,
//! datacenters, IP pools, IP addresses, and quota configs.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{pool_id}:{host_id}`, `{ip_pool_id}:{address}`) enable
//! efficient prefix scans for related records. IP address keys embed the
//! zero-padded numeric form of the address so iteration order is ascending
//! address order.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{GuardedUpdate, StateStore};
pub use types::*;
