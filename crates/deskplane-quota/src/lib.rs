//! deskplane-quota — hierarchical quota enforcement.
//!
//! Computes current consumption per tenant/user from the live instance set
//! and rejects proposed deltas that would exceed configured ceilings. Both
//! scopes are enforced independently; either may reject. The enforcer is
//! pure admission logic — reserving the admitted resources is the caller's
//! job, under the caller's admission lock.

pub mod enforcer;
pub mod error;

pub use enforcer::{
    DimensionUsage, QuotaDimension, QuotaEnforcer, QuotaUsage, ResourceDelta,
};
pub use error::{QuotaError, QuotaResult};
