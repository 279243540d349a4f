//! Quota error types.

use deskplane_state::{QuotaScope, StateError};
use thiserror::Error;

use crate::enforcer::QuotaDimension;

/// Errors that can occur during quota checks.
#[derive(Debug, Error)]
pub enum QuotaError {
    #[error(
        "{scope} {subject} quota exceeded on {dimension}: \
         using {usage}, requested {requested} more, cap {cap}"
    )]
    Exceeded {
        scope: QuotaScope,
        subject: String,
        dimension: QuotaDimension,
        usage: u64,
        requested: u64,
        cap: u64,
    },

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type QuotaResult<T> = Result<T, QuotaError>;
