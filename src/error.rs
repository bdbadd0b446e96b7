//
// Copyright 2026 Chat Core Contributors
// SPDX-License-Identifier: Apache-2.0
//

//! Error taxonomy for the peer session control core.

use thiserror::Error;

use crate::core::channel::SessionState;

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Errors surfaced to a caller's `on_failure` callback. A poisoned channel
/// lock means a prior panic left state inconsistent; this crate treats that
/// as unrecoverable and panics at the lock site rather than surfacing a
/// fourth error kind callers would have no sane way to act on.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    /// The requested operation is not permitted in the channel's current
    /// session state.
    #[error("invalid operation for session state {0:?}")]
    InvalidState(SessionState),

    /// Duplicate publication, an unknown stream handed to `Unpublish`, or a
    /// signaling transport send failure.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The remote peer's capability flags forbid the requested operation.
    #[error("unsupported by remote capabilities: {0}")]
    UnsupportedMethod(String),
}
