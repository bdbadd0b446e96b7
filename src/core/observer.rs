//
// Copyright 2026 Chat Core Contributors
// SPDX-License-Identifier: Apache-2.0
//

//! Lifecycle callbacks fanned out to registered observers. Every callback
//! here, and every user-provided `on_success`/`on_failure`, runs on the
//! channel's dedicated event executor thread — never on the caller thread,
//! the signaling delivery thread, or the engine worker thread.

use crate::core::media::RemoteStream;

/// Observes the lifecycle of a single channel. Mutating the channel's
/// observer set (`add_observer`/`remove_observer`) from within one of these
/// callbacks is not supported, matching the source's single-threaded,
/// registration-order dispatch.
pub trait Observer: Send + Sync {
    fn on_invited(&self, _remote_id: &str) {}
    fn on_accepted(&self, _remote_id: &str) {}
    fn on_denied(&self, _remote_id: &str) {}
    fn on_started(&self, _remote_id: &str) {}
    fn on_stopped(&self, _remote_id: &str) {}
    fn on_stream_added(&self, _stream: &RemoteStream) {}
    fn on_stream_removed(&self, _stream: &RemoteStream) {}
    fn on_data(&self, _remote_id: &str, _message: &[u8]) {}
}
