//
// Copyright 2026 Chat Core Contributors
// SPDX-License-Identifier: Apache-2.0
//

//! Abstracts the native WebRTC engine behind a small capability set, and
//! serializes every call to it onto a dedicated worker thread so the state
//! machine never has to reason about concurrent engine mutation.

use std::sync::{Arc, Mutex};

use crate::core::executor::SerialExecutor;
use crate::core::media::{ConnectionStats, LocalStream};

/// A local or remote SDP session description.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// The engine's view of SDP negotiation progress. `Stable` is the only
/// state in which a new offer may be created or a deferred remote offer
/// applied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// ICE connectivity as reported by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Data channel readiness as reported by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Events the engine emits back to the core, always delivered via
/// [`EngineEventSink::emit`].
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    SignalingStateChanged(SignalingState),
    IceConnectionStateChanged(IceConnectionState),
    IceCandidate {
        sdp_mid: String,
        sdp_mline_index: i32,
        candidate: String,
    },
    AddStream {
        label: String,
        track_ids: Vec<String>,
    },
    RemoveStream {
        label: String,
    },
    DataChannelStateChanged(DataChannelState),
    DataChannelMessage(Vec<u8>),
    RenegotiationNeeded,
    CreateSdpSuccess(SessionDescription),
    CreateSdpFailure(String),
    SetLocalSdpSuccess,
    SetLocalSdpFailure(String),
    SetRemoteSdpSuccess,
    SetRemoteSdpFailure(String),
}

/// Receives events emitted by a [`PeerEngine`] implementation, from
/// whatever thread the underlying native engine calls back on.
pub trait EngineEventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// The capability set an implementation must provide to back a channel.
/// All out-of-scope media/codec/ICE machinery lives behind this trait; the
/// core only ever drives it through these methods and reacts to
/// [`EngineEvent`]s.
pub trait PeerEngine: Send {
    /// Idempotent within a session.
    fn initialize_peer_connection(&mut self);
    fn create_offer(&mut self);
    fn create_answer(&mut self);
    fn set_local_description(&mut self, desc: SessionDescription);
    fn set_remote_description(&mut self, desc: SessionDescription);
    fn add_ice_candidate(&mut self, sdp_mid: &str, sdp_mline_index: i32, candidate: &str);
    /// Only valid while `signaling_state() == Stable`; callers are
    /// responsible for that check (see `DrainPendingStreams`).
    fn add_stream(&mut self, stream: &LocalStream);
    fn remove_stream(&mut self, stream: &LocalStream);
    fn create_data_channel(&mut self, label: &str);
    fn send_data_channel_message(&mut self, data: &[u8]);
    fn close_peer_connection(&mut self);
    /// Asynchronous; the implementation invokes `callback` once stats are
    /// available, from whatever thread it pleases (the adapter does not
    /// re-serialize the callback itself — callers posting through
    /// [`EngineAdapter::post`] are expected to forward it onward).
    fn get_stats(&mut self, callback: Box<dyn FnOnce(ConnectionStats) + Send>);
    fn signaling_state(&self) -> SignalingState;
}

/// Serializes calls onto the engine's worker thread and owns the boxed
/// engine for the lifetime of the channel.
pub struct EngineAdapter {
    worker: SerialExecutor,
    engine: Arc<Mutex<Box<dyn PeerEngine>>>,
}

impl EngineAdapter {
    pub fn new(engine: Box<dyn PeerEngine>, worker_name: impl Into<String>) -> Self {
        Self {
            worker: SerialExecutor::new(worker_name),
            engine: Arc::new(Mutex::new(engine)),
        }
    }

    /// Posts a closure to run on the engine worker thread with exclusive
    /// access to the underlying [`PeerEngine`].
    pub fn post(&self, f: impl FnOnce(&mut dyn PeerEngine) + Send + 'static) {
        let engine = self.engine.clone();
        self.worker.post(move || match engine.lock() {
            Ok(mut guard) => f(&mut **guard),
            Err(_) => log::error!("engine worker mutex poisoned, dropping posted command"),
        });
    }

    /// Synchronously reads the engine's signaling state by locking the same
    /// mutex [`EngineAdapter::post`] locks for the duration of a posted
    /// closure.
    ///
    /// Safety/deadlock note: a [`PeerEngine`] implementation is free to call
    /// [`EngineEventSink::emit`] synchronously from inside one of its own
    /// methods (a real WebRTC engine fires `OnRenegotiationNeeded`
    /// synchronously during `AddTrack`/`SetLocalDescription`, and
    /// [`crate::core::sim::SimEngine`] mirrors that). Such an `emit` runs on
    /// the engine worker thread while the closure passed to `post` is still
    /// holding this same mutex. Calling this method from an
    /// [`EngineEvent`] handler reached that way re-locks a non-reentrant
    /// `std::sync::Mutex` on the thread already holding it and deadlocks
    /// permanently. Event handlers must instead consult the signaling state
    /// the channel mirrors in its own state under
    /// [`EngineEvent::SignalingStateChanged`]; this method is only safe to
    /// call from a thread that is not itself inside a `PeerEngine` callback
    /// for this adapter (e.g. a caller thread invoking the public API).
    pub fn signaling_state(&self) -> SignalingState {
        match self.engine.lock() {
            Ok(guard) => guard.signaling_state(),
            Err(_) => {
                log::error!("engine worker mutex poisoned, assuming Closed");
                SignalingState::Closed
            }
        }
    }
}
