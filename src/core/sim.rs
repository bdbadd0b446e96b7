//
// Copyright 2026 Chat Core Contributors
// SPDX-License-Identifier: Apache-2.0
//

//! An in-process simulated [`PeerEngine`] and [`SignalingSender`] pair, so
//! the session state machine can be exercised end to end without a native
//! WebRTC build. Every call the state machine makes completes immediately
//! and successfully; there is no real SDP, ICE or media here, just enough
//! shape to drive the state machine's transitions deterministically.

use std::sync::{Arc, Mutex};

use crate::config::ChannelConfig;
use crate::core::channel::{Channel, SignalingSender};
use crate::core::engine::{
    DataChannelState, EngineEvent, EngineEventSink, IceConnectionState, PeerEngine, SdpKind,
    SessionDescription, SignalingState,
};
use crate::core::media::{ConnectionStats, LocalStream};
use crate::core::signaling::{RuntimeInfo, SdkInfo, UserAgent};

/// A [`PeerEngine`] that answers every call with an immediate, successful
/// event. SDP bodies are placeholder strings; nothing ever parses them.
pub struct SimEngine {
    sink: Arc<dyn EngineEventSink>,
    signaling_state: SignalingState,
}

impl SimEngine {
    pub fn new(sink: Arc<dyn EngineEventSink>) -> Self {
        Self {
            sink,
            signaling_state: SignalingState::Stable,
        }
    }
}

impl PeerEngine for SimEngine {
    fn initialize_peer_connection(&mut self) {}

    fn create_offer(&mut self) {
        self.sink.emit(EngineEvent::CreateSdpSuccess(SessionDescription {
            kind: SdpKind::Offer,
            sdp: "sim-offer-sdp".to_string(),
        }));
    }

    fn create_answer(&mut self) {
        self.sink.emit(EngineEvent::CreateSdpSuccess(SessionDescription {
            kind: SdpKind::Answer,
            sdp: "sim-answer-sdp".to_string(),
        }));
    }

    fn set_local_description(&mut self, desc: SessionDescription) {
        self.signaling_state = match desc.kind {
            SdpKind::Offer => SignalingState::HaveLocalOffer,
            SdpKind::Answer => SignalingState::Stable,
        };
        self.sink
            .emit(EngineEvent::SignalingStateChanged(self.signaling_state));
        self.sink.emit(EngineEvent::SetLocalSdpSuccess);
        if desc.kind == SdpKind::Answer {
            self.sink
                .emit(EngineEvent::IceConnectionStateChanged(IceConnectionState::Connected));
        }
    }

    fn set_remote_description(&mut self, desc: SessionDescription) {
        self.signaling_state = match desc.kind {
            SdpKind::Offer => SignalingState::HaveRemoteOffer,
            SdpKind::Answer => SignalingState::Stable,
        };
        self.sink
            .emit(EngineEvent::SignalingStateChanged(self.signaling_state));
        self.sink.emit(EngineEvent::SetRemoteSdpSuccess);
        if desc.kind == SdpKind::Answer {
            self.sink
                .emit(EngineEvent::IceConnectionStateChanged(IceConnectionState::Connected));
        }
    }

    fn add_ice_candidate(&mut self, _sdp_mid: &str, _sdp_mline_index: i32, _candidate: &str) {}

    /// `AddStream`/`RemoveStream` describe a *remote* stream surfacing
    /// locally after an SDP exchange; this simulated engine does not model
    /// cross-peer media propagation, so a local publish has no observable
    /// effect here beyond the call succeeding.
    fn add_stream(&mut self, _stream: &LocalStream) {}

    fn remove_stream(&mut self, _stream: &LocalStream) {}

    fn create_data_channel(&mut self, _label: &str) {
        self.sink
            .emit(EngineEvent::DataChannelStateChanged(DataChannelState::Open));
    }

    fn send_data_channel_message(&mut self, data: &[u8]) {
        self.sink.emit(EngineEvent::DataChannelMessage(data.to_vec()));
    }

    fn close_peer_connection(&mut self) {
        self.signaling_state = SignalingState::Closed;
        self.sink
            .emit(EngineEvent::IceConnectionStateChanged(IceConnectionState::Closed));
    }

    fn get_stats(&mut self, callback: Box<dyn FnOnce(ConnectionStats) + Send>) {
        callback(ConnectionStats::default());
    }

    fn signaling_state(&self) -> SignalingState {
        self.signaling_state
    }
}

/// Routes encoded signaling messages straight into the other end's
/// `on_incoming_signaling_message`, bypassing any real transport. The peer
/// handle is filled in after both channels exist (see [`simulated_pair`]).
pub struct SimSignalingSender {
    peer: Arc<Mutex<Option<Channel>>>,
}

impl SimSignalingSender {
    fn new() -> (Self, Arc<Mutex<Option<Channel>>>) {
        let peer = Arc::new(Mutex::new(None));
        (
            Self {
                peer: peer.clone(),
            },
            peer,
        )
    }
}

impl SignalingSender for SimSignalingSender {
    fn send(
        &mut self,
        message: String,
        _remote_id: &str,
        on_success: Box<dyn FnOnce() + Send>,
        _on_failure: Box<dyn FnOnce(i32) + Send>,
    ) {
        if let Some(peer) = self.peer.lock().expect("sim peer lock").as_ref() {
            peer.on_incoming_signaling_message(&message);
        }
        on_success();
    }
}

fn sim_ua(runtime_name: &str) -> UserAgent {
    UserAgent {
        sdk: SdkInfo {
            kind: "chatrtc-sim".to_string(),
            version: "0.0.0".to_string(),
        },
        runtime: RuntimeInfo {
            name: runtime_name.to_string(),
            version: "1".to_string(),
        },
    }
}

/// Builds two fully-wired [`Channel`]s, `a` (identified as `a_id`) and `b`
/// (identified as `b_id`), each other's remote, each backed by a
/// [`SimEngine`] and linked by a [`SimSignalingSender`] pair.
pub fn simulated_pair(
    a_id: impl Into<String>,
    b_id: impl Into<String>,
    config: ChannelConfig,
) -> (Channel, Channel) {
    simulated_pair_with_runtimes(a_id, b_id, "chatrtc-sim", "chatrtc-sim", config)
}

/// Like [`simulated_pair`], but lets each side advertise a specific UA
/// runtime name (e.g. `"FireFox"`), so tests can exercise capability
/// classification (see [`crate::core::capability::Capabilities::classify`]).
pub fn simulated_pair_with_runtimes(
    a_id: impl Into<String>,
    b_id: impl Into<String>,
    a_runtime: &str,
    b_runtime: &str,
    config: ChannelConfig,
) -> (Channel, Channel) {
    let a_id = a_id.into();
    let b_id = b_id.into();

    let (sender_a, slot_a) = SimSignalingSender::new();
    let (sender_b, slot_b) = SimSignalingSender::new();

    let channel_a = Channel::new(
        a_id.clone(),
        b_id.clone(),
        sim_ua(a_runtime),
        config.clone(),
        Box::new(sender_a),
        |sink| Box::new(SimEngine::new(sink)),
    );
    let channel_b = Channel::new(
        b_id.clone(),
        a_id,
        sim_ua(b_runtime),
        config,
        Box::new(sender_b),
        |sink| Box::new(SimEngine::new(sink)),
    );

    *slot_a.lock().expect("sim peer lock") = Some(channel_b.clone());
    *slot_b.lock().expect("sim peer lock") = Some(channel_a.clone());

    (channel_a, channel_b)
}
