//
// Copyright 2026 Chat Core Contributors
// SPDX-License-Identifier: Apache-2.0
//

//! Peer-to-peer session control core for a real-time chat/media SDK.
//!
//! This crate owns signaling message encoding, remote capability
//! detection, the session state machine, and the stream/message buffers
//! and observer dispatch that sit around it. It does not itself speak
//! WebRTC, SDP or ICE: those live behind the [`core::engine::PeerEngine`]
//! trait, which an embedding application backs with a native engine (or,
//! for tests, the in-process [`core::sim`] implementation behind the
//! `sim` feature).

pub mod config;
pub mod core;
pub mod error;

pub use config::ChannelConfig;
pub use core::buffers::{StreamBuffers, TextMessageBuffer};
pub use core::capability::Capabilities;
pub use core::channel::{Channel, SessionState, SignalingSender};
pub use core::engine::{EngineEvent, EngineEventSink, PeerEngine, SessionDescription};
pub use core::media::{ConnectionStats, LocalStream, LocalTrack, RemoteStream, TrackKind};
pub use core::observer::Observer;
pub use core::signaling::{Message, Signal, TrackSource, TrackSourceEntry, UserAgent};
pub use error::{ChannelError, Result};
