//
// Copyright 2026 Chat Core Contributors
// SPDX-License-Identifier: Apache-2.0
//

//! Local/remote media stream handles as seen by the session state machine.
//! The actual capture, encode and transport live in the engine; the core
//! only needs labels, track ids, and enough shape to classify sources.

use crate::core::signaling::TrackSource;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A local media track handed to `Publish`.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// A local media stream handed to `Publish`/`Unpublish`.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalStream {
    pub label: String,
    pub tracks: Vec<LocalTrack>,
    /// True when this stream captures a screen rather than a camera/mic.
    pub is_screen_cast: bool,
}

impl LocalStream {
    /// The source label to announce for this stream's audio track, if any.
    pub fn audio_source(&self) -> Option<TrackSource> {
        self.tracks
            .iter()
            .any(|t| t.kind == TrackKind::Audio)
            .then_some(if self.is_screen_cast {
                TrackSource::ScreenCast
            } else {
                TrackSource::Mic
            })
    }

    /// The source label to announce for this stream's video track, if any.
    pub fn video_source(&self) -> Option<TrackSource> {
        self.tracks
            .iter()
            .any(|t| t.kind == TrackKind::Video)
            .then_some(if self.is_screen_cast {
                TrackSource::ScreenCast
            } else {
                TrackSource::Camera
            })
    }
}

/// A remote media stream surfaced to observers once its tracks have been
/// classified via a prior `chat-track-sources` message.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteStream {
    pub label: String,
    pub source: TrackSource,
    pub track_ids: Vec<String>,
}

/// Opaque connection statistics returned by `GetConnectionStats`. The
/// engine owns the real shape of this data; the core only ferries it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectionStats {
    pub raw: serde_json::Value,
}
