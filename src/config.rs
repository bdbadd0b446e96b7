//
// Copyright 2026 Chat Core Contributors
// SPDX-License-Identifier: Apache-2.0
//

//! Channel tunables, handed in by the embedding application rather than
//! read from a file or environment by the crate itself.

use std::time::Duration;

/// Configuration shared by every channel a [`crate::core::channel::Channel`]
/// factory creates.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Grace period after an ICE disconnect before the channel gives up and
    /// stops the session. Default matches the source's hard-coded value.
    pub reconnect_timeout: Duration,

    /// Label used for the single data channel each session creates.
    pub data_channel_label: String,

    /// Optional cap applied to freshly-created local descriptions.
    pub max_outgoing_bitrate_kbps: Option<u32>,

    /// Optional cap applied to freshly-created local descriptions.
    pub max_outgoing_framerate: Option<u32>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            reconnect_timeout: Duration::from_secs(10),
            data_channel_label: "message".to_string(),
            max_outgoing_bitrate_kbps: None,
            max_outgoing_framerate: None,
        }
    }
}
