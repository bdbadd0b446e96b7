//
// Copyright 2026 Chat Core Contributors
// SPDX-License-Identifier: Apache-2.0
//

//! The session control core: signaling codec, capability registry, engine
//! adapter, session state machine, stream/message buffers and observer
//! dispatch.

pub mod buffers;
pub mod capability;
pub mod channel;
pub mod engine;
pub mod executor;
pub mod media;
pub mod observer;
pub mod signaling;

#[cfg(any(test, feature = "sim"))]
pub mod sim;
