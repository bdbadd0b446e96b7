//
// Copyright 2026 Chat Core Contributors
// SPDX-License-Identifier: Apache-2.0
//

//! Buffers for pending publish/unpublish intents and pending outgoing text
//! messages. Each buffer is guarded by its own mutex; callers must never
//! hold two of these locks at once (drain routines release between
//! phases), matching the independent-mutex discipline of the source.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use crate::core::media::LocalStream;

/// The set of stream labels currently considered published, plus the
/// publish/unpublish queues awaiting an engine drain.
#[derive(Default)]
pub struct StreamBuffers {
    published: Mutex<HashSet<String>>,
    pending_publish: Mutex<VecDeque<LocalStream>>,
    pending_unpublish: Mutex<VecDeque<LocalStream>>,
}

impl StreamBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_published(&self, label: &str) -> bool {
        self.published.lock().expect("published lock").contains(label)
    }

    pub fn published_count(&self) -> usize {
        self.published.lock().expect("published lock").len()
    }

    pub fn pending_publish_count(&self) -> usize {
        self.pending_publish
            .lock()
            .expect("pending publish lock")
            .len()
    }

    /// Marks `label` published and enqueues `stream` for draining.
    /// Mirrors the source's ordering: the label is visible in the published
    /// set before the stream is ever handed to the engine.
    pub fn enqueue_publish(&self, stream: LocalStream) {
        self.published
            .lock()
            .expect("published lock")
            .insert(stream.label.clone());
        self.pending_publish
            .lock()
            .expect("pending publish lock")
            .push_back(stream);
    }

    /// Unmarks `label` and enqueues it for an engine `remove_stream` call.
    /// Returns false if `label` was not published.
    pub fn enqueue_unpublish(&self, stream: LocalStream) -> bool {
        let removed = self
            .published
            .lock()
            .expect("published lock")
            .remove(&stream.label);
        if removed {
            self.pending_unpublish
                .lock()
                .expect("pending unpublish lock")
                .push_back(stream);
        }
        removed
    }

    /// Drains both queues, returning their contents in FIFO order. Each
    /// lock is held only long enough to swap out its queue.
    pub fn drain(&self) -> (Vec<LocalStream>, Vec<LocalStream>) {
        let publishes = {
            let mut guard = self.pending_publish.lock().expect("pending publish lock");
            std::mem::take(&mut *guard).into_iter().collect()
        };
        let unpublishes = {
            let mut guard = self
                .pending_unpublish
                .lock()
                .expect("pending unpublish lock");
            std::mem::take(&mut *guard).into_iter().collect()
        };
        (publishes, unpublishes)
    }

    pub fn has_pending(&self) -> bool {
        !self
            .pending_publish
            .lock()
            .expect("pending publish lock")
            .is_empty()
            || !self
                .pending_unpublish
                .lock()
                .expect("pending unpublish lock")
                .is_empty()
    }
}

/// Text messages queued for the data channel until it exists and is open.
#[derive(Default)]
pub struct TextMessageBuffer {
    pending: Mutex<VecDeque<String>>,
}

impl TextMessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: String) {
        self.pending.lock().expect("pending messages lock").push_back(message);
    }

    pub fn drain(&self) -> Vec<String> {
        let mut guard = self.pending.lock().expect("pending messages lock");
        std::mem::take(&mut *guard).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::media::TrackKind;

    fn stream(label: &str) -> LocalStream {
        LocalStream {
            label: label.to_string(),
            tracks: vec![crate::core::media::LocalTrack {
                id: format!("{label}-audio"),
                kind: TrackKind::Audio,
            }],
            is_screen_cast: false,
        }
    }

    #[test]
    fn publish_then_drain_round_trips() {
        let buffers = StreamBuffers::new();
        buffers.enqueue_publish(stream("a"));
        assert!(buffers.is_published("a"));
        let (publishes, unpublishes) = buffers.drain();
        assert_eq!(publishes.len(), 1);
        assert!(unpublishes.is_empty());
        assert!(!buffers.has_pending());
    }

    #[test]
    fn unpublish_unknown_label_is_noop() {
        let buffers = StreamBuffers::new();
        assert!(!buffers.enqueue_unpublish(stream("missing")));
    }

    #[test]
    fn message_buffer_preserves_order() {
        let buffer = TextMessageBuffer::new();
        buffer.push("one".to_string());
        buffer.push("two".to_string());
        assert_eq!(buffer.drain(), vec!["one".to_string(), "two".to_string()]);
        assert!(buffer.drain().is_empty());
    }
}
