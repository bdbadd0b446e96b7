//
// Copyright 2026 Chat Core Contributors
// SPDX-License-Identifier: Apache-2.0
//

//! The session state machine: the one component that ties the signaling
//! codec, capability registry, engine adapter, stream/message buffers and
//! observer dispatch together into a single peer-to-peer chat session.
//!
//! ```text
//!          invite()              accept()/tie-break          ICE connected
//!   Ready ----------> Offered ------------------> Matched ---------------> Connecting
//!     ^                  |  tie-break(callee)         ^                        |
//!     |                  +-----------------------------                       | ICE connected
//!     |  deny()/stop()/remote deny/send failure                               v
//!     +---------------------------------------------------------------- Connected
//!                 remote invitation
//!   Ready ----------------------------> Pending --(accept)--> Matched
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use crate::config::ChannelConfig;
use crate::core::buffers::{StreamBuffers, TextMessageBuffer};
use crate::core::capability::Capabilities;
use crate::core::engine::{
    EngineAdapter, EngineEvent, EngineEventSink, PeerEngine, SdpKind, SessionDescription,
    SignalingState,
};
use crate::core::engine::{DataChannelState, IceConnectionState};
use crate::core::executor::SerialExecutor;
use crate::core::media::{ConnectionStats, LocalStream, RemoteStream, TrackKind};
use crate::core::observer::Observer;
use crate::core::signaling::{self, Message, Signal, TrackSourceEntry, UserAgent};
use crate::error::ChannelError;

/// The channel's place in the call lifecycle. See the module-level diagram
/// for the allowed transitions; any transition not shown there is rejected
/// with [`ChannelError::InvalidState`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Ready,
    Offered,
    Pending,
    Matched,
    Connecting,
    Connected,
}

/// The transport a [`Channel`] uses to deliver encoded signaling messages
/// to the remote peer. Implementations are expected to be fire-and-forget:
/// exactly one of `on_success`/`on_failure` is called, from any thread.
pub trait SignalingSender: Send {
    fn send(
        &mut self,
        message: String,
        remote_id: &str,
        on_success: Box<dyn FnOnce() + Send>,
        on_failure: Box<dyn FnOnce(i32) + Send>,
    );
}

type OnSuccess = Box<dyn FnOnce() + Send>;
type OnFailure = Box<dyn FnOnce(ChannelError) + Send>;

#[derive(Default)]
struct StateData {
    session: SessionState,
    is_caller: bool,
    capabilities: Capabilities,
    /// Mirrors the engine's `SignalingState`, updated from
    /// `EngineEvent::SignalingStateChanged`. Event handlers read this
    /// instead of calling `EngineAdapter::signaling_state`, which re-locks
    /// the engine mutex an engine-thread-reached handler may already be
    /// holding (see the deadlock note on that method).
    signaling_state: SignalingState,
    is_creating_offer: bool,
    negotiation_needed: bool,
    deferred_remote_offer: Option<SessionDescription>,
    pending_local_description: Option<SessionDescription>,
    last_remote_description_kind: Option<SdpKind>,
    last_disconnect: Option<Instant>,
    has_data_channel: bool,
    data_channel_open: bool,
}

struct Inner {
    local_id: String,
    remote_id: String,
    local_ua: UserAgent,
    config: ChannelConfig,
    sender: Mutex<Box<dyn SignalingSender>>,
    engine: EngineAdapter,
    events: SerialExecutor,
    state: Mutex<StateData>,
    streams: StreamBuffers,
    messages: TextMessageBuffer,
    observers: Mutex<Vec<Arc<dyn Observer>>>,
    remote_track_sources: Mutex<HashMap<String, crate::core::signaling::TrackSource>>,
    remote_streams: Mutex<HashMap<String, RemoteStream>>,
}

/// A single peer-to-peer session with one remote id. Cheap to clone: all
/// state lives behind the inner `Arc`, the same handle can be shared with
/// the signaling delivery thread, the engine worker and the caller.
#[derive(Clone)]
pub struct Channel(Arc<Inner>);

struct EngineSink {
    inner: Weak<Inner>,
}

impl EngineEventSink for EngineSink {
    fn emit(&self, event: EngineEvent) {
        if let Some(inner) = self.inner.upgrade() {
            Channel(inner).handle_engine_event(event);
        }
    }
}

enum StopResult {
    Ok,
    InvalidState(SessionState),
}

impl Channel {
    /// Builds a new channel for `remote_id`. `build_engine` receives the
    /// event sink the engine must report back through; this lets an engine
    /// implementation that needs the sink at construction time (most native
    /// ones do) be built after the channel's own `Arc` exists.
    pub fn new(
        local_id: impl Into<String>,
        remote_id: impl Into<String>,
        local_ua: UserAgent,
        config: ChannelConfig,
        sender: Box<dyn SignalingSender>,
        build_engine: impl FnOnce(Arc<dyn EngineEventSink>) -> Box<dyn PeerEngine>,
    ) -> Self {
        let local_id = local_id.into();
        let remote_id = remote_id.into();
        let events = SerialExecutor::new(format!("PeerConnectionChannelEventQueue-{remote_id}"));
        let worker_name = format!("PeerConnectionChannelEngineWorker-{remote_id}");

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let sink: Arc<dyn EngineEventSink> = Arc::new(EngineSink { inner: weak.clone() });
            let engine = build_engine(sink);
            Inner {
                local_id,
                remote_id,
                local_ua,
                config,
                sender: Mutex::new(sender),
                engine: EngineAdapter::new(engine, worker_name),
                events,
                state: Mutex::new(StateData::default()),
                streams: StreamBuffers::new(),
                messages: TextMessageBuffer::new(),
                observers: Mutex::new(Vec::new()),
                remote_track_sources: Mutex::new(HashMap::new()),
                remote_streams: Mutex::new(HashMap::new()),
            }
        });

        Channel(inner)
    }

    pub fn local_id(&self) -> &str {
        &self.0.local_id
    }

    pub fn remote_id(&self) -> &str {
        &self.0.remote_id
    }

    pub fn state(&self) -> SessionState {
        self.current_state()
    }

    pub fn add_observer(&self, observer: Arc<dyn Observer>) {
        self.0.observers.lock().expect("observers lock").push(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn Observer>) {
        self.0
            .observers
            .lock()
            .expect("observers lock")
            .retain(|existing| !Arc::ptr_eq(existing, observer));
    }

    // ---- public API ----------------------------------------------------

    pub fn invite(
        &self,
        on_success: impl FnOnce() + Send + 'static,
        on_failure: impl FnOnce(ChannelError) + Send + 'static,
    ) {
        let proceed = {
            let mut guard = self.0.state.lock().expect("state lock");
            if matches!(guard.session, SessionState::Ready | SessionState::Offered) {
                guard.session = SessionState::Offered;
                guard.is_caller = true;
                true
            } else {
                false
            }
        };
        if !proceed {
            self.post_failure(
                Box::new(on_failure),
                ChannelError::InvalidState(self.current_state()),
            );
            return;
        }
        // Best-effort: any outstanding session with this remote is torn
        // down before announcing a fresh invitation.
        self.send_fire_and_forget(Message::Closed);
        self.emit_invitation();
        self.post_success(Box::new(on_success));
    }

    pub fn accept(
        &self,
        on_success: impl FnOnce() + Send + 'static,
        on_failure: impl FnOnce(ChannelError) + Send + 'static,
    ) {
        let proceed = {
            let mut guard = self.0.state.lock().expect("state lock");
            if guard.session == SessionState::Pending {
                guard.session = SessionState::Matched;
                guard.is_caller = false;
                true
            } else {
                false
            }
        };
        if !proceed {
            self.post_failure(
                Box::new(on_failure),
                ChannelError::InvalidState(self.current_state()),
            );
            return;
        }
        self.0.engine.post(|engine| engine.initialize_peer_connection());
        self.send_fire_and_forget(Message::Accepted {
            ua: self.0.local_ua.clone(),
        });
        self.create_data_channel();
        self.post_success(Box::new(on_success));
    }

    pub fn deny(
        &self,
        on_success: impl FnOnce() + Send + 'static,
        on_failure: impl FnOnce(ChannelError) + Send + 'static,
    ) {
        let proceed = {
            let mut guard = self.0.state.lock().expect("state lock");
            if guard.session == SessionState::Pending {
                guard.session = SessionState::Ready;
                true
            } else {
                false
            }
        };
        if !proceed {
            self.post_failure(
                Box::new(on_failure),
                ChannelError::InvalidState(self.current_state()),
            );
            return;
        }
        self.send_fire_and_forget(Message::Denied);
        self.post_success(Box::new(on_success));
    }

    pub fn stop(
        &self,
        on_success: impl FnOnce() + Send + 'static,
        on_failure: impl FnOnce(ChannelError) + Send + 'static,
    ) {
        match self.local_stop() {
            StopResult::Ok => self.post_success(Box::new(on_success)),
            StopResult::InvalidState(state) => {
                self.post_failure(Box::new(on_failure), ChannelError::InvalidState(state))
            }
        }
    }

    pub fn publish(
        &self,
        stream: LocalStream,
        on_success: impl FnOnce() + Send + 'static,
        on_failure: impl FnOnce(ChannelError) + Send + 'static,
    ) {
        let (state, capabilities) = {
            let guard = self.0.state.lock().expect("state lock");
            (guard.session, guard.capabilities)
        };

        if state != SessionState::Connected {
            self.post_failure(Box::new(on_failure), ChannelError::InvalidState(state));
            return;
        }

        if !capabilities.supports_plan_b
            && (self.0.streams.published_count() > 0 || self.0.streams.pending_publish_count() > 0)
        {
            self.post_failure(
                Box::new(on_failure),
                ChannelError::UnsupportedMethod(
                    "remote does not support publishing more than one stream".to_string(),
                ),
            );
            return;
        }

        if self.0.streams.is_published(&stream.label) {
            self.post_failure(
                Box::new(on_failure),
                ChannelError::InvalidArgument(format!("stream {} already published", stream.label)),
            );
            return;
        }

        self.0.streams.enqueue_publish(stream);
        self.post_success(Box::new(on_success));
        self.check_drain_streams();
    }

    pub fn unpublish(
        &self,
        stream: LocalStream,
        on_success: impl FnOnce() + Send + 'static,
        on_failure: impl FnOnce(ChannelError) + Send + 'static,
    ) {
        let capabilities = self.0.state.lock().expect("state lock").capabilities;
        if !capabilities.supports_remove_stream {
            self.post_failure(
                Box::new(on_failure),
                ChannelError::UnsupportedMethod(
                    "remote does not support removing a published stream".to_string(),
                ),
            );
            return;
        }

        let label = stream.label.clone();
        if !self.0.streams.enqueue_unpublish(stream) {
            self.post_failure(
                Box::new(on_failure),
                ChannelError::InvalidArgument(format!("stream {label} is not published")),
            );
            return;
        }

        self.post_success(Box::new(on_success));
        self.check_drain_streams();
    }

    /// Enqueues `text` for the data channel. Delivery is best-effort:
    /// enqueueing always counts as success, matching the source's treatment
    /// of `Send` as fire-and-forget once accepted.
    pub fn send(
        &self,
        text: impl Into<String>,
        on_success: impl FnOnce() + Send + 'static,
        _on_failure: impl FnOnce(ChannelError) + Send + 'static,
    ) {
        let text = text.into();
        let (open, needs_create) = {
            let mut guard = self.0.state.lock().expect("state lock");
            let needs_create = !guard.has_data_channel;
            guard.has_data_channel = true;
            (guard.data_channel_open, needs_create)
        };

        if open {
            self.0
                .engine
                .post(move |engine| engine.send_data_channel_message(text.as_bytes()));
        } else {
            self.0.messages.push(text);
            if needs_create {
                let label = self.0.config.data_channel_label.clone();
                self.0
                    .engine
                    .post(move |engine| engine.create_data_channel(&label));
            }
        }

        self.post_success(Box::new(on_success));
    }

    pub fn get_connection_stats(
        &self,
        on_success: impl FnOnce(ConnectionStats) + Send + 'static,
        on_failure: impl FnOnce(ChannelError) + Send + 'static,
    ) {
        let state = self.current_state();
        if state != SessionState::Connected {
            self.post_failure(Box::new(on_failure), ChannelError::InvalidState(state));
            return;
        }
        let events = self.0.events.clone();
        self.0.engine.post(move |engine| {
            engine.get_stats(Box::new(move |stats| {
                events.post(move || on_success(stats));
            }));
        });
    }

    /// Decodes and dispatches one signaling message received from the
    /// remote peer. Unparseable or unrecognized messages are dropped by
    /// the codec itself; this never fails.
    pub fn on_incoming_signaling_message(&self, raw: &str) {
        let Some(message) = signaling::decode(raw) else {
            return;
        };
        match message {
            Message::Invitation { ua } => self.handle_remote_invitation(ua),
            Message::Accepted { ua } => self.handle_remote_acceptance(ua),
            Message::Denied => self.handle_remote_deny(),
            Message::Closed => self.handle_remote_stop(),
            Message::NegotiationNeeded => self.on_negotiation_needed(),
            Message::Signal(signal) => self.handle_remote_signal(signal),
            Message::TrackSources(entries) => self.handle_remote_track_sources(entries),
        }
    }

    // ---- remote signaling handlers --------------------------------------

    fn handle_remote_invitation(&self, ua: UserAgent) {
        let capabilities = Capabilities::classify(&ua);
        let remote_id = self.0.remote_id.clone();

        enum Action {
            BecamePending,
            TieBreakBecameCallee,
            Ignored,
        }

        let action = {
            let mut guard = self.0.state.lock().expect("state lock");
            guard.capabilities = capabilities;
            match guard.session {
                SessionState::Ready | SessionState::Pending => {
                    guard.session = SessionState::Pending;
                    Action::BecamePending
                }
                SessionState::Offered if remote_id.as_str() > self.0.local_id.as_str() => {
                    guard.session = SessionState::Matched;
                    guard.is_caller = false;
                    Action::TieBreakBecameCallee
                }
                _ => Action::Ignored,
            }
        };

        match action {
            Action::BecamePending => {
                log::debug!("{remote_id}: -> Pending (remote invitation)");
                self.notify(move |o| o.on_invited(&remote_id));
            }
            Action::TieBreakBecameCallee => {
                log::debug!("{remote_id}: Offered -> Matched (simultaneous invite, becoming callee)");
                self.send_fire_and_forget(Message::Accepted {
                    ua: self.0.local_ua.clone(),
                });
            }
            Action::Ignored => {
                log::debug!("{remote_id}: ignoring remote invitation in current state");
            }
        }
    }

    fn handle_remote_acceptance(&self, ua: UserAgent) {
        let capabilities = Capabilities::classify(&ua);
        let proceed = {
            let mut guard = self.0.state.lock().expect("state lock");
            match guard.session {
                SessionState::Offered | SessionState::Matched => {
                    guard.session = SessionState::Matched;
                    guard.is_caller = true;
                    guard.capabilities = capabilities;
                    true
                }
                _ => false,
            }
        };
        if !proceed {
            log::debug!("ignoring remote acceptance in current state");
            return;
        }

        let remote_id = self.0.remote_id.clone();
        self.notify(move |o| o.on_accepted(&remote_id));
        self.0.engine.post(|engine| engine.initialize_peer_connection());

        {
            let mut guard = self.0.state.lock().expect("state lock");
            guard.session = SessionState::Connecting;
        }
        log::debug!("{}: Matched -> Connecting (remote acceptance)", self.0.remote_id);
        self.create_data_channel();
        // The caller is the side that owns the initial offer; the callee
        // only ever answers one it receives (see `handle_remote_offer`).
        self.request_create_offer();
    }

    fn handle_remote_deny(&self) {
        let remote_id = self.0.remote_id.clone();
        self.notify(move |o| o.on_denied(&remote_id));
        self.0.state.lock().expect("state lock").session = SessionState::Ready;
    }

    fn handle_remote_stop(&self) {
        self.remote_stop();
    }

    fn handle_remote_signal(&self, signal: Signal) {
        let state = self.current_state();
        if matches!(
            state,
            SessionState::Ready | SessionState::Offered | SessionState::Pending
        ) {
            log::warn!("{}: dropping chat-signal received in state {state:?}", self.0.remote_id);
            return;
        }

        match signal {
            Signal::Offer { sdp } => self.handle_remote_offer(sdp),
            Signal::Answer { sdp } => self.handle_remote_answer(sdp),
            Signal::Candidates {
                sdp_mid,
                sdp_mline_index,
                candidate,
            } => {
                self.0
                    .engine
                    .post(move |engine| engine.add_ice_candidate(&sdp_mid, sdp_mline_index, &candidate));
            }
        }
    }

    fn handle_remote_offer(&self, sdp: String) {
        let desc = SessionDescription {
            kind: SdpKind::Offer,
            sdp,
        };

        let mut became_connecting = false;
        let stable = {
            let mut guard = self.0.state.lock().expect("state lock");
            let stable = guard.signaling_state == SignalingState::Stable;
            if stable {
                guard.last_remote_description_kind = Some(SdpKind::Offer);
            } else {
                guard.deferred_remote_offer = Some(desc.clone());
                log::debug!("{}: deferring remote offer until signaling is stable", self.0.remote_id);
            }
            if guard.session == SessionState::Matched {
                guard.session = SessionState::Connecting;
                became_connecting = true;
            }
            stable
        };
        if became_connecting {
            log::debug!("{}: Matched -> Connecting (remote offer)", self.0.remote_id);
        }
        if stable {
            self.0.engine.post(move |engine| engine.set_remote_description(desc));
        }
    }

    fn handle_remote_answer(&self, sdp: String) {
        let desc = SessionDescription {
            kind: SdpKind::Answer,
            sdp,
        };
        self.0.state.lock().expect("state lock").last_remote_description_kind = Some(SdpKind::Answer);
        self.0.engine.post(move |engine| engine.set_remote_description(desc));
    }

    fn handle_remote_track_sources(&self, entries: Vec<TrackSourceEntry>) {
        let mut map = self.0.remote_track_sources.lock().expect("track sources lock");
        for entry in entries {
            map.insert(entry.id, entry.source);
        }
    }

    fn on_negotiation_needed(&self) {
        let stable = {
            let mut guard = self.0.state.lock().expect("state lock");
            guard.negotiation_needed = true;
            guard.signaling_state == SignalingState::Stable
        };
        if stable {
            self.request_create_offer();
        }
    }

    // ---- engine event handlers -------------------------------------------

    fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::SignalingStateChanged(state) => self.on_signaling_state_changed(state),
            EngineEvent::IceConnectionStateChanged(state) => self.on_ice_connection_state_changed(state),
            EngineEvent::IceCandidate {
                sdp_mid,
                sdp_mline_index,
                candidate,
            } => self.send_fire_and_forget(Message::Signal(Signal::Candidates {
                sdp_mid,
                sdp_mline_index,
                candidate,
            })),
            EngineEvent::AddStream { label, track_ids } => self.on_add_stream(label, track_ids),
            EngineEvent::RemoveStream { label } => self.on_remove_stream(label),
            EngineEvent::DataChannelStateChanged(state) => self.on_data_channel_state_changed(state),
            EngineEvent::DataChannelMessage(data) => self.on_data_channel_message(data),
            EngineEvent::RenegotiationNeeded => self.on_negotiation_needed(),
            EngineEvent::CreateSdpSuccess(desc) => self.on_create_sdp_success(desc),
            EngineEvent::CreateSdpFailure(err) => self.on_create_sdp_failure(err),
            EngineEvent::SetLocalSdpSuccess => self.on_set_local_sdp_success(),
            EngineEvent::SetLocalSdpFailure(err) => self.on_set_local_sdp_failure(err),
            EngineEvent::SetRemoteSdpSuccess => self.on_set_remote_sdp_success(),
            EngineEvent::SetRemoteSdpFailure(err) => self.on_set_remote_sdp_failure(err),
        }
    }

    fn on_signaling_state_changed(&self, state: SignalingState) {
        let deferred = {
            let mut guard = self.0.state.lock().expect("state lock");
            guard.signaling_state = state;
            if state != SignalingState::Stable {
                return;
            }
            let deferred = guard.deferred_remote_offer.take();
            if deferred.is_some() {
                guard.last_remote_description_kind = Some(SdpKind::Offer);
            }
            deferred
        };
        if let Some(desc) = deferred {
            self.0.engine.post(move |engine| engine.set_remote_description(desc));
        } else {
            self.check_waited_list();
        }
    }

    fn on_ice_connection_state_changed(&self, state: IceConnectionState) {
        match state {
            IceConnectionState::Connected | IceConnectionState::Completed => {
                let was_connecting = {
                    let mut guard = self.0.state.lock().expect("state lock");
                    let was_connecting = guard.session == SessionState::Connecting;
                    guard.session = SessionState::Connected;
                    guard.last_disconnect = None;
                    was_connecting
                };
                if was_connecting {
                    let remote_id = self.0.remote_id.clone();
                    self.notify(move |o| o.on_started(&remote_id));
                }
                self.check_waited_list();
            }
            IceConnectionState::Disconnected => {
                let now = Instant::now();
                self.0.state.lock().expect("state lock").last_disconnect = Some(now);
                let channel = self.clone();
                self.0
                    .events
                    .schedule_once(self.0.config.reconnect_timeout, move || {
                        channel.on_reconnect_timeout(now);
                    });
            }
            IceConnectionState::Closed => {
                let remote_id = self.0.remote_id.clone();
                self.notify(move |o| o.on_stopped(&remote_id));
                self.clean_last_peer_connection();
            }
            IceConnectionState::New | IceConnectionState::Checking | IceConnectionState::Failed => {
                log::trace!("{}: ignoring ice connection state {state:?}", self.0.remote_id);
            }
        }
    }

    fn on_reconnect_timeout(&self, scheduled_for: Instant) {
        let still_disconnected = self.0.state.lock().expect("state lock").last_disconnect == Some(scheduled_for);
        if still_disconnected {
            log::debug!("{}: reconnect timeout elapsed, stopping", self.0.remote_id);
            let _ = self.local_stop();
        }
    }

    fn on_add_stream(&self, label: String, track_ids: Vec<String>) {
        let found_sources: Vec<_> = {
            let map = self.0.remote_track_sources.lock().expect("track sources lock");
            track_ids.iter().filter_map(|id| map.get(id).copied()).collect()
        };

        if found_sources.is_empty() {
            log::warn!(
                "{}: dropping remote stream {label}: no classified track source",
                self.0.remote_id
            );
            return;
        }

        let video_source = found_sources.into_iter().find(|source| {
            matches!(
                source,
                crate::core::signaling::TrackSource::Camera
                    | crate::core::signaling::TrackSource::ScreenCast
            )
        });

        let Some(source) = video_source else {
            log::error!(
                "{}: dropping remote stream {label}: no video track source classified",
                self.0.remote_id
            );
            return;
        };

        let stream = RemoteStream {
            label: label.clone(),
            source,
            track_ids,
        };
        self.0
            .remote_streams
            .lock()
            .expect("remote streams lock")
            .insert(label, stream.clone());
        self.notify(move |o| o.on_stream_added(&stream));
    }

    fn on_remove_stream(&self, label: String) {
        let removed = self.0.remote_streams.lock().expect("remote streams lock").remove(&label);
        let Some(stream) = removed else {
            log::warn!("{}: ignoring remove-stream for unknown label {label}", self.0.remote_id);
            return;
        };

        {
            let mut sources = self.0.remote_track_sources.lock().expect("track sources lock");
            for id in &stream.track_ids {
                sources.remove(id);
            }
        }
        self.notify(move |o| o.on_stream_removed(&stream));
    }

    fn on_data_channel_state_changed(&self, state: DataChannelState) {
        let is_open = state == DataChannelState::Open;
        self.0.state.lock().expect("state lock").data_channel_open = is_open;
        if is_open {
            self.drain_pending_messages();
        }
    }

    fn on_data_channel_message(&self, data: Vec<u8>) {
        let remote_id = self.0.remote_id.clone();
        self.notify(move |o| o.on_data(&remote_id, &data));
    }

    fn on_create_sdp_success(&self, desc: SessionDescription) {
        self.0.state.lock().expect("state lock").pending_local_description = Some(desc.clone());
        self.0.engine.post(move |engine| engine.set_local_description(desc));
    }

    fn on_create_sdp_failure(&self, err: String) {
        log::error!("{}: create sdp failed: {err}", self.0.remote_id);
        let _ = self.local_stop();
    }

    fn on_set_local_sdp_success(&self) {
        let desc = {
            let mut guard = self.0.state.lock().expect("state lock");
            guard.is_creating_offer = false;
            guard.pending_local_description.take()
        };
        let Some(desc) = desc else { return };
        self.apply_bitrate_limits(&desc);
        let signal = match desc.kind {
            SdpKind::Offer => Signal::Offer { sdp: desc.sdp },
            SdpKind::Answer => Signal::Answer { sdp: desc.sdp },
        };
        self.send_fire_and_forget(Message::Signal(signal));
    }

    fn on_set_local_sdp_failure(&self, err: String) {
        log::error!("{}: set local sdp failed: {err}", self.0.remote_id);
        let _ = self.local_stop();
    }

    fn on_set_remote_sdp_success(&self) {
        let was_offer = self
            .0
            .state
            .lock()
            .expect("state lock")
            .last_remote_description_kind
            .take()
            == Some(SdpKind::Offer);
        if was_offer {
            self.0.engine.post(|engine| engine.create_answer());
        }
    }

    fn on_set_remote_sdp_failure(&self, err: String) {
        log::error!("{}: set remote sdp failed: {err}", self.0.remote_id);
        let _ = self.local_stop();
    }

    // ---- internal helpers ------------------------------------------------

    fn current_state(&self) -> SessionState {
        self.0.state.lock().expect("state lock").session
    }

    fn request_create_offer(&self) {
        let should_create = {
            let mut guard = self.0.state.lock().expect("state lock");
            if guard.is_creating_offer {
                guard.negotiation_needed = true;
                false
            } else {
                guard.is_creating_offer = true;
                guard.negotiation_needed = false;
                true
            }
        };
        if should_create {
            self.0.engine.post(|engine| engine.create_offer());
        }
    }

    fn check_waited_list(&self) {
        if self.0.streams.has_pending() {
            self.drain_pending_streams();
            return;
        }
        let (negotiation_needed, is_caller) = {
            let guard = self.0.state.lock().expect("state lock");
            (guard.negotiation_needed, guard.is_caller)
        };
        if negotiation_needed && is_caller {
            self.request_create_offer();
        }
    }

    fn check_drain_streams(&self) {
        let ready = {
            let guard = self.0.state.lock().expect("state lock");
            guard.session == SessionState::Connected && guard.signaling_state == SignalingState::Stable
        };
        if ready {
            self.drain_pending_streams();
        }
    }

    fn drain_pending_streams(&self) {
        let (publishes, unpublishes) = self.0.streams.drain();

        for stream in publishes {
            let mut entries = Vec::new();
            if let Some(source) = stream.audio_source() {
                if let Some(track) = stream.tracks.iter().find(|t| t.kind == TrackKind::Audio) {
                    entries.push(TrackSourceEntry {
                        id: track.id.clone(),
                        source,
                    });
                }
            }
            if let Some(source) = stream.video_source() {
                if let Some(track) = stream.tracks.iter().find(|t| t.kind == TrackKind::Video) {
                    entries.push(TrackSourceEntry {
                        id: track.id.clone(),
                        source,
                    });
                }
            }
            if !entries.is_empty() {
                self.send_fire_and_forget(Message::TrackSources(entries));
            }
            self.0.engine.post(move |engine| engine.add_stream(&stream));
        }

        for stream in unpublishes {
            self.0.engine.post(move |engine| engine.remove_stream(&stream));
        }
    }

    fn drain_pending_messages(&self) {
        for message in self.0.messages.drain() {
            self.0
                .engine
                .post(move |engine| engine.send_data_channel_message(message.as_bytes()));
        }
    }

    fn create_data_channel(&self) {
        let mut guard = self.0.state.lock().expect("state lock");
        if guard.has_data_channel {
            return;
        }
        guard.has_data_channel = true;
        drop(guard);
        let label = self.0.config.data_channel_label.clone();
        self.0.engine.post(move |engine| engine.create_data_channel(&label));
    }

    fn apply_bitrate_limits(&self, _desc: &SessionDescription) {
        if let Some(kbps) = self.0.config.max_outgoing_bitrate_kbps {
            log::debug!("{}: capping outgoing bitrate to {kbps} kbps", self.0.remote_id);
        }
        if let Some(fps) = self.0.config.max_outgoing_framerate {
            log::debug!("{}: capping outgoing framerate to {fps} fps", self.0.remote_id);
        }
    }

    fn clean_last_peer_connection(&self) {
        let mut guard = self.0.state.lock().expect("state lock");
        guard.deferred_remote_offer = None;
        guard.pending_local_description = None;
        guard.negotiation_needed = false;
        guard.is_creating_offer = false;
        guard.last_disconnect = None;
        guard.has_data_channel = false;
        guard.data_channel_open = false;
    }

    /// Shared by the public `Stop` API and every internal fatal-error path
    /// (fatal SDP failure, reconnect timeout). Returns whether the
    /// transition succeeded, so the public API can report the right error.
    fn local_stop(&self) -> StopResult {
        let (prior, emit_stopped) = {
            let mut guard = self.0.state.lock().expect("state lock");
            match guard.session {
                SessionState::Connecting | SessionState::Connected => {
                    let prior = guard.session;
                    guard.session = SessionState::Ready;
                    (prior, false)
                }
                SessionState::Matched => {
                    guard.session = SessionState::Ready;
                    (SessionState::Matched, false)
                }
                SessionState::Offered => {
                    guard.session = SessionState::Ready;
                    (SessionState::Offered, true)
                }
                other @ (SessionState::Ready | SessionState::Pending) => {
                    return StopResult::InvalidState(other);
                }
            }
        };

        if matches!(prior, SessionState::Connecting | SessionState::Connected) {
            self.0.engine.post(|engine| engine.close_peer_connection());
        }
        self.send_fire_and_forget(Message::Closed);
        log::debug!("{}: {prior:?} -> Ready (stop)", self.0.remote_id);
        if emit_stopped {
            let remote_id = self.0.remote_id.clone();
            self.notify(move |o| o.on_stopped(&remote_id));
        }
        StopResult::Ok
    }

    /// Mirrors [`Channel::local_stop`] for a remote `chat-closed`: no
    /// `chat-closed` is sent back, and `Pending` is a valid source state
    /// (the remote is withdrawing an invitation we haven't answered yet).
    fn remote_stop(&self) {
        let (prior, emit_stopped) = {
            let mut guard = self.0.state.lock().expect("state lock");
            match guard.session {
                SessionState::Ready => return,
                SessionState::Connecting | SessionState::Connected => {
                    let prior = guard.session;
                    guard.session = SessionState::Ready;
                    (prior, false)
                }
                other @ (SessionState::Pending | SessionState::Matched | SessionState::Offered) => {
                    guard.session = SessionState::Ready;
                    (other, true)
                }
            }
        };

        if matches!(prior, SessionState::Connecting | SessionState::Connected) {
            self.0.engine.post(|engine| engine.close_peer_connection());
        }
        log::debug!("{}: {prior:?} -> Ready (remote stop)", self.0.remote_id);
        if emit_stopped {
            let remote_id = self.0.remote_id.clone();
            self.notify(move |o| o.on_stopped(&remote_id));
        }
    }

    fn emit_invitation(&self) {
        let raw = signaling::encode(&Message::Invitation {
            ua: self.0.local_ua.clone(),
        });
        let remote_id = self.0.remote_id.clone();
        let remote_id_for_failure = remote_id.clone();
        let inner = self.0.clone();
        let mut sender = self.0.sender.lock().expect("sender lock");
        sender.send(
            raw,
            &remote_id,
            Box::new(|| {}),
            Box::new(move |code| {
                log::warn!("chat-invitation send to {remote_id_for_failure} failed with code {code}");
                if let Ok(mut guard) = inner.state.lock() {
                    if guard.session == SessionState::Offered {
                        guard.session = SessionState::Ready;
                    }
                }
            }),
        );
    }

    fn send_fire_and_forget(&self, message: Message) {
        let raw = signaling::encode(&message);
        let remote_id = self.0.remote_id.clone();
        let remote_id_for_failure = remote_id.clone();
        let mut sender = self.0.sender.lock().expect("sender lock");
        sender.send(
            raw,
            &remote_id,
            Box::new(|| {}),
            Box::new(move |code| {
                log::warn!("signaling send to {remote_id_for_failure} failed with code {code}");
            }),
        );
    }

    fn notify<F>(&self, f: F)
    where
        F: Fn(&dyn Observer) + Send + 'static,
    {
        let inner = self.0.clone();
        self.0.events.post(move || {
            let observers = inner.observers.lock().expect("observers lock").clone();
            for observer in &observers {
                f(observer.as_ref());
            }
        });
    }

    fn post_success(&self, on_success: OnSuccess) {
        self.0.events.post(move || on_success());
    }

    fn post_failure(&self, on_failure: OnFailure, err: ChannelError) {
        self.0.events.post(move || on_failure(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::media::{LocalTrack, TrackKind};
    use crate::core::sim::{simulated_pair, SimEngine};
    use crate::core::signaling::{RuntimeInfo, SdkInfo, TrackSource};
    use std::sync::mpsc;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(2);

    struct NullSender;
    impl SignalingSender for NullSender {
        fn send(
            &mut self,
            _message: String,
            _remote_id: &str,
            on_success: Box<dyn FnOnce() + Send>,
            _on_failure: Box<dyn FnOnce(i32) + Send>,
        ) {
            on_success();
        }
    }

    fn test_ua(runtime_name: &str) -> UserAgent {
        UserAgent {
            sdk: SdkInfo {
                kind: "test".to_string(),
                version: "0".to_string(),
            },
            runtime: RuntimeInfo {
                name: runtime_name.to_string(),
                version: "1".to_string(),
            },
        }
    }

    fn lone_channel(local_id: &str, remote_id: &str) -> Channel {
        Channel::new(
            local_id,
            remote_id,
            test_ua(local_id),
            ChannelConfig::default(),
            Box::new(NullSender),
            |sink| Box::new(SimEngine::new(sink)),
        )
    }

    fn call<T: Send + 'static>(
        f: impl FnOnce(Box<dyn FnOnce(T) + Send>, Box<dyn FnOnce(ChannelError) + Send>),
    ) -> Result<T, ChannelError> {
        let (tx, rx) = mpsc::channel::<Result<T, ChannelError>>();
        let tx_ok = tx.clone();
        f(
            Box::new(move |v| tx_ok.send(Ok(v)).unwrap()),
            Box::new(move |e| tx.send(Err(e)).unwrap()),
        );
        rx.recv_timeout(TIMEOUT).expect("expected a completion callback")
    }

    struct Recorder {
        tx: Mutex<mpsc::Sender<String>>,
    }

    impl Recorder {
        fn new() -> (Arc<Self>, mpsc::Receiver<String>) {
            let (tx, rx) = mpsc::channel();
            (
                Arc::new(Self { tx: Mutex::new(tx) }),
                rx,
            )
        }

        fn emit(&self, event: String) {
            let _ = self.tx.lock().expect("recorder lock").send(event);
        }
    }

    impl Observer for Recorder {
        fn on_invited(&self, remote_id: &str) {
            self.emit(format!("invited:{remote_id}"));
        }
        fn on_accepted(&self, remote_id: &str) {
            self.emit(format!("accepted:{remote_id}"));
        }
        fn on_denied(&self, remote_id: &str) {
            self.emit(format!("denied:{remote_id}"));
        }
        fn on_started(&self, remote_id: &str) {
            self.emit(format!("started:{remote_id}"));
        }
        fn on_stopped(&self, remote_id: &str) {
            self.emit(format!("stopped:{remote_id}"));
        }
        fn on_stream_added(&self, stream: &RemoteStream) {
            self.emit(format!("stream_added:{}", stream.label));
        }
        fn on_stream_removed(&self, stream: &RemoteStream) {
            self.emit(format!("stream_removed:{}", stream.label));
        }
        fn on_data(&self, remote_id: &str, message: &[u8]) {
            self.emit(format!("data:{remote_id}:{}", String::from_utf8_lossy(message)));
        }
    }

    fn recv(rx: &mpsc::Receiver<String>) -> String {
        rx.recv_timeout(TIMEOUT).expect("expected an observer event")
    }

    #[test]
    fn invite_succeeds_from_ready_and_re_invite_from_offered() {
        let channel = lone_channel("alpha", "beta");
        assert!(call(|ok, err| channel.invite(|| ok(()), move |e| err(e))).is_ok());
        assert_eq!(channel.state(), SessionState::Offered);
        assert!(call(|ok, err| channel.invite(|| ok(()), move |e| err(e))).is_ok());
        assert_eq!(channel.state(), SessionState::Offered);
    }

    #[test]
    fn accept_and_deny_require_pending() {
        let channel = lone_channel("alpha", "beta");
        let result: Result<(), ChannelError> =
            call(|ok, err| channel.accept(|| ok(()), move |e| err(e)));
        assert_eq!(result, Err(ChannelError::InvalidState(SessionState::Ready)));

        let result: Result<(), ChannelError> =
            call(|ok, err| channel.deny(|| ok(()), move |e| err(e)));
        assert_eq!(result, Err(ChannelError::InvalidState(SessionState::Ready)));
    }

    #[test]
    fn stop_from_ready_is_invalid_state() {
        let channel = lone_channel("alpha", "beta");
        let result: Result<(), ChannelError> =
            call(|ok, err| channel.stop(|| ok(()), move |e| err(e)));
        assert_eq!(result, Err(ChannelError::InvalidState(SessionState::Ready)));
    }

    #[test]
    fn simultaneous_invite_tie_break_by_lexicographic_remote_id() {
        // remote_id "beta" > local_id "alpha", so this side loses the race
        // and immediately becomes the callee (Matched) on the competing
        // invitation.
        let becomes_callee = lone_channel("alpha", "beta");
        assert!(call(|ok, err| becomes_callee.invite(|| ok(()), move |e| err(e))).is_ok());
        assert_eq!(becomes_callee.state(), SessionState::Offered);
        becomes_callee.on_incoming_signaling_message(&signaling::encode(&Message::Invitation {
            ua: test_ua("Chrome"),
        }));
        assert_eq!(becomes_callee.state(), SessionState::Matched);

        // remote_id "alpha" < local_id "beta": this side ignores the
        // competing invitation and stays Offered, waiting for the other
        // side's acceptance instead.
        let stays_offered = lone_channel("beta", "alpha");
        assert!(call(|ok, err| stays_offered.invite(|| ok(()), move |e| err(e))).is_ok());
        assert_eq!(stays_offered.state(), SessionState::Offered);
        stays_offered.on_incoming_signaling_message(&signaling::encode(&Message::Invitation {
            ua: test_ua("Chrome"),
        }));
        assert_eq!(stays_offered.state(), SessionState::Offered);
    }

    #[test]
    fn remote_stream_with_only_audio_source_is_dropped() {
        let channel = lone_channel("alpha", "beta");
        let (recorder, rx) = Recorder::new();
        channel.add_observer(recorder);
        channel
            .0
            .remote_track_sources
            .lock()
            .unwrap()
            .insert("track-1".to_string(), TrackSource::Mic);
        channel.handle_engine_event(EngineEvent::AddStream {
            label: "remote-stream".to_string(),
            track_ids: vec!["track-1".to_string()],
        });
        // Drain the event executor with a barrier job; there should be no
        // stream_added notification queued ahead of it.
        let (drain_tx, drain_rx) = mpsc::channel();
        channel.0.events.post(move || drain_tx.send(()).unwrap());
        drain_rx.recv_timeout(TIMEOUT).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn remote_stream_with_camera_source_is_surfaced() {
        let channel = lone_channel("alpha", "beta");
        let (recorder, rx) = Recorder::new();
        channel.add_observer(recorder);
        channel
            .0
            .remote_track_sources
            .lock()
            .unwrap()
            .insert("track-1".to_string(), TrackSource::Camera);
        channel.handle_engine_event(EngineEvent::AddStream {
            label: "remote-stream".to_string(),
            track_ids: vec!["track-1".to_string()],
        });
        assert_eq!(recv(&rx), "stream_added:remote-stream");

        channel.handle_engine_event(EngineEvent::RemoveStream {
            label: "remote-stream".to_string(),
        });
        assert_eq!(recv(&rx), "stream_removed:remote-stream");
    }

    #[test]
    fn caller_and_callee_reach_connected_and_exchange_data() {
        let (alice, bob) = simulated_pair("alice", "bob", ChannelConfig::default());
        let (alice_recorder, alice_rx) = Recorder::new();
        let (bob_recorder, bob_rx) = Recorder::new();
        alice.add_observer(alice_recorder);
        bob.add_observer(bob_recorder);

        assert!(call(|ok, err| alice.invite(|| ok(()), move |e| err(e))).is_ok());
        assert_eq!(recv(&bob_rx), "invited:alice");
        assert_eq!(bob.state(), SessionState::Pending);

        assert!(call(|ok, err| bob.accept(|| ok(()), move |e| err(e))).is_ok());
        assert_eq!(recv(&alice_rx), "accepted:bob");
        assert_eq!(recv(&alice_rx), "started:bob");
        assert_eq!(recv(&bob_rx), "started:alice");
        assert_eq!(alice.state(), SessionState::Connected);
        assert_eq!(bob.state(), SessionState::Connected);

        assert!(call::<()>(|ok, err| alice.send("hello", || ok(()), move |e| err(e))).is_ok());
        assert_eq!(recv(&bob_rx), "data:alice:hello");
    }

    #[test]
    fn get_connection_stats_requires_connected_state() {
        let channel = lone_channel("alpha", "beta");
        let result: Result<ConnectionStats, ChannelError> =
            call(|ok, err| channel.get_connection_stats(ok, move |e| err(e)));
        assert_eq!(result, Err(ChannelError::InvalidState(SessionState::Ready)));
    }

    #[test]
    fn publish_requires_connected_state() {
        let channel = lone_channel("alpha", "beta");
        let stream = LocalStream {
            label: "camera".to_string(),
            tracks: vec![LocalTrack {
                id: "v0".to_string(),
                kind: TrackKind::Video,
            }],
            is_screen_cast: false,
        };
        let result: Result<(), ChannelError> =
            call(|ok, err| channel.publish(stream, || ok(()), move |e| err(e)));
        assert_eq!(result, Err(ChannelError::InvalidState(SessionState::Ready)));
    }

    #[test]
    fn reconnect_timeout_stops_session_after_grace_period() {
        let config = ChannelConfig {
            reconnect_timeout: Duration::from_millis(30),
            ..ChannelConfig::default()
        };
        let (alice, bob) = simulated_pair("alice", "bob", config);
        let (alice_recorder, alice_rx) = Recorder::new();
        alice.add_observer(alice_recorder);

        assert!(call(|ok, err| alice.invite(|| ok(()), move |e| err(e))).is_ok());
        assert!(call(|ok, err| bob.accept(|| ok(()), move |e| err(e))).is_ok());
        assert_eq!(recv(&alice_rx), "accepted:bob");
        assert_eq!(recv(&alice_rx), "started:bob");
        assert_eq!(alice.state(), SessionState::Connected);

        alice.handle_engine_event(EngineEvent::IceConnectionStateChanged(IceConnectionState::Disconnected));
        assert_eq!(alice.state(), SessionState::Connected);

        // The reconnect timer fires after `reconnect_timeout`, stops the
        // session and, once the engine reports the connection closed,
        // notifies `on_stopped`.
        assert_eq!(recv(&alice_rx), "stopped:bob");
        assert_eq!(alice.state(), SessionState::Ready);
    }

    /// A [`PeerEngine`] that records every `set_remote_description` call
    /// instead of acting on it, and reports a fixed signaling state, so a
    /// test can assert exactly how many times (and with what SDP) a
    /// deferred remote offer was ultimately applied.
    struct RecordingEngine {
        set_remote_calls: Arc<Mutex<Vec<SessionDescription>>>,
    }

    impl RecordingEngine {
        fn new(set_remote_calls: Arc<Mutex<Vec<SessionDescription>>>) -> Self {
            Self { set_remote_calls }
        }
    }

    impl PeerEngine for RecordingEngine {
        fn initialize_peer_connection(&mut self) {}
        fn create_offer(&mut self) {}
        fn create_answer(&mut self) {}
        fn set_local_description(&mut self, _desc: SessionDescription) {}
        fn set_remote_description(&mut self, desc: SessionDescription) {
            self.set_remote_calls.lock().expect("calls lock").push(desc);
        }
        fn add_ice_candidate(&mut self, _sdp_mid: &str, _sdp_mline_index: i32, _candidate: &str) {}
        fn add_stream(&mut self, _stream: &LocalStream) {}
        fn remove_stream(&mut self, _stream: &LocalStream) {}
        fn create_data_channel(&mut self, _label: &str) {}
        fn send_data_channel_message(&mut self, _data: &[u8]) {}
        fn close_peer_connection(&mut self) {}
        fn get_stats(&mut self, callback: Box<dyn FnOnce(ConnectionStats) + Send>) {
            callback(ConnectionStats::default());
        }
        fn signaling_state(&self) -> SignalingState {
            SignalingState::HaveLocalOffer
        }
    }

    #[test]
    fn deferred_remote_offer_replaces_previous_and_applies_once_stable() {
        let set_remote_calls = Arc::new(Mutex::new(Vec::new()));
        let calls = set_remote_calls.clone();
        let channel = Channel::new(
            "alpha",
            "beta",
            test_ua("alpha"),
            ChannelConfig::default(),
            Box::new(NullSender),
            move |_sink| Box::new(RecordingEngine::new(calls)),
        );

        // Simulate "local offer already sent, signaling not yet stable" in
        // a state where remote signals are accepted.
        {
            let mut guard = channel.0.state.lock().expect("state lock");
            guard.session = SessionState::Connected;
            guard.signaling_state = SignalingState::HaveLocalOffer;
        }

        channel.on_incoming_signaling_message(&signaling::encode(&Message::Signal(Signal::Offer {
            sdp: "first-offer".to_string(),
        })));
        channel.on_incoming_signaling_message(&signaling::encode(&Message::Signal(Signal::Offer {
            sdp: "second-offer".to_string(),
        })));

        // Neither offer has reached the engine yet; the second replaced the
        // first in the deferred slot rather than both being queued.
        assert!(set_remote_calls.lock().expect("calls lock").is_empty());
        assert_eq!(
            channel
                .0
                .state
                .lock()
                .expect("state lock")
                .deferred_remote_offer
                .as_ref()
                .map(|desc| desc.sdp.as_str()),
            Some("second-offer")
        );

        channel.handle_engine_event(EngineEvent::SignalingStateChanged(SignalingState::Stable));

        // Drain the engine worker with a barrier job before inspecting the
        // recorded calls.
        let (drain_tx, drain_rx) = mpsc::channel();
        channel.0.engine.post(move |_engine| drain_tx.send(()).unwrap());
        drain_rx.recv_timeout(TIMEOUT).unwrap();

        let calls = set_remote_calls.lock().expect("calls lock");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].sdp, "second-offer");
    }
}
