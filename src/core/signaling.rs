//
// Copyright 2026 Chat Core Contributors
// SPDX-License-Identifier: Apache-2.0
//

//! The messages we send over the signaling channel to establish a chat
//! session: typed envelopes layered on top of whatever string transport the
//! embedding application provides.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The SDK identity a peer advertises in `chat-invitation`/`chat-accepted`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UserAgent {
    pub sdk: SdkInfo,
    pub runtime: RuntimeInfo,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SdkInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RuntimeInfo {
    pub name: String,
    pub version: String,
}

/// A track's media origin, transported out-of-band from the media itself.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TrackSource {
    Mic,
    Camera,
    ScreenCast,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrackSourceEntry {
    pub id: String,
    pub source: TrackSource,
}

/// A decoded `chat-signal` payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Signal {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidates {
        sdp_mid: String,
        sdp_mline_index: i32,
        candidate: String,
    },
}

/// A fully decoded signaling message, dispatched on by the state machine.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Invitation { ua: UserAgent },
    Accepted { ua: UserAgent },
    Denied,
    Closed,
    NegotiationNeeded,
    Signal(Signal),
    TrackSources(Vec<TrackSourceEntry>),
}

const TYPE_INVITATION: &str = "chat-invitation";
const TYPE_ACCEPTED: &str = "chat-accepted";
const TYPE_DENIED: &str = "chat-denied";
const TYPE_CLOSED: &str = "chat-closed";
const TYPE_NEGOTIATION_NEEDED: &str = "chat-negotiation-needed";
const TYPE_SIGNAL: &str = "chat-signal";
const TYPE_TRACK_SOURCES: &str = "chat-track-sources";

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Serialize, Deserialize)]
struct UaData {
    ua: UserAgent,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum SignalData {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidates {
        #[serde(rename = "sdpMid")]
        sdp_mid: String,
        #[serde(rename = "sdpMLineIndex")]
        sdp_mline_index: i32,
        candidate: String,
    },
}

/// Encode a [`Message`] as the `{"type": ..., "data": ...}` envelope string
/// sent over the signaling transport.
pub fn encode(message: &Message) -> String {
    let envelope = match message {
        Message::Invitation { ua } => Envelope {
            kind: TYPE_INVITATION.to_string(),
            data: serde_json::to_value(UaData { ua: ua.clone() }).unwrap_or(Value::Null),
        },
        Message::Accepted { ua } => Envelope {
            kind: TYPE_ACCEPTED.to_string(),
            data: serde_json::to_value(UaData { ua: ua.clone() }).unwrap_or(Value::Null),
        },
        Message::Denied => Envelope {
            kind: TYPE_DENIED.to_string(),
            data: Value::Null,
        },
        Message::Closed => Envelope {
            kind: TYPE_CLOSED.to_string(),
            data: Value::Null,
        },
        Message::NegotiationNeeded => Envelope {
            kind: TYPE_NEGOTIATION_NEEDED.to_string(),
            data: Value::Null,
        },
        Message::Signal(signal) => {
            let data = match signal {
                Signal::Offer { sdp } => SignalData::Offer { sdp: sdp.clone() },
                Signal::Answer { sdp } => SignalData::Answer { sdp: sdp.clone() },
                Signal::Candidates {
                    sdp_mid,
                    sdp_mline_index,
                    candidate,
                } => SignalData::Candidates {
                    sdp_mid: sdp_mid.clone(),
                    sdp_mline_index: *sdp_mline_index,
                    candidate: candidate.clone(),
                },
            };
            Envelope {
                kind: TYPE_SIGNAL.to_string(),
                data: serde_json::to_value(data).unwrap_or(Value::Null),
            }
        }
        Message::TrackSources(entries) => Envelope {
            kind: TYPE_TRACK_SOURCES.to_string(),
            data: serde_json::to_value(entries).unwrap_or(Value::Null),
        },
    };

    serde_json::to_string(&envelope).unwrap_or_default()
}

/// Decode a raw signaling string into a [`Message`]. Any unparseable
/// message, missing `type`, or unrecognized `type` is logged and dropped:
/// this never surfaces an error to the caller, matching the codec's
/// fail-soft contract.
pub fn decode(raw: &str) -> Option<Message> {
    let envelope: Envelope = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(err) => {
            log::warn!("dropping unparseable signaling message: {err}");
            return None;
        }
    };

    match envelope.kind.as_str() {
        TYPE_INVITATION => decode_ua(envelope.data).map(|ua| Message::Invitation { ua }),
        TYPE_ACCEPTED => decode_ua(envelope.data).map(|ua| Message::Accepted { ua }),
        TYPE_DENIED => Some(Message::Denied),
        TYPE_CLOSED => Some(Message::Closed),
        TYPE_NEGOTIATION_NEEDED => Some(Message::NegotiationNeeded),
        TYPE_SIGNAL => match serde_json::from_value::<SignalData>(envelope.data) {
            Ok(SignalData::Offer { sdp }) => Some(Message::Signal(Signal::Offer { sdp })),
            Ok(SignalData::Answer { sdp }) => Some(Message::Signal(Signal::Answer { sdp })),
            Ok(SignalData::Candidates {
                sdp_mid,
                sdp_mline_index,
                candidate,
            }) => Some(Message::Signal(Signal::Candidates {
                sdp_mid,
                sdp_mline_index,
                candidate,
            })),
            Err(err) => {
                log::warn!("dropping malformed chat-signal payload: {err}");
                None
            }
        },
        TYPE_TRACK_SOURCES => match serde_json::from_value::<Vec<TrackSourceEntry>>(envelope.data)
        {
            Ok(entries) => Some(Message::TrackSources(entries)),
            Err(err) => {
                log::warn!("dropping malformed chat-track-sources payload: {err}");
                None
            }
        },
        other => {
            log::warn!("dropping signaling message of unknown type: {other}");
            None
        }
    }
}

fn decode_ua(data: Value) -> Option<UserAgent> {
    match serde_json::from_value::<UaData>(data) {
        Ok(ua_data) => Some(ua_data.ua),
        Err(err) => {
            log::warn!("dropping signaling message with malformed ua: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ua() -> UserAgent {
        UserAgent {
            sdk: SdkInfo {
                kind: "chatrtc".to_string(),
                version: "1.0.0".to_string(),
            },
            runtime: RuntimeInfo {
                name: "Chrome".to_string(),
                version: "120".to_string(),
            },
        }
    }

    #[test]
    fn round_trips_invitation() {
        let message = Message::Invitation { ua: sample_ua() };
        let raw = encode(&message);
        assert_eq!(decode(&raw), Some(message));
    }

    #[test]
    fn round_trips_offer_signal() {
        let message = Message::Signal(Signal::Offer {
            sdp: "v=0...".to_string(),
        });
        let raw = encode(&message);
        assert_eq!(decode(&raw), Some(message));
    }

    #[test]
    fn round_trips_candidates_signal() {
        let message = Message::Signal(Signal::Candidates {
            sdp_mid: "audio".to_string(),
            sdp_mline_index: 0,
            candidate: "candidate:1 1 UDP ...".to_string(),
        });
        let raw = encode(&message);
        assert_eq!(decode(&raw), Some(message));
    }

    #[test]
    fn round_trips_track_sources() {
        let message = Message::TrackSources(vec![
            TrackSourceEntry {
                id: "track-1".to_string(),
                source: TrackSource::Mic,
            },
            TrackSourceEntry {
                id: "track-2".to_string(),
                source: TrackSource::ScreenCast,
            },
        ]);
        let raw = encode(&message);
        assert_eq!(decode(&raw), Some(message));
    }

    #[test]
    fn drops_unknown_type() {
        assert_eq!(decode(r#"{"type":"chat-unknown","data":{}}"#), None);
    }

    #[test]
    fn drops_missing_type() {
        assert_eq!(decode(r#"{"data":{}}"#), None);
    }

    #[test]
    fn drops_garbage() {
        assert_eq!(decode("not json"), None);
    }

    #[test]
    fn drops_malformed_signal_payload() {
        assert_eq!(
            decode(r#"{"type":"chat-signal","data":{"type":"offer"}}"#),
            None
        );
    }
}
