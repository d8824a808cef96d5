//! Typed server events parsed at the transport boundary.
//!
//! Hub payload field names vary in casing between backend versions; the
//! serde aliases below are the single canonicalization step, so nothing
//! downstream ever sees an untyped or partially-populated payload. Frames
//! that fail to parse are logged and dropped by the client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::protocol::canonical_target;

/// Number of seconds an invitation rings before expiring when the server
/// does not specify a window.
pub const DEFAULT_RING_SECONDS: u64 = 60;

fn default_ring_seconds() -> u64 {
    DEFAULT_RING_SECONDS
}

/// An inbound ring: someone is calling this client.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationPayload {
    #[serde(alias = "CallId", alias = "callid")]
    pub call_id: String,
    #[serde(alias = "CallerName", alias = "callername")]
    pub caller_name: String,
    #[serde(default, alias = "CallerAvatar", alias = "calleravatar")]
    pub caller_avatar: Option<String>,
    #[serde(alias = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_ring_seconds", alias = "ExpiresInSeconds", alias = "expiresinseconds")]
    pub expires_in_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallIdPayload {
    #[serde(alias = "CallId", alias = "callid")]
    pub call_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndedPayload {
    #[serde(alias = "CallId", alias = "callid")]
    pub call_id: String,
    #[serde(default, alias = "Reason")]
    pub reason: String,
    #[serde(alias = "Timestamp")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurationWarningPayload {
    #[serde(alias = "RemainingMinutes", alias = "remainingminutes")]
    pub remaining_minutes: u32,
}

/// An ICE candidate as exchanged over the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    #[serde(alias = "Candidate")]
    pub candidate: String,
    #[serde(
        default,
        rename = "sdpMid",
        alias = "SdpMid",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        alias = "SdpMLineIndex",
        alias = "sdpMlineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// Call-lifecycle events delivered to the call manager.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Invitation(InvitationPayload),
    Accepted { call_id: String },
    Rejected { call_id: String },
    Ended(EndedPayload),
    Active { call_id: String },
    DurationWarning { remaining_minutes: u32 },
}

/// Everything the hub can push at us, split into the lifecycle stream and
/// the three buffered negotiation classes.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Lifecycle(ServerEvent),
    Offer(String),
    Answer(String),
    Candidate(IceCandidatePayload),
}

#[derive(Debug, thiserror::Error)]
pub enum EventParseError {
    #[error("unknown event target: {0}")]
    UnknownTarget(String),
    #[error("event {target} missing argument")]
    MissingArgument { target: &'static str },
    #[error("malformed {target} payload: {source}")]
    Malformed {
        target: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

fn object_arg<T: serde::de::DeserializeOwned>(
    target: &'static str,
    args: &[Value],
) -> Result<T, EventParseError> {
    let arg = args
        .first()
        .ok_or(EventParseError::MissingArgument { target })?;
    serde_json::from_value(arg.clone()).map_err(|source| EventParseError::Malformed { target, source })
}

fn string_arg(target: &'static str, args: &[Value]) -> Result<String, EventParseError> {
    args.first()
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(EventParseError::MissingArgument { target })
}

impl InboundEvent {
    /// Parses a hub invocation into a typed event. Target matching is
    /// case-insensitive.
    pub fn parse(target: &str, args: &[Value]) -> Result<Self, EventParseError> {
        match canonical_target(target).as_str() {
            "callinvitation" => Ok(Self::Lifecycle(ServerEvent::Invitation(object_arg(
                "CallInvitation",
                args,
            )?))),
            "callaccepted" => {
                let payload: CallIdPayload = object_arg("CallAccepted", args)?;
                Ok(Self::Lifecycle(ServerEvent::Accepted {
                    call_id: payload.call_id,
                }))
            }
            "callrejected" => {
                let payload: CallIdPayload = object_arg("CallRejected", args)?;
                Ok(Self::Lifecycle(ServerEvent::Rejected {
                    call_id: payload.call_id,
                }))
            }
            "callended" => Ok(Self::Lifecycle(ServerEvent::Ended(object_arg(
                "CallEnded",
                args,
            )?))),
            "callactive" => {
                let payload: CallIdPayload = object_arg("CallActive", args)?;
                Ok(Self::Lifecycle(ServerEvent::Active {
                    call_id: payload.call_id,
                }))
            }
            "durationwarning" => {
                let payload: DurationWarningPayload = object_arg("DurationWarning", args)?;
                Ok(Self::Lifecycle(ServerEvent::DurationWarning {
                    remaining_minutes: payload.remaining_minutes,
                }))
            }
            "receiveoffer" => Ok(Self::Offer(string_arg("ReceiveOffer", args)?)),
            "receiveanswer" => Ok(Self::Answer(string_arg("ReceiveAnswer", args)?)),
            "receiveicecandidate" => Ok(Self::Candidate(object_arg("ReceiveIceCandidate", args)?)),
            other => Err(EventParseError::UnknownTarget(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_invitation_pascal_case_fields() {
        let args = vec![json!({
            "CallId": "c1",
            "CallerName": "Alice",
            "Timestamp": "2024-05-01T12:00:00Z",
            "ExpiresInSeconds": 30,
        })];
        match InboundEvent::parse("CALLINVITATION", &args).unwrap() {
            InboundEvent::Lifecycle(ServerEvent::Invitation(inv)) => {
                assert_eq!(inv.call_id, "c1");
                assert_eq!(inv.caller_name, "Alice");
                assert_eq!(inv.expires_in_seconds, 30);
                assert!(inv.caller_avatar.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_invitation_defaults_expiry() {
        let args = vec![json!({
            "callId": "c1",
            "callerName": "Alice",
            "timestamp": "2024-05-01T12:00:00Z",
        })];
        match InboundEvent::parse("callInvitation", &args).unwrap() {
            InboundEvent::Lifecycle(ServerEvent::Invitation(inv)) => {
                assert_eq!(inv.expires_in_seconds, DEFAULT_RING_SECONDS);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_candidate_case_variants() {
        for payload in [
            json!({"candidate": "candidate:1", "sdpMid": "0", "sdpMLineIndex": 0}),
            json!({"Candidate": "candidate:1", "SdpMid": "0", "SdpMLineIndex": 0}),
            json!({"candidate": "candidate:1", "sdpMid": "0", "sdpMlineIndex": 0}),
        ] {
            match InboundEvent::parse("ReceiveIceCandidate", &[payload]).unwrap() {
                InboundEvent::Candidate(c) => {
                    assert_eq!(c.candidate, "candidate:1");
                    assert_eq!(c.sdp_mid.as_deref(), Some("0"));
                    assert_eq!(c.sdp_mline_index, Some(0));
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn test_offer_is_plain_string() {
        match InboundEvent::parse("ReceiveOffer", &[json!("v=0\r\n...")]).unwrap() {
            InboundEvent::Offer(sdp) => assert!(sdp.starts_with("v=0")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_target_rejected() {
        assert!(matches!(
            InboundEvent::parse("SomethingElse", &[]),
            Err(EventParseError::UnknownTarget(_))
        ));
    }

    #[test]
    fn test_malformed_payload_rejected() {
        let args = vec![json!({"callerName": "Alice"})];
        assert!(InboundEvent::parse("CallInvitation", &args).is_err());
    }
}
