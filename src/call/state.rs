//! Call state machine.
//!
//! Every lifecycle change goes through [`apply_transition`], which rejects
//! anything the transition table does not allow. An ended call is final:
//! no transition ever leaves `Ended`.

use crate::backend::CallRecord;
use crate::signaling::InvitationPayload;
use chrono::{DateTime, Utc};
use std::fmt;

/// Why a call stopped being live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// This side hung up.
    HungUp,
    /// The remote side hung up or left.
    RemoteHangup,
    /// The callee declined the invitation.
    Declined,
    /// The invitation rang out without an answer.
    Missed,
    /// Media setup or the established connection failed.
    ConnectionFailed,
    /// The server ended the call at the session duration limit.
    DurationLimit,
}

impl EndReason {
    /// Maps the free-form reason string carried by the server's end event.
    pub fn from_server_reason(reason: &str) -> Self {
        let lowered = reason.to_ascii_lowercase();
        if lowered.contains("duration") || lowered.contains("limit") {
            Self::DurationLimit
        } else if lowered.contains("declin") || lowered.contains("reject") {
            Self::Declined
        } else if lowered.contains("miss") || lowered.contains("timeout") {
            Self::Missed
        } else {
            Self::RemoteHangup
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::HungUp => "hung up",
            Self::RemoteHangup => "remote hangup",
            Self::Declined => "declined",
            Self::Missed => "missed",
            Self::ConnectionFailed => "connection failed",
            Self::DurationLimit => "duration limit reached",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Outgoing invitation sent, waiting for the callee.
    Calling { started_at: DateTime<Utc> },
    /// Incoming invitation ringing locally.
    RingingIncoming {
        received_at: DateTime<Utc>,
        expires_in_seconds: u64,
    },
    /// Both sides committed; media negotiation in progress.
    Connecting { accepted_at: DateTime<Utc> },
    /// Audio flowing.
    Active { connected_at: DateTime<Utc> },
    /// Final.
    Ended {
        reason: EndReason,
        ended_at: DateTime<Utc>,
        duration_secs: u64,
    },
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    /// The callee accepted our outgoing call.
    RemoteAccepted,
    /// This client accepted the ringing invitation.
    LocalAccepted,
    /// The callee rejected our outgoing call.
    RemoteRejected,
    /// This client declined the ringing invitation.
    LocalDeclined,
    /// The invitation rang out.
    Expired,
    /// The peer connection reached the connected state.
    MediaConnected,
    /// The call is over for the given reason.
    Terminated { reason: EndReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: &'static str,
    pub transition: &'static str,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "transition {} not allowed from state {}",
            self.transition, self.from
        )
    }
}

impl std::error::Error for InvalidTransition {}

fn state_name(state: &CallState) -> &'static str {
    match state {
        CallState::Calling { .. } => "Calling",
        CallState::RingingIncoming { .. } => "RingingIncoming",
        CallState::Connecting { .. } => "Connecting",
        CallState::Active { .. } => "Active",
        CallState::Ended { .. } => "Ended",
    }
}

fn transition_name(transition: &CallTransition) -> &'static str {
    match transition {
        CallTransition::RemoteAccepted => "RemoteAccepted",
        CallTransition::LocalAccepted => "LocalAccepted",
        CallTransition::RemoteRejected => "RemoteRejected",
        CallTransition::LocalDeclined => "LocalDeclined",
        CallTransition::Expired => "Expired",
        CallTransition::MediaConnected => "MediaConnected",
        CallTransition::Terminated { .. } => "Terminated",
    }
}

fn ended(reason: EndReason, connected_at: Option<DateTime<Utc>>) -> CallState {
    let now = Utc::now();
    let duration_secs = connected_at
        .map(|t| (now - t).num_seconds().max(0) as u64)
        .unwrap_or(0);
    CallState::Ended {
        reason,
        ended_at: now,
        duration_secs,
    }
}

/// Applies one transition, returning the new state or rejecting the pair.
pub fn apply_transition(
    state: &CallState,
    transition: CallTransition,
) -> Result<CallState, InvalidTransition> {
    use CallState as S;
    use CallTransition as T;

    let next = match (state, transition) {
        (S::Calling { .. }, T::RemoteAccepted) => S::Connecting {
            accepted_at: Utc::now(),
        },
        (S::Calling { .. }, T::RemoteRejected) => ended(EndReason::Declined, None),
        (S::Calling { .. }, T::Expired) => ended(EndReason::Missed, None),
        (S::Calling { .. }, T::Terminated { reason }) => ended(reason, None),

        (S::RingingIncoming { .. }, T::LocalAccepted) => S::Connecting {
            accepted_at: Utc::now(),
        },
        (S::RingingIncoming { .. }, T::LocalDeclined) => ended(EndReason::Declined, None),
        (S::RingingIncoming { .. }, T::Expired) => ended(EndReason::Missed, None),
        (S::RingingIncoming { .. }, T::Terminated { reason }) => ended(reason, None),

        (S::Connecting { .. }, T::MediaConnected) => S::Active {
            connected_at: Utc::now(),
        },
        (S::Connecting { .. }, T::Terminated { reason }) => ended(reason, None),

        // Media connected and the server's active notification race; the
        // second arrival is a no-op.
        (S::Active { connected_at }, T::MediaConnected) => S::Active {
            connected_at: *connected_at,
        },
        (S::Active { connected_at }, T::Terminated { reason }) => {
            ended(reason, Some(*connected_at))
        }

        (state, transition) => {
            return Err(InvalidTransition {
                from: state_name(state),
                transition: transition_name(&transition),
            });
        }
    };
    Ok(next)
}

/// Which side placed the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Coarse status derived from state plus direction, for UI consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Calling,
    Ringing,
    Connecting,
    Active,
    Completed,
    Declined,
    Missed,
    Failed,
}

/// A call known to this client, outgoing or incoming.
#[derive(Debug, Clone)]
pub struct Call {
    pub call_id: String,
    pub caller_id: String,
    pub caller_name: String,
    pub callee_id: String,
    pub callee_name: String,
    pub direction: CallDirection,
    pub state: CallState,
    /// Orthogonal to state; survives transitions.
    pub muted: bool,
    pub created_at: DateTime<Utc>,
    pub rating: Option<u8>,
}

impl Call {
    pub fn new_outgoing(record: &CallRecord) -> Self {
        let now = Utc::now();
        Self {
            call_id: record.call_id.clone(),
            caller_id: record.caller_id.clone(),
            caller_name: record.caller_name.clone(),
            callee_id: record.callee_id.clone(),
            callee_name: record.callee_name.clone(),
            direction: CallDirection::Outgoing,
            state: CallState::Calling { started_at: now },
            muted: false,
            created_at: now,
            rating: None,
        }
    }

    /// Builds the local view of a ringing incoming call. The callee ids
    /// come from the local session; the full record arrives on accept.
    pub fn new_incoming(
        invitation: &InvitationPayload,
        local_user_id: &str,
        local_display_name: &str,
    ) -> Self {
        Self {
            call_id: invitation.call_id.clone(),
            caller_id: String::new(),
            caller_name: invitation.caller_name.clone(),
            callee_id: local_user_id.to_string(),
            callee_name: local_display_name.to_string(),
            direction: CallDirection::Incoming,
            state: CallState::RingingIncoming {
                received_at: invitation.timestamp,
                expires_in_seconds: invitation.expires_in_seconds,
            },
            muted: false,
            created_at: Utc::now(),
            rating: None,
        }
    }

    /// Fills in fields only the authoritative record knows.
    pub fn merge_record(&mut self, record: &CallRecord) {
        self.caller_id = record.caller_id.clone();
        self.caller_name = record.caller_name.clone();
        self.callee_id = record.callee_id.clone();
        self.callee_name = record.callee_name.clone();
    }

    pub fn apply(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        self.state = apply_transition(&self.state, transition)?;
        Ok(())
    }

    pub fn is_initiator(&self, local_user_id: &str) -> bool {
        self.caller_id == local_user_id
    }

    pub fn is_ended(&self) -> bool {
        matches!(self.state, CallState::Ended { .. })
    }

    pub fn status(&self) -> CallStatus {
        match self.state {
            CallState::Calling { .. } => CallStatus::Calling,
            CallState::RingingIncoming { .. } => CallStatus::Ringing,
            CallState::Connecting { .. } => CallStatus::Connecting,
            CallState::Active { .. } => CallStatus::Active,
            CallState::Ended { reason, .. } => match reason {
                EndReason::HungUp | EndReason::RemoteHangup | EndReason::DurationLimit => {
                    CallStatus::Completed
                }
                EndReason::Declined => CallStatus::Declined,
                EndReason::Missed => CallStatus::Missed,
                EndReason::ConnectionFailed => CallStatus::Failed,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calling() -> CallState {
        CallState::Calling {
            started_at: Utc::now(),
        }
    }

    fn ringing() -> CallState {
        CallState::RingingIncoming {
            received_at: Utc::now(),
            expires_in_seconds: 60,
        }
    }

    #[test]
    fn test_outgoing_happy_path() {
        let state = calling();
        let state = apply_transition(&state, CallTransition::RemoteAccepted).unwrap();
        assert!(matches!(state, CallState::Connecting { .. }));
        let state = apply_transition(&state, CallTransition::MediaConnected).unwrap();
        assert!(matches!(state, CallState::Active { .. }));
        let state = apply_transition(
            &state,
            CallTransition::Terminated {
                reason: EndReason::HungUp,
            },
        )
        .unwrap();
        assert!(matches!(
            state,
            CallState::Ended {
                reason: EndReason::HungUp,
                ..
            }
        ));
    }

    #[test]
    fn test_incoming_accept_path() {
        let state = ringing();
        let state = apply_transition(&state, CallTransition::LocalAccepted).unwrap();
        assert!(matches!(state, CallState::Connecting { .. }));
    }

    #[test]
    fn test_duplicate_media_connected_is_noop() {
        let state = apply_transition(&calling(), CallTransition::RemoteAccepted).unwrap();
        let state = apply_transition(&state, CallTransition::MediaConnected).unwrap();
        let CallState::Active { connected_at } = state else {
            panic!("expected active");
        };
        let state = apply_transition(&state, CallTransition::MediaConnected).unwrap();
        assert_eq!(
            state,
            CallState::Active { connected_at },
            "second connect notification must not reset the timestamp"
        );
    }

    #[test]
    fn test_connection_failure_while_connecting() {
        let state = apply_transition(&calling(), CallTransition::RemoteAccepted).unwrap();
        let state = apply_transition(
            &state,
            CallTransition::Terminated {
                reason: EndReason::ConnectionFailed,
            },
        )
        .unwrap();
        assert!(matches!(
            state,
            CallState::Ended {
                reason: EndReason::ConnectionFailed,
                duration_secs: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_ended_is_final() {
        let state = apply_transition(&calling(), CallTransition::RemoteRejected).unwrap();
        for transition in [
            CallTransition::RemoteAccepted,
            CallTransition::MediaConnected,
            CallTransition::Terminated {
                reason: EndReason::HungUp,
            },
        ] {
            assert!(apply_transition(&state, transition).is_err());
        }
    }

    #[test]
    fn test_invalid_pairs_rejected() {
        assert!(apply_transition(&calling(), CallTransition::LocalAccepted).is_err());
        assert!(apply_transition(&ringing(), CallTransition::RemoteAccepted).is_err());
        assert!(apply_transition(&calling(), CallTransition::MediaConnected).is_err());
    }

    #[test]
    fn test_end_reason_mapping() {
        assert_eq!(
            EndReason::from_server_reason("DurationLimitReached"),
            EndReason::DurationLimit
        );
        assert_eq!(
            EndReason::from_server_reason("declined"),
            EndReason::Declined
        );
        assert_eq!(EndReason::from_server_reason("Timeout"), EndReason::Missed);
        assert_eq!(
            EndReason::from_server_reason("hangup"),
            EndReason::RemoteHangup
        );
        assert_eq!(EndReason::from_server_reason(""), EndReason::RemoteHangup);
    }

    #[test]
    fn test_status_derivation() {
        let record = CallRecord {
            call_id: "c1".into(),
            caller_id: "u1".into(),
            caller_name: "Alice".into(),
            callee_id: "u2".into(),
            callee_name: "Bob".into(),
        };
        let mut call = Call::new_outgoing(&record);
        assert_eq!(call.status(), CallStatus::Calling);
        assert!(call.is_initiator("u1"));
        assert!(!call.is_initiator("u2"));

        call.apply(CallTransition::Expired).unwrap();
        assert_eq!(call.status(), CallStatus::Missed);
        assert!(call.is_ended());
    }
}
