//! Incoming call invitations.

use crate::signaling::InvitationPayload;
use chrono::{DateTime, Utc};

/// A ringing invitation as shown to the user.
#[derive(Debug, Clone)]
pub struct CallInvitation {
    pub call_id: String,
    pub caller_name: String,
    pub caller_avatar: Option<String>,
    pub received_at: DateTime<Utc>,
    pub expires_in_seconds: u64,
}

impl From<&InvitationPayload> for CallInvitation {
    fn from(payload: &InvitationPayload) -> Self {
        Self {
            call_id: payload.call_id.clone(),
            caller_name: payload.caller_name.clone(),
            caller_avatar: payload.caller_avatar.clone(),
            received_at: payload.timestamp,
            expires_in_seconds: payload.expires_in_seconds,
        }
    }
}
