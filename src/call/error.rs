use super::state::InvalidTransition;
use crate::rtc::RtcError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("no active call")]
    NoActiveCall,

    #[error("a call is already in progress")]
    CallInProgress,

    #[error("no pending invitation")]
    NoPendingInvitation,

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("backend request failed: {0}")]
    Backend(String),

    #[error(transparent)]
    Rtc(#[from] RtcError),

    #[error("unknown call id: {0}")]
    UnknownCall(String),

    #[error("rating must be between 1 and 5, got {0}")]
    InvalidRating(u8),
}
