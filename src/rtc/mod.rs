//! WebRTC peer connection management for one-to-one audio calls.

pub mod ice;
pub mod media;
mod peer;

pub use peer::{CallRole, PeerEvent, PeerSession};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RtcError {
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("microphone unavailable: {0}")]
    MediaAccess(String),

    #[error("peer session already closed")]
    Closed,
}
