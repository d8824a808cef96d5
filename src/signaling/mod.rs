//! Hub signaling layer: wire protocol, inbound event model and the
//! reference-counted client.

mod client;
pub mod events;
pub mod protocol;

pub use client::SignalingClient;
pub use events::{
    EndedPayload, IceCandidatePayload, InboundEvent, InvitationPayload, ServerEvent,
};

use thiserror::Error;

/// Connection status as observed by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("connection failed: {0}")]
    Connect(anyhow::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),
}
