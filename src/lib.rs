//! Real-time voice call core for one-to-one tutoring sessions.
//!
//! Three layers:
//!
//! - [`signaling`]: a reference-counted client for the JSON hub protocol
//!   (invitations, accept/reject, SDP and ICE relay), with automatic
//!   reconnection and event buffering across the media-setup window.
//! - [`rtc`]: the WebRTC peer session for a single audio call.
//! - [`call`]: the state machine and manager tying the two together and
//!   exposing the user-facing operations.
//!
//! The [`backend`] module talks to the REST API that owns authoritative
//! call records; [`transport`] and [`socket`] carry the hub connection.

pub mod backend;
pub mod call;
pub mod rtc;
pub mod signaling;
pub mod socket;
pub mod transport;

pub use backend::{Backend, CallRecord, UreqBackend};
pub use call::{Call, CallError, CallEvent, CallManager, CallState, EndReason};
pub use rtc::{CallRole, PeerSession};
pub use signaling::{ConnectionStatus, SignalingClient, SignalingError};
