//! Call lifecycle: state machine, invitations and the manager that drives
//! them from signaling and media events.

mod error;
mod invitation;
mod manager;
mod state;

pub use error::CallError;
pub use invitation::CallInvitation;
pub use manager::{CallEvent, CallManager};
pub use state::{
    Call, CallDirection, CallState, CallStatus, CallTransition, EndReason, InvalidTransition,
    apply_transition,
};
