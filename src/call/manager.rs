//! Call orchestration.
//!
//! The [`CallManager`] owns the single live call, drives the state machine
//! from server events and peer-connection events, and exposes the user
//! operations (place, accept, decline, hang up, mute, rate). It holds at
//! most one call at a time; a second invitation while busy is declined
//! automatically.

use super::CallError;
use super::invitation::CallInvitation;
use super::state::{Call, CallState, CallTransition, EndReason};
use crate::backend::Backend;
use crate::rtc::media::AudioSource;
use crate::rtc::{CallRole, PeerEvent, PeerSession};
use crate::signaling::{EndedPayload, ServerEvent, SignalingClient};
use log::{debug, info, warn};
use serde_json::json;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const PEER_EVENT_CAPACITY: usize = 16;
const BROADCAST_CAPACITY: usize = 32;

/// Events broadcast to UI subscribers.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// A new invitation is ringing.
    IncomingCall(CallInvitation),
    /// The live call changed state.
    StateChanged(Call),
    /// The call reached its final state; the manager is idle again.
    CallEnded(Call),
    /// The server warned that the session duration limit is near.
    DurationWarning { remaining_minutes: u32 },
    /// A background operation failed after the user action already
    /// returned.
    Error(String),
}

pub struct CallManager {
    local_user_id: String,
    local_display_name: String,
    signaling: Arc<SignalingClient>,
    backend: Arc<dyn Backend>,
    audio: Arc<dyn AudioSource>,
    call: RwLock<Option<Call>>,
    session: Mutex<Option<Arc<PeerSession>>>,
    ring_timer: Mutex<Option<JoinHandle<()>>>,
    peer_tx: mpsc::Sender<PeerEvent>,
    peer_rx: Mutex<Option<mpsc::Receiver<PeerEvent>>>,
    events_tx: broadcast::Sender<CallEvent>,
}

impl CallManager {
    pub fn new(
        local_user_id: &str,
        local_display_name: &str,
        signaling: Arc<SignalingClient>,
        backend: Arc<dyn Backend>,
        audio: Arc<dyn AudioSource>,
    ) -> Arc<Self> {
        let (peer_tx, peer_rx) = mpsc::channel(PEER_EVENT_CAPACITY);
        let (events_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(Self {
            local_user_id: local_user_id.to_string(),
            local_display_name: local_display_name.to_string(),
            signaling,
            backend,
            audio,
            call: RwLock::new(None),
            session: Mutex::new(None),
            ring_timer: Mutex::new(None),
            peer_tx,
            peer_rx: Mutex::new(Some(peer_rx)),
            events_tx,
        })
    }

    /// Runs the event loop. Spawn once; returns when the signaling event
    /// stream closes.
    pub async fn run(self: Arc<Self>) {
        let Some(mut server_rx) = self.signaling.take_events() else {
            warn!(target: "Call", "Event loop already running elsewhere");
            return;
        };
        let Some(mut peer_rx) = self.peer_rx.lock().unwrap().take() else {
            warn!(target: "Call", "Event loop already running elsewhere");
            return;
        };

        loop {
            tokio::select! {
                event = server_rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_server_event(event).await;
                }
                Some(event) = peer_rx.recv() => {
                    self.handle_peer_event(event).await;
                }
            }
        }
        info!(target: "Call", "Event loop stopped");
    }

    /// Subscribes to call events. Slow subscribers lose old events rather
    /// than blocking the manager.
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events_tx.subscribe()
    }

    pub fn current_call(&self) -> Option<Call> {
        self.call.read().unwrap().clone()
    }

    pub fn pending_invitation(&self) -> Option<CallInvitation> {
        let call = self.call.read().unwrap();
        match call.as_ref() {
            Some(c) => match c.state {
                CallState::RingingIncoming {
                    received_at,
                    expires_in_seconds,
                } => Some(CallInvitation {
                    call_id: c.call_id.clone(),
                    caller_name: c.caller_name.clone(),
                    caller_avatar: None,
                    received_at,
                    expires_in_seconds,
                }),
                _ => None,
            },
            None => None,
        }
    }

    /// Places a call to the given user. The callee learns of it through
    /// the hub once the backend record exists.
    pub async fn place_call(&self, callee_id: &str) -> Result<Call, CallError> {
        if self.call.read().unwrap().is_some() {
            return Err(CallError::CallInProgress);
        }

        let record = self
            .backend
            .initiate_call(callee_id)
            .await
            .map_err(|e| CallError::Backend(e.to_string()))?;

        let call = Call::new_outgoing(&record);
        {
            let mut slot = self.call.write().unwrap();
            if slot.is_some() {
                // Lost the race against an incoming invitation.
                return Err(CallError::CallInProgress);
            }
            *slot = Some(call.clone());
        }
        info!(target: "Call", "Placed call {} to {}", call.call_id, callee_id);
        self.emit(CallEvent::StateChanged(call.clone()));
        Ok(call)
    }

    /// Accepts the ringing invitation and starts media as the callee.
    pub async fn accept(self: &Arc<Self>) -> Result<Call, CallError> {
        let call_id = {
            let call = self.call.read().unwrap();
            match call.as_ref() {
                Some(c) if matches!(c.state, CallState::RingingIncoming { .. }) => {
                    c.call_id.clone()
                }
                _ => return Err(CallError::NoPendingInvitation),
            }
        };
        self.cancel_ring_timer();

        self.signaling
            .invoke("JoinCallSession", vec![json!(call_id)])
            .await;
        self.signaling
            .invoke("AcceptCallInvitation", vec![json!(call_id)])
            .await;

        // Any failure from here on must not leave the call stuck ringing
        // with the expiry timer already cancelled.
        let record = match self.backend.respond_call(&call_id, true).await {
            Ok(record) => record,
            Err(e) => {
                warn!(target: "Call", "Accept of {call_id} failed: {e}");
                self.fail_call(&format!("accept failed: {e}")).await;
                return Err(CallError::Backend(e.to_string()));
            }
        };

        let call = {
            let mut slot = self.call.write().unwrap();
            let call = slot.as_mut().ok_or(CallError::NoPendingInvitation)?;
            if let Some(record) = &record {
                call.merge_record(record);
            }
            call.apply(CallTransition::LocalAccepted)?;
            call.clone()
        };
        self.emit(CallEvent::StateChanged(call.clone()));

        if let Err(e) = self.start_session(&call_id, CallRole::Callee).await {
            self.fail_call(&format!("media setup failed: {e}")).await;
            return Err(e.into());
        }
        Ok(call)
    }

    /// Declines the ringing invitation.
    pub async fn decline(&self) -> Result<(), CallError> {
        self.end_ringing(CallTransition::LocalDeclined).await?;
        Ok(())
    }

    /// Hangs up the live call. On a still-ringing invitation this is a
    /// decline, so the caller's ring stops.
    pub async fn hang_up(&self) -> Result<Call, CallError> {
        let ringing = self
            .call
            .read()
            .unwrap()
            .as_ref()
            .is_some_and(|c| matches!(c.state, CallState::RingingIncoming { .. }));
        if ringing {
            return self.end_ringing(CallTransition::LocalDeclined).await;
        }

        let call = {
            let mut slot = self.call.write().unwrap();
            let call = slot.as_mut().ok_or(CallError::NoActiveCall)?;
            call.apply(CallTransition::Terminated {
                reason: EndReason::HungUp,
            })?;
            let ended = call.clone();
            *slot = None;
            ended
        };

        self.signaling
            .invoke("LeaveCallSession", vec![json!(call.call_id)])
            .await;
        self.teardown_session().await;
        info!(target: "Call", "Hung up call {}", call.call_id);
        self.emit(CallEvent::CallEnded(call.clone()));
        Ok(call)
    }

    /// Toggles microphone mute for the live call.
    pub fn set_muted(&self, muted: bool) -> Result<Call, CallError> {
        let call = {
            let mut slot = self.call.write().unwrap();
            let call = slot.as_mut().ok_or(CallError::NoActiveCall)?;
            call.muted = muted;
            call.clone()
        };
        self.audio.set_muted(muted);
        debug!(target: "Call", "Microphone muted: {muted}");
        self.emit(CallEvent::StateChanged(call.clone()));
        Ok(call)
    }

    /// Submits a 1-5 rating for a finished call.
    pub async fn submit_rating(&self, call_id: &str, rating: u8) -> Result<(), CallError> {
        if !(1..=5).contains(&rating) {
            return Err(CallError::InvalidRating(rating));
        }
        self.backend
            .submit_rating(call_id, rating)
            .await
            .map_err(|e| CallError::Backend(e.to_string()))
    }

    async fn handle_server_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::Invitation(payload) => self.handle_invitation(payload).await,
            ServerEvent::Accepted { call_id } => self.handle_accepted(&call_id).await,
            ServerEvent::Rejected { call_id } => {
                if !self.call_matches(&call_id) {
                    debug!(target: "Call", "Ignoring rejection for unknown call {call_id}");
                    return;
                }
                if let Err(e) = self
                    .finish_call(CallTransition::RemoteRejected, false)
                    .await
                {
                    warn!(target: "Call", "Rejection in unexpected state: {e}");
                }
            }
            ServerEvent::Ended(payload) => self.handle_ended(payload).await,
            ServerEvent::Active { call_id } => {
                if !self.call_matches(&call_id) {
                    return;
                }
                self.mark_connected();
            }
            ServerEvent::DurationWarning { remaining_minutes } => {
                info!(target: "Call", "Duration warning: {remaining_minutes} minutes remaining");
                self.emit(CallEvent::DurationWarning { remaining_minutes });
            }
        }
    }

    async fn handle_invitation(self: &Arc<Self>, payload: crate::signaling::InvitationPayload) {
        if self.call.read().unwrap().is_some() {
            info!(
                target: "Call",
                "Busy, declining invitation {} from {}", payload.call_id, payload.caller_name
            );
            if let Err(e) = self.backend.respond_call(&payload.call_id, false).await {
                warn!(target: "Call", "Busy-decline failed: {e}");
            }
            return;
        }

        let call = Call::new_incoming(&payload, &self.local_user_id, &self.local_display_name);
        let invitation = CallInvitation::from(&payload);
        *self.call.write().unwrap() = Some(call);
        info!(
            target: "Call",
            "Incoming call {} from {}", payload.call_id, payload.caller_name
        );

        self.start_ring_timer(&payload.call_id, payload.expires_in_seconds);
        self.emit(CallEvent::IncomingCall(invitation));
    }

    async fn handle_accepted(self: &Arc<Self>, call_id: &str) {
        let call = {
            let mut slot = self.call.write().unwrap();
            let Some(call) = slot.as_mut().filter(|c| c.call_id == call_id) else {
                debug!(target: "Call", "Ignoring acceptance for unknown call {call_id}");
                return;
            };
            if let Err(e) = call.apply(CallTransition::RemoteAccepted) {
                warn!(target: "Call", "Acceptance in unexpected state: {e}");
                return;
            }
            call.clone()
        };
        self.emit(CallEvent::StateChanged(call));

        // Join the hub session before any media so the server routes our
        // offer to the peer.
        self.signaling
            .invoke("JoinCallSession", vec![json!(call_id)])
            .await;

        if let Err(e) = self.start_session(call_id, CallRole::Caller).await {
            self.fail_call(&format!("media setup failed: {e}")).await;
        }
    }

    async fn handle_ended(&self, payload: EndedPayload) {
        if !self.call_matches(&payload.call_id) {
            debug!(
                target: "Call",
                "Ignoring end event for unknown call {}", payload.call_id
            );
            return;
        }
        let reason = EndReason::from_server_reason(&payload.reason);
        info!(target: "Call", "Call {} ended by server: {reason}", payload.call_id);
        if let Err(e) = self
            .finish_call(CallTransition::Terminated { reason }, false)
            .await
        {
            warn!(target: "Call", "End event in unexpected state: {e}");
        }
    }

    async fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Connected => self.mark_connected(),
            PeerEvent::Failed => {
                warn!(target: "Call", "Peer connection failed");
                if let Err(e) = self
                    .finish_call(
                        CallTransition::Terminated {
                            reason: EndReason::ConnectionFailed,
                        },
                        true,
                    )
                    .await
                {
                    debug!(target: "Call", "Connection failure with no live call: {e}");
                }
            }
        }
    }

    /// Converges on `Active` from either the peer connection reaching
    /// `Connected` or the server's active notification, whichever lands
    /// first; the loser is a no-op.
    fn mark_connected(&self) {
        let call = {
            let mut slot = self.call.write().unwrap();
            let Some(call) = slot.as_mut() else { return };
            let was_active = matches!(call.state, CallState::Active { .. });
            if let Err(e) = call.apply(CallTransition::MediaConnected) {
                debug!(target: "Call", "Connect notification ignored: {e}");
                return;
            }
            if was_active {
                return;
            }
            call.clone()
        };
        info!(target: "Call", "Call {} active", call.call_id);
        self.emit(CallEvent::StateChanged(call));
    }

    async fn start_session(
        self: &Arc<Self>,
        call_id: &str,
        role: CallRole,
    ) -> Result<(), CallError> {
        let session = PeerSession::start(
            call_id,
            role,
            self.signaling.clone(),
            self.backend.clone(),
            self.audio.clone(),
            self.peer_tx.clone(),
        )
        .await?;

        // The call may have been hung up while setup was in flight. The
        // check and the store share the session lock, so a concurrent
        // hang-up either sees the stored session or leaves it to us.
        let stored = {
            let mut slot = self.session.lock().unwrap();
            if self.call_matches(call_id) {
                *slot = Some(session.clone());
                true
            } else {
                false
            }
        };
        if !stored {
            info!(target: "Call", "Call {call_id} ended during media setup, discarding session");
            session.teardown().await;
        }
        Ok(())
    }

    async fn teardown_session(&self) {
        let session = self.session.lock().unwrap().take();
        if let Some(session) = session {
            session.teardown().await;
        }
    }

    /// Applies a terminal transition, tears everything down and emits the
    /// ended call.
    async fn finish_call(
        &self,
        transition: CallTransition,
        notify_leave: bool,
    ) -> Result<(), CallError> {
        self.cancel_ring_timer();
        let call = {
            let mut slot = self.call.write().unwrap();
            let call = slot.as_mut().ok_or(CallError::NoActiveCall)?;
            call.apply(transition)?;
            let ended = call.clone();
            *slot = None;
            ended
        };

        if notify_leave {
            self.signaling
                .invoke("LeaveCallSession", vec![json!(call.call_id)])
                .await;
        }
        self.teardown_session().await;
        self.emit(CallEvent::CallEnded(call));
        Ok(())
    }

    /// Declines or expires the ringing invitation.
    async fn end_ringing(&self, transition: CallTransition) -> Result<Call, CallError> {
        self.cancel_ring_timer();
        let call = {
            let mut slot = self.call.write().unwrap();
            let call = slot.as_mut().ok_or(CallError::NoPendingInvitation)?;
            if !matches!(call.state, CallState::RingingIncoming { .. }) {
                return Err(CallError::NoPendingInvitation);
            }
            call.apply(transition)?;
            let ended = call.clone();
            *slot = None;
            ended
        };

        if let Err(e) = self.backend.respond_call(&call.call_id, false).await {
            warn!(target: "Call", "Decline notification failed: {e}");
        }
        info!(target: "Call", "Invitation {} ended: {:?}", call.call_id, call.state);
        self.emit(CallEvent::CallEnded(call.clone()));
        Ok(call)
    }

    /// Ends the call after a local failure and reports it to subscribers.
    async fn fail_call(&self, message: &str) {
        self.emit(CallEvent::Error(message.to_string()));
        if let Err(e) = self
            .finish_call(
                CallTransition::Terminated {
                    reason: EndReason::ConnectionFailed,
                },
                true,
            )
            .await
        {
            debug!(target: "Call", "Failure cleanup with no live call: {e}");
        }
    }

    fn start_ring_timer(self: &Arc<Self>, call_id: &str, seconds: u64) {
        let manager = self.clone();
        let call_id = call_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(seconds)).await;
            if !manager.call_matches(&call_id) {
                return;
            }
            info!(target: "Call", "Invitation {call_id} rang out");
            if let Err(e) = manager.end_ringing(CallTransition::Expired).await {
                debug!(target: "Call", "Ring timeout after call moved on: {e}");
            }
        });
        if let Some(previous) = self.ring_timer.lock().unwrap().replace(handle) {
            previous.abort();
        }
    }

    fn cancel_ring_timer(&self) {
        if let Some(handle) = self.ring_timer.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn call_matches(&self, call_id: &str) -> bool {
        self.call
            .read()
            .unwrap()
            .as_ref()
            .is_some_and(|c| c.call_id == call_id)
    }

    fn emit(&self, event: CallEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }
}
