//! One peer connection per call.
//!
//! A [`PeerSession`] owns the `RTCPeerConnection` for a single call,
//! bridges SDP and ICE between it and the signaling hub, and reports
//! media-level state to the call manager through a channel. The caller
//! creates the offer; the callee only ever answers, so the two sides can
//! never glare.

use super::ice::resolve_ice_servers;
use super::media::AudioSource;
use super::RtcError;
use crate::backend::Backend;
use crate::signaling::{IceCandidatePayload, SignalingClient};
use log::{debug, info, warn};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::track::track_remote::TrackRemote;

/// Which side of the call this client is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

/// Media-level events surfaced to the call manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// The peer connection reached `Connected`; audio is flowing.
    Connected,
    /// ICE failed or the connection dropped and cannot recover.
    Failed,
}

pub struct PeerSession {
    call_id: String,
    role: CallRole,
    signaling: Arc<SignalingClient>,
    audio: Arc<dyn AudioSource>,
    pc: Mutex<Option<Arc<RTCPeerConnection>>>,
    remote_track: Mutex<Option<Arc<TrackRemote>>>,
    closed: AtomicBool,
}

impl PeerSession {
    /// Builds the peer connection and wires it to signaling.
    ///
    /// The microphone is opened before anything else so a missing capture
    /// device fails the call before any negotiation happens. For the
    /// caller role this also creates the offer and sends it; the callee
    /// waits for the buffered remote offer to arrive.
    pub async fn start(
        call_id: &str,
        role: CallRole,
        signaling: Arc<SignalingClient>,
        backend: Arc<dyn Backend>,
        audio: Arc<dyn AudioSource>,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<Self>, RtcError> {
        let local_track = audio.open().await?;
        let ice_servers = resolve_ice_servers(&backend).await;

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);
        pc.add_track(local_track).await?;

        let session = Arc::new(Self {
            call_id: call_id.to_string(),
            role,
            signaling: signaling.clone(),
            audio,
            pc: Mutex::new(Some(pc.clone())),
            remote_track: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        session.wire_peer_connection(&pc, events);
        session.wire_signaling();

        if role == CallRole::Caller {
            session.send_offer(&pc).await?;
        }

        Ok(session)
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn remote_track(&self) -> Option<Arc<TrackRemote>> {
        self.remote_track.lock().await.clone()
    }

    fn wire_peer_connection(self: &Arc<Self>, pc: &Arc<RTCPeerConnection>, events: mpsc::Sender<PeerEvent>) {
        let session = self.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let session = session.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        warn!(target: "Rtc", "Failed to serialize ICE candidate: {e}");
                        return;
                    }
                };
                session.send_local_candidate(init).await;
            })
        }));

        let session = self.clone();
        let events_for_state = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let session = session.clone();
            let events = events_for_state.clone();
            Box::pin(async move {
                info!(target: "Rtc", "Peer connection state for {}: {state}", session.call_id);
                match state {
                    RTCPeerConnectionState::Connected => {
                        session
                            .signaling
                            .invoke("NotifyCallActive", vec![json!(session.call_id)])
                            .await;
                        let _ = events.send(PeerEvent::Connected).await;
                    }
                    RTCPeerConnectionState::Failed => {
                        let _ = events.send(PeerEvent::Failed).await;
                    }
                    _ => {}
                }
            })
        }));

        let session = self.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let session = session.clone();
            Box::pin(async move {
                info!(
                    target: "Rtc",
                    "Remote track for {}: {}", session.call_id, track.codec().capability.mime_type
                );
                *session.remote_track.lock().await = Some(track);
            })
        }));
    }

    /// Registers the buffered negotiation handlers. Anything the remote
    /// side sent before this point replays immediately, in order.
    fn wire_signaling(self: &Arc<Self>) {
        let session = self.clone();
        self.signaling.on_remote_offer(move |sdp| {
            let session = session.clone();
            tokio::spawn(async move {
                if let Err(e) = session.handle_remote_offer(sdp).await {
                    warn!(target: "Rtc", "Failed to handle remote offer: {e}");
                }
            });
        });

        let session = self.clone();
        self.signaling.on_remote_answer(move |sdp| {
            let session = session.clone();
            tokio::spawn(async move {
                if let Err(e) = session.handle_remote_answer(sdp).await {
                    warn!(target: "Rtc", "Failed to handle remote answer: {e}");
                }
            });
        });

        let session = self.clone();
        self.signaling.on_remote_candidate(move |payload| {
            let session = session.clone();
            tokio::spawn(async move {
                session.handle_remote_candidate(payload).await;
            });
        });
    }

    async fn send_offer(&self, pc: &Arc<RTCPeerConnection>) -> Result<(), RtcError> {
        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer.clone()).await?;
        if self.is_closed() {
            return Err(RtcError::Closed);
        }
        debug!(target: "Rtc", "Sending offer for {}", self.call_id);
        self.signaling
            .invoke("SendOffer", vec![json!(self.call_id), json!(offer.sdp)])
            .await;
        Ok(())
    }

    async fn handle_remote_offer(&self, sdp: String) -> Result<(), RtcError> {
        if self.role != CallRole::Callee {
            warn!(target: "Rtc", "Ignoring remote offer: this side is the caller");
            return Ok(());
        }
        let pc = self.peer_connection().await?;
        let offer = RTCSessionDescription::offer(sdp)?;
        pc.set_remote_description(offer).await?;
        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer.clone()).await?;
        if self.is_closed() {
            return Err(RtcError::Closed);
        }
        debug!(target: "Rtc", "Sending answer for {}", self.call_id);
        self.signaling
            .invoke("SendAnswer", vec![json!(self.call_id), json!(answer.sdp)])
            .await;
        Ok(())
    }

    async fn handle_remote_answer(&self, sdp: String) -> Result<(), RtcError> {
        if self.role != CallRole::Caller {
            warn!(target: "Rtc", "Ignoring remote answer: this side is the callee");
            return Ok(());
        }
        let pc = self.peer_connection().await?;
        let answer = RTCSessionDescription::answer(sdp)?;
        pc.set_remote_description(answer).await?;
        Ok(())
    }

    /// Candidates are additive and lossy; failures are logged, never fatal.
    async fn handle_remote_candidate(&self, payload: IceCandidatePayload) {
        let pc = match self.peer_connection().await {
            Ok(pc) => pc,
            Err(_) => return,
        };
        let init = RTCIceCandidateInit {
            candidate: payload.candidate,
            sdp_mid: payload.sdp_mid,
            sdp_mline_index: payload.sdp_mline_index,
            ..Default::default()
        };
        if let Err(e) = pc.add_ice_candidate(init).await {
            warn!(target: "Rtc", "Failed to add remote ICE candidate: {e}");
        }
    }

    async fn send_local_candidate(&self, init: RTCIceCandidateInit) {
        if self.is_closed() {
            return;
        }
        let payload = IceCandidatePayload {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
        };
        self.signaling
            .invoke(
                "SendIceCandidate",
                vec![json!(self.call_id), json!(payload)],
            )
            .await;
    }

    async fn peer_connection(&self) -> Result<Arc<RTCPeerConnection>, RtcError> {
        self.pc.lock().await.clone().ok_or(RtcError::Closed)
    }

    /// Tears the session down. Safe to call more than once; only the first
    /// call does any work.
    pub async fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: "Rtc", "Tearing down peer session for {}", self.call_id);
        self.signaling.detach_negotiation_handlers();
        self.audio.close();
        self.remote_track.lock().await.take();
        if let Some(pc) = self.pc.lock().await.take()
            && let Err(e) = pc.close().await
        {
            warn!(target: "Rtc", "Error closing peer connection: {e}");
        }
    }
}
