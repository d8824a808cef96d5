//! The hub signaling client.
//!
//! One [`SignalingClient`] per authenticated session. UI surfaces and the
//! call manager share it through reference-counted `connect`/`disconnect`
//! calls: the socket is only torn down when the last subscriber detaches,
//! so a remounting screen never kills a connection another part of the app
//! still needs.

use super::events::{IceCandidatePayload, InboundEvent, ServerEvent};
use super::protocol::{self, HubMessage};
use super::{ConnectionStatus, SignalingError};
use crate::transport::{Transport, TransportEvent, TransportFactory};
use log::{debug, info, warn};
use rand::Rng;
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc, watch};

/// Reconnect delays, indexed by consecutive failure count; the last entry
/// repeats.
const RECONNECT_SCHEDULE: [u64; 5] = [0, 2, 5, 10, 30];

/// Client-side keepalive interval bounds. The server-side timeout is on the
/// order of minutes, so this only needs to defeat idle connection reapers.
const PING_INTERVAL_MIN: Duration = Duration::from_secs(15);
const PING_INTERVAL_MAX: Duration = Duration::from_secs(25);

/// Capacity of the lifecycle event channel to the call manager.
const EVENT_CHANNEL_CAPACITY: usize = 64;

type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Single-handler event slot that buffers while no handler is registered.
///
/// Events received before a handler attaches are queued FIFO and flushed,
/// in arrival order and exactly once each, the moment a handler is set.
/// This closes the race where a fast remote peer sends its offer before
/// the local side has finished media setup.
struct EventBuffer<T> {
    handler: Option<Handler<T>>,
    pending: VecDeque<T>,
}

impl<T> EventBuffer<T> {
    fn new() -> Self {
        Self {
            handler: None,
            pending: VecDeque::new(),
        }
    }

    fn dispatch(&mut self, event: T) {
        match &self.handler {
            Some(handler) => handler(event),
            None => self.pending.push_back(event),
        }
    }

    fn set_handler(&mut self, handler: Handler<T>) {
        for event in self.pending.drain(..) {
            handler(event);
        }
        self.handler = Some(handler);
    }

    /// Detaches the handler and drops anything still buffered; stale
    /// negotiation messages must not replay into the next call.
    fn detach(&mut self) {
        self.handler = None;
        self.pending.clear();
    }
}

struct Inner {
    transport: Option<Arc<dyn Transport>>,
    subscribers: usize,
    url: Option<String>,
    /// Bumped on every successful dial so stale read loops can tell they
    /// no longer own the connection.
    epoch: u64,
    reconnect_failures: u32,
}

/// Reference-counted client for the call signaling hub.
pub struct SignalingClient {
    factory: Arc<dyn TransportFactory>,
    inner: Mutex<Inner>,
    status_tx: watch::Sender<ConnectionStatus>,
    events_tx: mpsc::Sender<ServerEvent>,
    events_rx: StdMutex<Option<mpsc::Receiver<ServerEvent>>>,
    offers: StdMutex<EventBuffer<String>>,
    answers: StdMutex<EventBuffer<String>>,
    candidates: StdMutex<EventBuffer<IceCandidatePayload>>,
    shutdown: Notify,
}

impl SignalingClient {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Arc<Self> {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            factory,
            inner: Mutex::new(Inner {
                transport: None,
                subscribers: 0,
                url: None,
                epoch: 0,
                reconnect_failures: 0,
            }),
            status_tx,
            events_tx,
            events_rx: StdMutex::new(Some(events_rx)),
            offers: StdMutex::new(EventBuffer::new()),
            answers: StdMutex::new(EventBuffer::new()),
            candidates: StdMutex::new(EventBuffer::new()),
            shutdown: Notify::new(),
        })
    }

    /// Connects to the hub (or joins the connection another subscriber
    /// already holds) and registers the caller as a subscriber.
    ///
    /// The access token authenticates the WebSocket the way browsers do:
    /// appended as the `access_token` query parameter, since custom
    /// headers are not available on a WebSocket upgrade. Reconnects reuse
    /// the same composed URL.
    ///
    /// Concurrent callers share a single dial: the inner lock is held
    /// across the attempt, so a second caller waits for the first outcome
    /// instead of opening a second socket.
    pub async fn connect(self: &Arc<Self>, url: &str, token: &str) -> Result<(), SignalingError> {
        let mut inner = self.inner.lock().await;
        if inner.transport.is_some() {
            inner.subscribers += 1;
            debug!(target: "Signaling", "Joined existing connection ({} subscribers)", inner.subscribers);
            return Ok(());
        }

        inner.url = Some(hub_url_with_token(url, token));
        self.status_tx.send_replace(ConnectionStatus::Connecting);
        match self.dial(&mut inner).await {
            Ok(()) => {
                inner.subscribers += 1;
                Ok(())
            }
            Err(e) => {
                self.status_tx.send_replace(ConnectionStatus::Disconnected);
                Err(e)
            }
        }
    }

    /// Detaches one subscriber; tears the socket down when the last one
    /// leaves.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        if inner.subscribers == 0 {
            warn!(target: "Signaling", "disconnect() called with no active subscribers");
            return;
        }
        inner.subscribers -= 1;
        if inner.subscribers > 0 {
            debug!(target: "Signaling", "Subscriber detached, {} remaining", inner.subscribers);
            return;
        }

        info!(target: "Signaling", "Last subscriber detached, closing hub connection");
        inner.epoch += 1;
        self.shutdown.notify_waiters();
        if let Some(transport) = inner.transport.take() {
            transport.disconnect().await;
        }
        self.status_tx.send_replace(ConnectionStatus::Disconnected);
    }

    /// Sends a hub method invocation, best-effort.
    ///
    /// Signaling sends (ICE candidates in particular) are inherently lossy;
    /// invoking while disconnected logs a warning and drops the message
    /// rather than erroring.
    pub async fn invoke(&self, method: &str, arguments: Vec<Value>) {
        let transport = self.inner.lock().await.transport.clone();
        let Some(transport) = transport else {
            warn!(target: "Signaling", "Dropping invoke of {method}: not connected");
            return;
        };
        let frame = protocol::encode_invocation(method, &arguments);
        if let Err(e) = transport.send_frame(&frame).await {
            warn!(target: "Signaling", "Dropping invoke of {method}: {e}");
        }
    }

    /// Registers the handler for remote SDP offers, flushing any buffered
    /// ones in arrival order.
    pub fn on_remote_offer(&self, handler: impl Fn(String) + Send + Sync + 'static) {
        self.offers.lock().unwrap().set_handler(Arc::new(handler));
    }

    /// Registers the handler for remote SDP answers.
    pub fn on_remote_answer(&self, handler: impl Fn(String) + Send + Sync + 'static) {
        self.answers.lock().unwrap().set_handler(Arc::new(handler));
    }

    /// Registers the handler for remote ICE candidates.
    pub fn on_remote_candidate(
        &self,
        handler: impl Fn(IceCandidatePayload) + Send + Sync + 'static,
    ) {
        self.candidates
            .lock()
            .unwrap()
            .set_handler(Arc::new(handler));
    }

    /// Detaches all three negotiation handlers and clears their buffers.
    /// Called from peer session teardown.
    pub fn detach_negotiation_handlers(&self) {
        self.offers.lock().unwrap().detach();
        self.answers.lock().unwrap().detach();
        self.candidates.lock().unwrap().detach();
    }

    /// Takes the lifecycle event stream. Yields `None` on the second call;
    /// exactly one consumer (the call manager) owns it.
    pub fn take_events(&self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    /// Watch channel mirroring the connection status.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.status_tx.borrow() == ConnectionStatus::Connected
    }

    /// Opens the transport, performs the protocol handshake and spawns the
    /// read and keepalive loops. Caller holds the inner lock.
    ///
    /// Returns a boxed future: the read loop awaits the reconnect path,
    /// which awaits `dial` again, and that cycle only resolves with an
    /// erased future type.
    fn dial<'a>(
        self: &'a Arc<Self>,
        inner: &'a mut Inner,
    ) -> Pin<Box<dyn Future<Output = Result<(), SignalingError>> + Send + 'a>> {
        Box::pin(async move {
            let url = inner
                .url
                .clone()
                .ok_or_else(|| SignalingError::Protocol("no hub url configured".into()))?;

            let (transport, event_rx) = self
                .factory
                .create_transport(&url)
                .await
                .map_err(SignalingError::Connect)?;
            transport
                .send_frame(&protocol::handshake_frame())
                .await
                .map_err(SignalingError::Connect)?;

            inner.epoch += 1;
            inner.reconnect_failures = 0;
            let epoch = inner.epoch;
            inner.transport = Some(transport.clone());
            self.status_tx.send_replace(ConnectionStatus::Connected);
            info!(target: "Signaling", "Connected to hub");

            tokio::spawn(self.clone().read_loop(event_rx, epoch));
            tokio::spawn(self.clone().ping_loop(transport, epoch));
            Ok(())
        })
    }

    async fn read_loop(self: Arc<Self>, mut rx: mpsc::Receiver<TransportEvent>, epoch: u64) {
        while let Some(event) = rx.recv().await {
            match event {
                TransportEvent::Connected => {}
                TransportEvent::FrameReceived(frame) => self.handle_frame(&frame).await,
                TransportEvent::Disconnected => break,
            }
        }
        self.handle_connection_lost(epoch).await;
    }

    async fn ping_loop(self: Arc<Self>, transport: Arc<dyn Transport>, epoch: u64) {
        loop {
            let interval_ms = rand::rng()
                .random_range(PING_INTERVAL_MIN.as_millis()..=PING_INTERVAL_MAX.as_millis());
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(interval_ms as u64)) => {
                    if self.inner.lock().await.epoch != epoch {
                        return;
                    }
                    if let Err(e) = transport.send_frame(&protocol::encode_ping()).await {
                        debug!(target: "Signaling", "Keepalive send failed: {e}");
                        return;
                    }
                }
                _ = self.shutdown.notified() => return,
            }
        }
    }

    async fn handle_frame(&self, frame: &str) {
        let message = match protocol::decode_frame(frame) {
            Ok(m) => m,
            Err(e) => {
                warn!(target: "Signaling", "Dropping malformed frame: {e}");
                return;
            }
        };

        match message {
            HubMessage::HandshakeAck => debug!(target: "Signaling", "Handshake acknowledged"),
            HubMessage::Ping => {}
            HubMessage::Close { error } => {
                info!(target: "Signaling", "Server closing connection: {error:?}");
            }
            HubMessage::Invocation { target, arguments } => {
                match InboundEvent::parse(&target, &arguments) {
                    Ok(InboundEvent::Lifecycle(event)) => {
                        if let Err(e) = self.events_tx.try_send(event) {
                            warn!(target: "Signaling", "Lifecycle event dropped: {e}");
                        }
                    }
                    Ok(InboundEvent::Offer(sdp)) => self.offers.lock().unwrap().dispatch(sdp),
                    Ok(InboundEvent::Answer(sdp)) => self.answers.lock().unwrap().dispatch(sdp),
                    Ok(InboundEvent::Candidate(c)) => {
                        self.candidates.lock().unwrap().dispatch(c)
                    }
                    Err(e) => warn!(target: "Signaling", "Dropping event {target}: {e}"),
                }
            }
        }
    }

    /// Runs when a read loop observes the transport dropping. Reconnects
    /// with backoff while at least one subscriber remains.
    async fn handle_connection_lost(self: Arc<Self>, epoch: u64) {
        {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                // A newer connection (or an explicit disconnect) already
                // superseded this one.
                return;
            }
            inner.transport = None;
            if inner.subscribers == 0 {
                self.status_tx.send_replace(ConnectionStatus::Disconnected);
                return;
            }
        }

        warn!(target: "Signaling", "Hub connection lost, reconnecting");
        self.status_tx.send_replace(ConnectionStatus::Reconnecting);

        loop {
            let delay_secs = {
                let inner = self.inner.lock().await;
                let failures = inner.reconnect_failures as usize;
                RECONNECT_SCHEDULE[failures.min(RECONNECT_SCHEDULE.len() - 1)]
            };
            if delay_secs > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(delay_secs)) => {}
                    _ = self.shutdown.notified() => return,
                }
            }

            let mut inner = self.inner.lock().await;
            if inner.subscribers == 0 || inner.transport.is_some() {
                return;
            }
            match self.dial(&mut inner).await {
                Ok(()) => {
                    info!(target: "Signaling", "Reconnected to hub");
                    return;
                }
                Err(e) => {
                    inner.reconnect_failures += 1;
                    warn!(
                        target: "Signaling",
                        "Reconnect attempt {} failed: {e}", inner.reconnect_failures
                    );
                }
            }
        }
    }
}

/// Composes the hub URL with the `access_token` query parameter.
fn hub_url_with_token(url: &str, token: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}access_token={token}")
}
