//! Network transport seam for the signaling client.
//!
//! The signaling client does not talk to a WebSocket directly; it goes
//! through the [`Transport`] trait so the hub link can be swapped out in
//! tests. [`crate::socket::WsTransportFactory`] is the production
//! implementation.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// An event produced by the transport layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The transport has successfully connected.
    Connected,
    /// A complete text frame has been received from the hub.
    FrameReceived(String),
    /// The connection was lost.
    Disconnected,
}

/// Represents an active network connection to the hub.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a single text frame. The implementation appends any framing
    /// (record separators) the wire protocol needs.
    async fn send_frame(&self, frame: &str) -> Result<(), anyhow::Error>;

    /// Closes the connection.
    async fn disconnect(&self);
}

/// A factory responsible for creating new transport instances.
///
/// The signaling client calls this once per (re)connection attempt.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Creates a new transport and returns it, along with a stream of events.
    async fn create_transport(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}

pub mod mock {
    //! In-memory transport for tests: records outbound frames and lets the
    //! test inject inbound ones.

    use super::*;
    use serde_json::Value;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    pub struct MockTransport {
        sent: Mutex<Vec<String>>,
        disconnected: AtomicBool,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                disconnected: AtomicBool::new(false),
            }
        }

        /// All frames sent so far, in order (handshake included).
        pub fn sent_frames(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }

        /// Parsed `(target, arguments)` pairs of every invocation frame sent.
        pub fn sent_invocations(&self) -> Vec<(String, Vec<Value>)> {
            self.sent_frames()
                .iter()
                .filter_map(|frame| {
                    let v: Value = serde_json::from_str(frame).ok()?;
                    if v.get("type").and_then(Value::as_u64) != Some(1) {
                        return None;
                    }
                    let target = v.get("target")?.as_str()?.to_string();
                    let args = v.get("arguments")?.as_array()?.clone();
                    Some((target, args))
                })
                .collect()
        }

        pub fn is_disconnected(&self) -> bool {
            self.disconnected.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send_frame(&self, frame: &str) -> Result<(), anyhow::Error> {
            if self.is_disconnected() {
                return Err(anyhow::anyhow!("transport is closed"));
            }
            self.sent.lock().unwrap().push(frame.to_string());
            Ok(())
        }

        async fn disconnect(&self) {
            self.disconnected.store(true, Ordering::SeqCst);
        }
    }

    /// Handle to one created connection: the transport plus an injection
    /// channel for server-originated events.
    #[derive(Clone)]
    pub struct MockHandle {
        pub transport: Arc<MockTransport>,
        events: mpsc::Sender<TransportEvent>,
    }

    impl MockHandle {
        /// Delivers a raw frame as if the hub had sent it.
        pub async fn push_frame(&self, frame: &str) {
            let _ = self
                .events
                .send(TransportEvent::FrameReceived(frame.to_string()))
                .await;
        }

        /// Delivers a hub invocation with the given target and arguments.
        pub async fn push_invocation(&self, target: &str, arguments: Vec<Value>) {
            let frame = serde_json::json!({
                "type": 1,
                "target": target,
                "arguments": arguments,
            })
            .to_string();
            self.push_frame(&frame).await;
        }

        /// Simulates the hub dropping the connection.
        pub async fn push_disconnect(&self) {
            self.transport.disconnect().await;
            let _ = self.events.send(TransportEvent::Disconnected).await;
        }
    }

    /// Factory handing out [`MockTransport`]s; keeps a handle per created
    /// connection so tests can reach reconnected transports too.
    #[derive(Default)]
    pub struct MockTransportFactory {
        handles: Mutex<Vec<MockHandle>>,
        urls: Mutex<Vec<String>>,
    }

    impl MockTransportFactory {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Number of connections created so far (initial + reconnects).
        pub fn connection_count(&self) -> usize {
            self.handles.lock().unwrap().len()
        }

        /// Handle to the most recently created connection.
        pub fn last_handle(&self) -> Option<MockHandle> {
            self.handles.lock().unwrap().last().cloned()
        }

        /// URL passed to the most recent dial, query parameters included.
        pub fn last_url(&self) -> Option<String> {
            self.urls.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl TransportFactory for MockTransportFactory {
        async fn create_transport(
            &self,
            url: &str,
        ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
            self.urls.lock().unwrap().push(url.to_string());
            let (event_tx, event_rx) = mpsc::channel(64);
            let transport = Arc::new(MockTransport::new());
            let handle = MockHandle {
                transport: transport.clone(),
                events: event_tx.clone(),
            };
            self.handles.lock().unwrap().push(handle);
            let _ = event_tx.send(TransportEvent::Connected).await;
            Ok((transport, event_rx))
        }
    }
}
