//! WebSocket transport for the signaling hub.
//!
//! Frames are UTF-8 JSON terminated by the 0x1E record separator; a read
//! pump reassembles them from incoming WebSocket messages and forwards them
//! as [`TransportEvent`]s.

use crate::signaling::protocol::RECORD_SEPARATOR;
use crate::transport::{Transport, TransportEvent, TransportFactory};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

/// WebSocket-backed [`Transport`].
pub struct WsTransport {
    ws_sink: Mutex<Option<WsSink>>,
}

impl WsTransport {
    fn new(sink: WsSink) -> Self {
        Self {
            ws_sink: Mutex::new(Some(sink)),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_frame(&self, frame: &str) -> Result<(), anyhow::Error> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("socket is closed"))?;

        let mut data = String::with_capacity(frame.len() + 1);
        data.push_str(frame);
        data.push(RECORD_SEPARATOR);

        debug!(target: "Socket", "--> sending frame: {} bytes", data.len());
        sink.send(Message::text(data))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send error: {e}"))?;
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(mut sink) = self.ws_sink.lock().await.take() {
            let _ = sink.close().await;
        }
    }
}

/// Factory for creating WebSocket transports.
#[derive(Default)]
pub struct WsTransportFactory;

impl WsTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for WsTransportFactory {
    async fn create_transport(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        debug!(target: "Socket", "Dialing {url}");
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {e}"))?;

        let (sink, stream) = ws.split();
        let (event_tx, event_rx) = mpsc::channel(100);

        let transport = Arc::new(WsTransport::new(sink));

        tokio::task::spawn(read_pump(stream, event_tx.clone()));

        let _ = event_tx.send(TransportEvent::Connected).await;

        Ok((transport, event_rx))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<TransportEvent>) {
    let mut buffer = String::new();

    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                buffer.push_str(text.as_str());
                while let Some(idx) = buffer.find(RECORD_SEPARATOR) {
                    let frame = buffer[..idx].to_string();
                    buffer.drain(..=idx);
                    if frame.is_empty() {
                        continue;
                    }
                    trace!(target: "Socket", "<-- assembled frame: {} bytes", frame.len());
                    if event_tx
                        .send(TransportEvent::FrameReceived(frame))
                        .await
                        .is_err()
                    {
                        warn!(target: "Socket", "Event receiver dropped, closing read pump");
                        return;
                    }
                }
            }
            Some(Ok(Message::Close(_))) => {
                trace!(target: "Socket", "Received close frame");
                break;
            }
            // Pings are answered by tungstenite itself; binary frames are
            // not part of the hub protocol.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(target: "Socket", "Error reading from websocket: {e}");
                break;
            }
            None => {
                trace!(target: "Socket", "Websocket stream ended");
                break;
            }
        }
    }

    let _ = event_tx.send(TransportEvent::Disconnected).await;
}
