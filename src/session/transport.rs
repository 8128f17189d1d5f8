//! WebSocket Transport Layer
//!
//! Single responsibility: Open a socket and move binary frames in and out.
//! No knowledge of the sync protocol, authentication, or reconnection.
//!
//! A [`Transport`] is a pair of channels. The session writes [`Outgoing`]
//! frames and reads [`TransportEvent`]s; whatever sits behind the other end
//! (a WebSocket pump task, or a test double) is hidden behind [`Connector`].

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{http::Request, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};

/// Type alias for the WebSocket send half
pub type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, Message>;

/// Type alias for the WebSocket receive half
pub type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Something the session asks the transport to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Frame(Vec<u8>),
    /// Close the socket cleanly
    Close,
}

/// Something the transport reports to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Frame(Vec<u8>),
    /// Connection-level error; usually followed by `Closed`
    Error(String),
    /// The socket is gone. `was_clean` is false when it dropped without a
    /// closing handshake.
    Closed { was_clean: bool },
}

/// The session's end of an open connection.
pub struct Transport {
    pub(crate) outgoing: mpsc::UnboundedSender<Outgoing>,
    pub(crate) events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// The far end of a [`Transport`]: whatever drives the real socket.
pub struct TransportPeer {
    pub outgoing: mpsc::UnboundedReceiver<Outgoing>,
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

impl Transport {
    /// Create a connected transport/peer pair.
    pub fn pair() -> (Transport, TransportPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        (
            Transport {
                outgoing: out_tx,
                events: ev_rx,
            },
            TransportPeer {
                outgoing: out_rx,
                events: ev_tx,
            },
        )
    }
}

/// Opens physical connections.
///
/// `connect` returns only once the socket is open; an error before that
/// point is a transport error.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Transport>;
}

/// Production connector over tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(15))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Transport> {
        debug!(url = %redact(url), "Connecting to WebSocket");

        let request = Request::builder()
            .uri(url)
            .header("Host", extract_host(url))
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .body(())
            .map_err(|e| SyncError::Transport(format!("Failed to build request: {}", e)))?;

        let (ws, _) = tokio::time::timeout(
            self.connect_timeout,
            connect_async_with_config(request, None, false),
        )
        .await
        .map_err(|_| SyncError::Transport("Timeout connecting to socket".into()))?
        .map_err(|e| SyncError::Transport(format!("WebSocket connect failed: {}", e)))?;

        let (sink, stream) = ws.split();
        let (transport, peer) = Transport::pair();
        tokio::spawn(pump(sink, stream, peer));

        debug!(url = %redact(url), "WebSocket connected");
        Ok(transport)
    }
}

/// Move frames between the WebSocket and the session until either side
/// goes away.
async fn pump(mut sink: WsSink, mut stream: WsStream, mut peer: TransportPeer) {
    loop {
        tokio::select! {
            outgoing = peer.outgoing.recv() => match outgoing {
                Some(Outgoing::Frame(data)) => {
                    if let Err(e) = sink.send(Message::Binary(data)).await {
                        let message = format!("Failed to send: {}", e);
                        let _ = peer.events.send(TransportEvent::Error(message));
                        let _ = peer.events.send(TransportEvent::Closed { was_clean: false });
                        return;
                    }
                }
                Some(Outgoing::Close) | None => {
                    let _ = sink.close().await;
                    let _ = peer.events.send(TransportEvent::Closed { was_clean: true });
                    return;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(data))) => {
                    let _ = peer.events.send(TransportEvent::Frame(data));
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(frame = ?frame, "Server closed connection");
                    let _ = peer.events.send(TransportEvent::Closed { was_clean: true });
                    return;
                }
                // Pong is handled automatically by tungstenite
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket error");
                    let message = format!("WebSocket error: {}", e);
                    let _ = peer.events.send(TransportEvent::Error(message));
                    let _ = peer.events.send(TransportEvent::Closed { was_clean: false });
                    return;
                }
                None => {
                    let _ = peer.events.send(TransportEvent::Closed { was_clean: false });
                    return;
                }
            },
        }
    }
}

/// Extract host from URL for Host header
fn extract_host(url: &str) -> &str {
    url.split("//")
        .nth(1)
        .and_then(|s| s.split('/').next())
        .unwrap_or("localhost")
}

/// Socket URLs end in a one-time token; keep it out of the logs.
fn redact(url: &str) -> String {
    match url.rsplit_once('/') {
        Some((base, _)) if base.contains("//") && !base.ends_with('/') => format!("{}/***", base),
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_host() {
        assert_eq!(extract_host("ws://localhost:1080/ws/abc"), "localhost:1080");
        assert_eq!(extract_host("wss://repo.example.com/ws/abc"), "repo.example.com");
        assert_eq!(extract_host("invalid"), "localhost");
    }

    #[test]
    fn test_redact_hides_token() {
        assert_eq!(redact("wss://repo.example.com/ws/secret"), "wss://repo.example.com/ws/***");
        assert_eq!(redact("wss://repo.example.com"), "wss://repo.example.com");
    }

    #[tokio::test]
    async fn test_pair_moves_frames_both_ways() {
        let (mut transport, mut peer) = Transport::pair();

        transport.outgoing.send(Outgoing::Frame(vec![1, 2])).unwrap();
        assert_eq!(peer.outgoing.recv().await, Some(Outgoing::Frame(vec![1, 2])));

        peer.events.send(TransportEvent::Closed { was_clean: true }).unwrap();
        assert_eq!(
            transport.events.recv().await,
            Some(TransportEvent::Closed { was_clean: true })
        );
    }
}
