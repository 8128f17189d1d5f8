//! Test doubles for the session seams: an in-memory connector that hands
//! each socket's far end to the test, and a counting token source.

#![allow(dead_code)]

use async_trait::async_trait;
use editorial_sync::session::protocol::{
    decode, encode, DocumentBatch, DocumentRemoved, DocumentUpdate, ErrorPayload, RequestFrame,
};
use editorial_sync::session::{
    BackoffPolicy, Connector, Frame, Outgoing, SessionConfig, SocketTokenSource, Transport,
    TransportEvent, TransportPeer,
};
use editorial_sync::{Document, DocumentState, Result, StateMeta, SyncError, SyncSession};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const BASE_URL: &str = "ws://repo.test/websocket";
pub const ACCESS_TOKEN: &str = "access-1";

// =============================================================================
// Seams
// =============================================================================

#[derive(Default)]
pub struct CountingTokens {
    issued: AtomicUsize,
}

impl CountingTokens {
    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SocketTokenSource for CountingTokens {
    async fn socket_token(&self, access_token: &str) -> Result<String> {
        assert_eq!(access_token, ACCESS_TOKEN);
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("tok-{}", n))
    }
}

pub struct MockConnector {
    peers: mpsc::UnboundedSender<TransportPeer>,
    urls: Mutex<Vec<String>>,
    refuse: AtomicBool,
}

impl MockConnector {
    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.urls.lock().unwrap().len()
    }

    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Transport> {
        self.urls.lock().unwrap().push(url.to_string());
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("connection refused".into()));
        }
        let (transport, peer) = Transport::pair();
        let _ = self.peers.send(peer);
        Ok(transport)
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub session: SyncSession,
    pub connector: Arc<MockConnector>,
    pub tokens: Arc<CountingTokens>,
    pub peers: mpsc::UnboundedReceiver<TransportPeer>,
}

pub fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        initial: Duration::from_millis(10),
        multiplier: 1.0,
        max: Duration::from_millis(10),
    }
}

pub fn harness() -> Harness {
    harness_with(fast_backoff(), 1024)
}

pub fn harness_with(backoff: BackoffPolicy, subscription_buffer: usize) -> Harness {
    let (peers_tx, peers) = mpsc::unbounded_channel();
    let connector = Arc::new(MockConnector {
        peers: peers_tx,
        urls: Mutex::new(Vec::new()),
        refuse: AtomicBool::new(false),
    });
    let tokens = Arc::new(CountingTokens::default());
    let session = SyncSession::new(
        SessionConfig {
            base_url: BASE_URL.to_string(),
            request_timeout: Duration::from_secs(2),
            backoff,
            subscription_buffer,
        },
        tokens.clone(),
        connector.clone(),
    );
    Harness {
        session,
        connector,
        tokens,
        peers,
    }
}

impl Harness {
    /// Connect and return the server side of the new socket.
    pub async fn connect(&mut self) -> Server {
        self.session.connect(ACCESS_TOKEN).await.unwrap();
        self.next_server().await
    }

    /// Connect and authenticate.
    pub async fn authenticated(&mut self) -> Server {
        let mut server = self.connect().await;
        let session = self.session.clone();
        let (result, _) = tokio::join!(session.authenticate(), server.ack_authenticate());
        result.unwrap();
        server
    }

    /// Server side of the next socket the connector opens.
    pub async fn next_server(&mut self) -> Server {
        let peer = within(self.peers.recv()).await.expect("connector dropped");
        Server { peer }
    }
}

/// The far end of one socket, speaking the wire protocol.
pub struct Server {
    pub peer: TransportPeer,
}

impl Server {
    pub async fn next_request(&mut self) -> RequestFrame {
        match within(self.peer.outgoing.recv()).await {
            Some(Outgoing::Frame(bytes)) => decode(&bytes).unwrap(),
            other => panic!("Expected a request frame, got {:?}", other),
        }
    }

    pub async fn next_outgoing(&mut self) -> Option<Outgoing> {
        within(self.peer.outgoing.recv()).await
    }

    /// Nothing was written by the client.
    pub fn assert_silent(&mut self) {
        assert!(self.peer.outgoing.try_recv().is_err(), "unexpected frame from client");
    }

    pub fn send(&self, frame: Frame) {
        self.peer
            .events
            .send(TransportEvent::Frame(encode(&frame).unwrap()))
            .unwrap();
    }

    pub fn close(&self, was_clean: bool) {
        let _ = self.peer.events.send(TransportEvent::Closed { was_clean });
    }

    pub async fn ack_authenticate(&mut self) -> RequestFrame {
        let request = self.next_request().await;
        assert!(request.authenticate.is_some(), "expected authenticate, got {:?}", request);
        self.send(handled(&request.call_id));
        request
    }
}

/// Await with a generous upper bound so a broken test fails instead of hanging.
pub async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

// =============================================================================
// Frames
// =============================================================================

pub fn handled(call_id: &str) -> Frame {
    Frame {
        call_id: Some(call_id.to_string()),
        handled: true,
        ..Default::default()
    }
}

pub fn error(call_id: &str, message: &str) -> Frame {
    Frame {
        call_id: Some(call_id.to_string()),
        handled: true,
        error: Some(ErrorPayload {
            error_code: "400".into(),
            error_message: message.into(),
        }),
        ..Default::default()
    }
}

pub fn state(uuid: &str, title: &str) -> DocumentState {
    DocumentState {
        document: Document {
            uuid: uuid.into(),
            doc_type: "core/planning-item".into(),
            title: title.into(),
            ..Default::default()
        },
        meta: Some(StateMeta {
            updater_uri: "core://user/1".into(),
            modified: "2024-05-01T10:00:00Z".into(),
        }),
    }
}

pub fn batch(
    call_id: &str,
    set_name: &str,
    states: Vec<DocumentState>,
    final_batch: bool,
) -> Frame {
    Frame {
        call_id: Some(call_id.to_string()),
        handled: final_batch,
        document_batch: Some(DocumentBatch {
            set_name: set_name.into(),
            documents: states,
            final_batch,
        }),
        ..Default::default()
    }
}

pub fn removed(call_id: &str, set_name: &str, uuid: &str) -> Frame {
    Frame {
        call_id: Some(call_id.to_string()),
        removed: Some(DocumentRemoved {
            set_name: set_name.into(),
            document_uuid: uuid.into(),
        }),
        ..Default::default()
    }
}

pub fn updated(call_id: &str, set_name: &str, state: DocumentState) -> Frame {
    Frame {
        call_id: Some(call_id.to_string()),
        document_update: Some(DocumentUpdate {
            set_name: set_name.into(),
            document: Some(state.document),
            included: false,
            meta: state.meta,
        }),
        ..Default::default()
    }
}
