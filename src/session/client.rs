//! Sync Session - Authenticated, self-healing repository connection
//!
//! Single responsibility: Own the socket for its whole life.
//!
//! # Guarantees
//!
//! - One open socket at a time; concurrent `connect` calls share it
//! - Pending calls are registered before their frame is written
//! - An unclean drop rejects in-flight calls with `ConnectionLost`, keeps
//!   subscriptions, and reconnects with backoff
//! - A clean close or `disconnect()` never reconnects
//! - A closed stale socket never affects its replacement (generation check)

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backoff::{Backoff, BackoffPolicy};
use super::correlator::{
    Correlator, PendingCall, UpdateCallback, AUTHENTICATE_FAILED, CLOSE_DOCUMENT_SET_FAILED,
    DEFAULT_SUBSCRIPTION_BUFFER,
};
use super::protocol::{
    encode_request, AuthenticateRequest, CloseDocumentSetRequest, GetDocumentsRequest, PushEvent,
    Request,
};
use super::repository::SocketTokenSource;
use super::transport::{Connector, Outgoing, Transport, TransportEvent};
use crate::document::DocumentCollection;
use crate::error::{Result, SyncError};
use crate::reducer::ParentResolver;

/// Listener for connection-level errors
pub type ErrorListener = Arc<dyn Fn(&SyncError) + Send + Sync>;

/// Listener fired after a successful automatic reconnect
pub type ReconnectListener = Arc<dyn Fn() + Send + Sync>;

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Socket base URL; the one-time token is appended as the last segment
    pub base_url: String,
    /// Upper bound for any single request/response exchange
    pub request_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Push events held per document set until its first `on_update`
    pub subscription_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://localhost:1080/websocket".to_string(),
            request_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            subscription_buffer: DEFAULT_SUBSCRIPTION_BUFFER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
    /// Waiting out a backoff delay after an unclean drop
    Reconnecting,
    /// Destroyed by `disconnect()`
    Closed,
}

impl ConnectionState {
    fn has_socket(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected
                | ConnectionState::Authenticating
                | ConnectionState::Authenticated
        )
    }
}

/// Parameters for opening a document set.
#[derive(Clone, Default)]
pub struct GetDocumentsParams {
    pub set_name: String,
    pub doc_type: String,
    pub include: Vec<String>,
    /// Client-side parent lookup for inclusion batches; never sent
    pub resolve_parent_index: Option<ParentResolver>,
}

impl GetDocumentsParams {
    pub fn new(set_name: impl Into<String>, doc_type: impl Into<String>) -> Self {
        Self {
            set_name: set_name.into(),
            doc_type: doc_type.into(),
            ..Default::default()
        }
    }

    pub fn with_include(mut self, include: Vec<String>) -> Self {
        self.include = include;
        self
    }

    pub fn with_parent_resolver(mut self, resolver: ParentResolver) -> Self {
        self.resolve_parent_index = Some(resolver);
        self
    }
}

impl std::fmt::Debug for GetDocumentsParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetDocumentsParams")
            .field("set_name", &self.set_name)
            .field("doc_type", &self.doc_type)
            .field("include", &self.include)
            .field("resolve_parent_index", &self.resolve_parent_index.is_some())
            .finish()
    }
}

/// Mutable connection state, guarded by one short lock.
struct Link {
    state: ConnectionState,
    outgoing: Option<mpsc::UnboundedSender<Outgoing>>,
    generation: u64,
    access_token: Option<String>,
    authenticated: bool,
}

struct Inner {
    config: SessionConfig,
    tokens: Arc<dyn SocketTokenSource>,
    connector: Arc<dyn Connector>,
    correlator: Correlator,
    link: Mutex<Link>,
    /// Serializes physical connects
    connect_gate: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    shutdown: watch::Sender<bool>,
    backoff: Mutex<Backoff>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    error_listeners: Mutex<Vec<ErrorListener>>,
    reconnect_listeners: Mutex<Vec<ReconnectListener>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Authenticated, self-healing connection to the repository socket.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct SyncSession {
    inner: Arc<Inner>,
}

impl SyncSession {
    pub fn new(
        config: SessionConfig,
        tokens: Arc<dyn SocketTokenSource>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let backoff = Backoff::new(config.backoff.clone());
        let correlator = Correlator::new(config.subscription_buffer);
        Self {
            inner: Arc::new(Inner {
                config,
                tokens,
                connector,
                correlator,
                link: Mutex::new(Link {
                    state: ConnectionState::Disconnected,
                    outgoing: None,
                    generation: 0,
                    access_token: None,
                    authenticated: false,
                }),
                connect_gate: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
                shutdown,
                backoff: Mutex::new(backoff),
                reconnect_task: Mutex::new(None),
                error_listeners: Mutex::new(Vec::new()),
                reconnect_listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Open the socket using a fresh one-time token.
    ///
    /// Returns immediately when a socket is already open. Cancels a pending
    /// automatic reconnect before opening.
    pub async fn connect(&self, access_token: &str) -> Result<()> {
        let _gate = self.inner.connect_gate.lock().await;

        {
            let mut link = lock(&self.inner.link);
            if link.state == ConnectionState::Closed {
                return Err(SyncError::SessionClosed);
            }
            link.access_token = Some(access_token.to_string());
            if link.outgoing.is_some() {
                debug!("Already connected");
                return Ok(());
            }
        }

        self.inner.abort_reconnect();
        let result = self.inner.open(access_token).await;
        if result.is_err() {
            self.inner.set_state_unless_closed(ConnectionState::Disconnected);
        }
        result
    }

    /// Authenticate the open socket with the current access token.
    pub async fn authenticate(&self) -> Result<()> {
        self.inner.authenticate().await
    }

    /// Destroy the session. Permanent.
    pub fn disconnect(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner.abort_reconnect();

        let outgoing = {
            let mut link = lock(&self.inner.link);
            link.state = ConnectionState::Closed;
            link.authenticated = false;
            link.outgoing.take()
        };
        if let Some(outgoing) = outgoing {
            let _ = outgoing.send(Outgoing::Close);
        }

        self.inner.correlator.cancel_all(SyncError::SessionClosed);
        lock(&self.inner.reconnect_listeners).clear();
        info!("Session disconnected");
    }

    /// Register a listener for connection-level errors.
    pub fn on_error<F>(&self, listener: F)
    where
        F: Fn(&SyncError) + Send + Sync + 'static,
    {
        lock(&self.inner.error_listeners).push(Arc::new(listener));
    }

    /// Register a listener fired after each successful automatic reconnect.
    pub fn on_reconnect<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock(&self.inner.reconnect_listeners).push(Arc::new(listener));
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.link).state
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.link).outgoing.is_some()
    }

    pub fn is_authenticated(&self) -> bool {
        lock(&self.inner.link).authenticated
    }

    pub fn access_token(&self) -> Option<String> {
        lock(&self.inner.link).access_token.clone()
    }

    /// Reader for the current access token that does not keep the session
    /// alive.
    pub fn token_reader(&self) -> impl Fn() -> Option<String> + Send + Sync + 'static {
        let session = Arc::downgrade(&self.inner);
        move || {
            let inner = session.upgrade()?;
            let token = lock(&inner.link).access_token.clone();
            token
        }
    }

    /// Calls still waiting for their terminating frame.
    pub fn pending_calls(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Open a document set and wait for its initial contents.
    pub async fn get_documents(&self, params: GetDocumentsParams) -> Result<DocumentSet> {
        if !self.is_authenticated() {
            return Err(SyncError::NotAuthenticated);
        }

        let (call, reply) =
            PendingCall::documents(&params.set_name, params.resolve_parent_index.clone());
        let request = Request::GetDocuments(GetDocumentsRequest {
            set_name: params.set_name.clone(),
            doc_type: params.doc_type,
            include: params.include,
        });
        let call_id = self.inner.send(request, call)?;
        let fetched = self.inner.await_reply(call_id, reply, "getDocuments").await?;

        Ok(DocumentSet {
            call_id,
            set_name: params.set_name,
            documents: fetched.documents,
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Close a document set on the server and drop its subscriptions.
    ///
    /// When unauthenticated no frame is sent and this resolves immediately,
    /// but the local subscriptions for `set_name` are still dropped so no
    /// callback fires for that set afterwards.
    pub async fn close_document_set(&self, set_name: &str) -> Result<()> {
        if !self.is_authenticated() {
            self.inner.correlator.close_set(set_name);
            return Ok(());
        }

        let (call, reply) = PendingCall::ack(CLOSE_DOCUMENT_SET_FAILED);
        let request = Request::CloseDocumentSet(CloseDocumentSetRequest {
            set_name: set_name.to_string(),
        });
        let call_id = self.inner.send(request, call)?;
        let result = self.inner.await_reply(call_id, reply, "closeDocumentSet").await;

        self.inner.correlator.close_set(set_name);
        debug!(set_name = %set_name, ok = result.is_ok(), "Document set closed");
        result
    }
}

impl Inner {
    fn set_state_unless_closed(&self, state: ConnectionState) {
        let mut link = lock(&self.link);
        if link.state != ConnectionState::Closed {
            link.state = state;
        }
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn abort_reconnect(&self) {
        if let Some(task) = lock(&self.reconnect_task).take() {
            task.abort();
        }
    }

    fn emit_error(&self, error: &SyncError) {
        let listeners: Vec<ErrorListener> = lock(&self.error_listeners).clone();
        for listener in listeners {
            listener(error);
        }
    }

    fn fire_reconnected(&self) {
        let listeners: Vec<ReconnectListener> = lock(&self.reconnect_listeners).clone();
        for listener in listeners {
            listener();
        }
    }

    /// Acquire a socket token and open a new transport.
    async fn open(self: &Arc<Self>, access_token: &str) -> Result<()> {
        self.set_state_unless_closed(ConnectionState::Connecting);

        let result = async {
            let token = self.tokens.socket_token(access_token).await?;
            let url = socket_url(&self.config.base_url, &token);
            self.connector.connect(&url).await
        }
        .await;

        match result {
            Ok(transport) => self.install(transport),
            Err(e) => {
                warn!(error = %e, "Failed to open socket");
                self.emit_error(&e);
                Err(e)
            }
        }
    }

    /// Make `transport` the current socket and start its reader.
    fn install(self: &Arc<Self>, transport: Transport) -> Result<()> {
        let Transport { outgoing, events } = transport;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        {
            let mut link = lock(&self.link);
            if link.state == ConnectionState::Closed {
                let _ = outgoing.send(Outgoing::Close);
                return Err(SyncError::SessionClosed);
            }
            if let Some(stale) = link.outgoing.replace(outgoing) {
                let _ = stale.send(Outgoing::Close);
            }
            link.generation = generation;
            link.state = ConnectionState::Connected;
            link.authenticated = false;
        }

        tokio::spawn(reader_loop(Arc::downgrade(self), generation, events));
        info!(generation, "Connected to repository socket");
        Ok(())
    }

    /// Register `call` and write its request frame.
    fn send(&self, request: Request, call: PendingCall) -> Result<Uuid> {
        let call_id = Uuid::new_v4();
        let kind = request.kind();
        let frame = encode_request(call_id, request)?;

        let link = lock(&self.link);
        let Some(outgoing) = link.outgoing.as_ref() else {
            return Err(SyncError::NotConnected);
        };

        self.correlator.register(call_id, call);
        if outgoing.send(Outgoing::Frame(frame)).is_err() {
            self.correlator.forget(&call_id);
            return Err(SyncError::Transport("Socket is closed".into()));
        }

        debug!(call_id = %call_id, kind, "Request sent");
        Ok(call_id)
    }

    async fn await_reply<T>(
        &self,
        call_id: Uuid,
        reply: oneshot::Receiver<Result<T>>,
        kind: &str,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.request_timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::ConnectionLost),
            Err(_) => {
                self.correlator.forget(&call_id);
                warn!(call_id = %call_id, kind, "Request timed out");
                Err(SyncError::Timeout(format!("{} timed out", kind)))
            }
        }
    }

    async fn authenticate(&self) -> Result<()> {
        let (generation, token) = {
            let mut link = lock(&self.link);
            match link.state {
                ConnectionState::Closed => return Err(SyncError::SessionClosed),
                _ if link.outgoing.is_none() => return Err(SyncError::NotConnected),
                _ => {}
            }
            link.state = ConnectionState::Authenticating;
            (link.generation, link.access_token.clone().unwrap_or_default())
        };

        let (call, reply) = PendingCall::ack(AUTHENTICATE_FAILED);
        let result = match self.send(Request::Authenticate(AuthenticateRequest { token }), call) {
            Ok(call_id) => self.await_reply(call_id, reply, "authenticate").await,
            Err(e) => Err(e),
        };

        {
            let mut link = lock(&self.link);
            if link.generation == generation && link.outgoing.is_some() {
                link.authenticated = result.is_ok();
                link.state = if result.is_ok() {
                    ConnectionState::Authenticated
                } else {
                    ConnectionState::Connected
                };
            }
        }

        match &result {
            Ok(()) => info!("Session authenticated"),
            Err(e) => warn!(error = %e, "Authentication failed"),
        }
        result
    }

    /// React to the socket of `generation` going away.
    fn handle_close(self: &Arc<Self>, generation: u64, was_clean: bool) {
        let had_socket = {
            let mut link = lock(&self.link);
            if link.generation != generation || link.outgoing.is_none() {
                return;
            }
            let had_socket = link.state.has_socket();
            link.outgoing = None;
            link.authenticated = false;
            if link.state != ConnectionState::Closed {
                link.state = ConnectionState::Disconnected;
            }
            had_socket
        };

        self.correlator.fail_pending(SyncError::ConnectionLost);

        if was_clean {
            info!(generation, "Socket closed cleanly");
            return;
        }

        warn!(generation, "Socket dropped");
        self.emit_error(&SyncError::ConnectionLost);

        if had_socket && !self.is_shutdown() {
            self.set_state_unless_closed(ConnectionState::Reconnecting);
            self.spawn_reconnect();
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let mut slot = lock(&self.reconnect_task);
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        let task = tokio::spawn(reconnect_loop(Arc::downgrade(self), self.shutdown.subscribe()));
        *slot = Some(task);
    }

    fn next_delay(&self) -> (Duration, u32) {
        let mut backoff = lock(&self.backoff);
        let delay = backoff.next_delay();
        (delay, backoff.attempts())
    }
}

/// Route events from one socket until it closes.
async fn reader_loop(
    session: Weak<Inner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = session.upgrade() else {
            return;
        };
        if inner.generation.load(Ordering::SeqCst) != generation {
            debug!(generation, "Ignoring event from stale socket");
            continue;
        }

        match event {
            TransportEvent::Frame(data) => inner.correlator.dispatch_bytes(&data),
            TransportEvent::Error(message) => {
                warn!(generation, error = %message, "Socket error");
                inner.emit_error(&SyncError::Transport(message));
            }
            TransportEvent::Closed { was_clean } => {
                inner.handle_close(generation, was_clean);
                return;
            }
        }
    }

    // Peer vanished without a close event
    if let Some(inner) = session.upgrade() {
        inner.handle_close(generation, false);
    }
}

/// Reopen and re-authenticate until it works, a re-authentication fails, or
/// the session shuts down.
async fn reconnect_loop(session: Weak<Inner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let Some((delay, attempt)) = session.upgrade().map(|i| i.next_delay()) else {
            return;
        };
        info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }

        let Some(inner) = session.upgrade() else {
            return;
        };
        if inner.is_shutdown() {
            return;
        }
        let Some(access_token) = lock(&inner.link).access_token.clone() else {
            warn!("No access token for reconnect");
            return;
        };

        let opened = {
            let _gate = inner.connect_gate.lock().await;
            if inner.is_shutdown() {
                return;
            }
            let already_open = lock(&inner.link).outgoing.is_some();
            if already_open {
                Ok(())
            } else {
                inner.open(&access_token).await
            }
        };
        if let Err(e) = opened {
            warn!(attempt, error = %e, "Reconnect attempt failed");
            inner.set_state_unless_closed(ConnectionState::Reconnecting);
            continue;
        }

        match inner.authenticate().await {
            Ok(()) => {
                lock(&inner.backoff).reset();
                info!(attempt, "Reconnected");
                inner.fire_reconnected();
            }
            Err(e) => error!(error = %e, "Reconnection failed"),
        }
        return;
    }
}

fn socket_url(base_url: &str, token: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), token)
}

/// A document set opened by [`SyncSession::get_documents`].
pub struct DocumentSet {
    pub call_id: Uuid,
    pub set_name: String,
    /// Contents as of the end of the initial fetch
    pub documents: DocumentCollection,
    inner: Weak<Inner>,
}

impl DocumentSet {
    /// Receive push events for this set.
    ///
    /// The first subscriber also receives any events that arrived before it
    /// was registered.
    pub fn on_update<F>(&self, callback: F) -> Subscription
    where
        F: Fn(PushEvent) + Send + Sync + 'static,
    {
        let callback: UpdateCallback = Arc::new(callback);
        let registration = self
            .inner
            .upgrade()
            .and_then(|inner| inner.correlator.subscribe(self.call_id, callback));

        if registration.is_none() {
            debug!(call_id = %self.call_id, "Document set is no longer open");
        }

        Subscription {
            call_id: self.call_id,
            registration,
            inner: self.inner.clone(),
        }
    }
}

impl std::fmt::Debug for DocumentSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSet")
            .field("call_id", &self.call_id)
            .field("set_name", &self.set_name)
            .field("documents", &self.documents.len())
            .finish()
    }
}

/// Handle for one `on_update` callback.
#[must_use = "dropping a Subscription does not unsubscribe; call unsubscribe()"]
pub struct Subscription {
    call_id: Uuid,
    registration: Option<(u64, Arc<AtomicBool>)>,
    inner: Weak<Inner>,
}

impl Subscription {
    /// Whether events are still being delivered.
    pub fn is_active(&self) -> bool {
        self.registration
            .as_ref()
            .is_some_and(|(_, active)| active.load(Ordering::SeqCst))
    }

    /// Stop delivery, effective immediately.
    pub fn unsubscribe(&self) {
        let Some((id, active)) = &self.registration else {
            return;
        };
        active.store(false, Ordering::SeqCst);
        if let Some(inner) = self.inner.upgrade() {
            inner.correlator.unsubscribe(&self.call_id, *id);
        }
    }
}
