//! Call Correlator
//!
//! Single responsibility: Route incoming frames to the logical call or
//! subscription they belong to.
//!
//! # Call Lifecycle
//!
//! ```text
//! register(call_id) ──► frames accumulate ──► settle (resolve/reject) ──► removed
//!                                                   │
//!                                                   └──► subscription slot (document sets)
//! ```
//!
//! A pending entry is registered before its request is written, so even an
//! immediate response finds it. Document-set calls leave behind a
//! subscription slot when they settle; push frames for that call id are
//! buffered in the slot until the first `on_update` callback attaches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::protocol::{decode, DocumentBatch, Frame, FrameBody, InclusionBatch, PushEvent};
use crate::document::{DocumentCollection, DocumentState};
use crate::error::{Result, SyncError};
use crate::reducer::{self, ParentResolver};

/// Callback receiving push events for one document set.
pub type UpdateCallback = Arc<dyn Fn(PushEvent) + Send + Sync>;

/// Fallback message for a failed authenticate call
pub const AUTHENTICATE_FAILED: &str = "Authentication failed";

/// Fallback message for a failed getDocuments call
pub const GET_DOCUMENTS_FAILED: &str = "Failed to get documents";

/// Fallback message for a failed closeDocumentSet call
pub const CLOSE_DOCUMENT_SET_FAILED: &str = "Failed to close document set";

/// Push events held per document set until its first `on_update`
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 1024;

/// What a settled document-set call hands back.
#[derive(Debug)]
pub(crate) struct FetchedSet {
    pub documents: DocumentCollection,
}

/// Accumulates a multi-frame document fetch.
pub(crate) struct BatchAccumulator {
    set_name: String,
    documents: Vec<DocumentState>,
    inclusions: Vec<InclusionBatch>,
    early_events: Vec<PushEvent>,
    final_received: bool,
    resolver: Option<ParentResolver>,
}

impl BatchAccumulator {
    fn push_batch(&mut self, batch: DocumentBatch) {
        self.documents.extend(batch.documents);
        if batch.final_batch {
            self.final_received = true;
        }
    }

    fn finish(self) -> (FetchedSet, Vec<PushEvent>) {
        let mut documents = reducer::collection_from_states(self.documents);
        for batch in &self.inclusions {
            documents = match &self.resolver {
                Some(resolver) => {
                    reducer::handle_inclusion_batch_with(&documents, batch, &**resolver)
                }
                None => reducer::handle_inclusion_batch(&documents, batch),
            };
        }
        (FetchedSet { documents }, self.early_events)
    }
}

/// A call waiting for its terminating frame.
pub(crate) enum PendingCall {
    /// Settles on the first frame: resolves when `handled`, rejects otherwise
    Ack {
        fallback: &'static str,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Settles on a `handled` frame at or after the final batch
    Documents {
        accumulator: BatchAccumulator,
        reply: oneshot::Sender<Result<FetchedSet>>,
    },
}

impl PendingCall {
    pub(crate) fn ack(fallback: &'static str) -> (Self, oneshot::Receiver<Result<()>>) {
        let (reply, rx) = oneshot::channel();
        (PendingCall::Ack { fallback, reply }, rx)
    }

    pub(crate) fn documents(
        set_name: &str,
        resolver: Option<ParentResolver>,
    ) -> (Self, oneshot::Receiver<Result<FetchedSet>>) {
        let (reply, rx) = oneshot::channel();
        let accumulator = BatchAccumulator {
            set_name: set_name.to_string(),
            documents: Vec::new(),
            inclusions: Vec::new(),
            early_events: Vec::new(),
            final_received: false,
            resolver,
        };
        (PendingCall::Documents { accumulator, reply }, rx)
    }

    fn reject(self, error: SyncError) {
        match self {
            PendingCall::Ack { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            PendingCall::Documents { reply, .. } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

/// Outcome of feeding one frame to a pending call.
enum Advance {
    Waiting(PendingCall),
    Settled,
    /// A document set settled; open its subscription slot
    Subscribe {
        set_name: String,
        buffered: Vec<PushEvent>,
    },
}

fn advance(call: PendingCall, handled: bool, body: FrameBody) -> Advance {
    match call {
        PendingCall::Ack { fallback, reply } => match body {
            FrameBody::Error(e) => {
                let error = SyncError::protocol(&e.error_code, &e.error_message, fallback);
                let _ = reply.send(Err(error));
                Advance::Settled
            }
            _ if handled => {
                let _ = reply.send(Ok(()));
                Advance::Settled
            }
            _ => {
                let _ = reply.send(Err(SyncError::protocol("", "", fallback)));
                Advance::Settled
            }
        },
        PendingCall::Documents {
            accumulator: mut acc,
            reply,
        } => {
            match body {
                FrameBody::Error(e) => {
                    let _ = reply.send(Err(SyncError::protocol(
                        &e.error_code,
                        &e.error_message,
                        GET_DOCUMENTS_FAILED,
                    )));
                    return Advance::Settled;
                }
                FrameBody::DocumentBatch(batch) => acc.push_batch(batch),
                FrameBody::Push(PushEvent::InclusionBatch(batch)) => acc.inclusions.push(batch),
                FrameBody::Push(event) => acc.early_events.push(event),
                FrameBody::Ack => {}
            }

            if acc.final_received && handled {
                let set_name = acc.set_name.clone();
                let (fetched, buffered) = acc.finish();
                debug!(
                    set_name = %set_name,
                    documents = fetched.documents.len(),
                    "Document set fetched"
                );
                let _ = reply.send(Ok(fetched));
                Advance::Subscribe { set_name, buffered }
            } else {
                Advance::Waiting(PendingCall::Documents {
                    accumulator: acc,
                    reply,
                })
            }
        }
    }
}

struct Subscriber {
    id: u64,
    active: Arc<AtomicBool>,
    callback: UpdateCallback,
}

/// Live subscription registry for one settled document-set call.
struct SubscriptionSlot {
    set_name: String,
    /// Whether any callback ever attached; until then events are buffered
    attached: bool,
    buffered: Vec<PushEvent>,
    /// Events dropped because the buffer was full
    overflowed: usize,
    subscribers: Vec<Subscriber>,
}

#[derive(Default)]
struct CallTable {
    pending: HashMap<Uuid, PendingCall>,
    subscriptions: HashMap<Uuid, SubscriptionSlot>,
    next_subscriber: u64,
}

/// One event fanned out to one callback, outside the table lock.
struct Delivery {
    active: Arc<AtomicBool>,
    callback: UpdateCallback,
    event: PushEvent,
}

impl Delivery {
    fn run(self) {
        if self.active.load(Ordering::SeqCst) {
            (self.callback)(self.event);
        }
    }
}

/// Owner of the pending-call table and the subscription registry.
pub struct Correlator {
    table: Mutex<CallTable>,
    /// Drop buffered events beyond this many per slot
    buffer_limit: usize,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIPTION_BUFFER)
    }
}

impl Correlator {
    pub fn new(buffer_limit: usize) -> Self {
        Self {
            table: Mutex::new(CallTable::default()),
            buffer_limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CallTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, call_id: Uuid, call: PendingCall) {
        self.lock().pending.insert(call_id, call);
    }

    /// Remove a pending call without settling it (send failure, timeout).
    pub(crate) fn forget(&self, call_id: &Uuid) {
        self.lock().pending.remove(call_id);
    }

    /// Decode and route one binary frame. Undecodable frames are dropped.
    pub fn dispatch_bytes(&self, data: &[u8]) {
        match decode::<Frame>(data) {
            Ok(frame) => self.dispatch(frame),
            Err(e) => warn!(error = %e, bytes = data.len(), "Dropping undecodable frame"),
        }
    }

    /// Route one decoded frame.
    pub fn dispatch(&self, frame: Frame) {
        let Some(call_id) = frame.call_uuid() else {
            trace!("Dropping frame without a usable callId");
            return;
        };
        let handled = frame.handled;
        let body = frame.into_body();

        let mut deliveries = Vec::new();
        {
            let mut table = self.lock();

            if let Some(call) = table.pending.remove(&call_id) {
                match advance(call, handled, body) {
                    Advance::Waiting(call) => {
                        table.pending.insert(call_id, call);
                    }
                    Advance::Settled => {
                        trace!(call_id = %call_id, "Call settled");
                    }
                    Advance::Subscribe {
                        set_name,
                        mut buffered,
                    } => {
                        let overflowed = buffered.len().saturating_sub(self.buffer_limit);
                        buffered.truncate(self.buffer_limit);
                        table.subscriptions.insert(
                            call_id,
                            SubscriptionSlot {
                                set_name,
                                attached: false,
                                buffered,
                                overflowed,
                                subscribers: Vec::new(),
                            },
                        );
                    }
                }
            } else if let Some(slot) = table.subscriptions.get_mut(&call_id) {
                match body {
                    FrameBody::Push(event) if slot.attached => {
                        deliveries.extend(slot.subscribers.iter().map(|s| Delivery {
                            active: Arc::clone(&s.active),
                            callback: Arc::clone(&s.callback),
                            event: event.clone(),
                        }));
                    }
                    FrameBody::Push(event) if slot.buffered.len() < self.buffer_limit => {
                        slot.buffered.push(event);
                    }
                    FrameBody::Push(_) => {
                        if slot.overflowed == 0 {
                            warn!(
                                call_id = %call_id,
                                set_name = %slot.set_name,
                                limit = self.buffer_limit,
                                "Subscription buffer full, dropping events until on_update"
                            );
                        }
                        slot.overflowed += 1;
                    }
                    FrameBody::Error(e) => {
                        warn!(
                            call_id = %call_id,
                            error = %e.error_message,
                            "Error frame for open document set"
                        );
                    }
                    _ => trace!(call_id = %call_id, "Ignoring non-push frame for subscription"),
                }
            } else {
                trace!(call_id = %call_id, "Dropping frame for unknown call");
            }
        }

        for delivery in deliveries {
            delivery.run();
        }
    }

    /// Attach a callback to a settled document-set call. Returns the
    /// subscriber id and its active flag, or `None` when the slot is gone.
    pub(crate) fn subscribe(
        &self,
        call_id: Uuid,
        callback: UpdateCallback,
    ) -> Option<(u64, Arc<AtomicBool>)> {
        let mut deliveries = Vec::new();
        let registration = {
            let mut table = self.lock();
            table.next_subscriber += 1;
            let id = table.next_subscriber;
            let slot = table.subscriptions.get_mut(&call_id)?;

            let active = Arc::new(AtomicBool::new(true));
            if !slot.attached {
                slot.attached = true;
                if slot.overflowed > 0 {
                    debug!(
                        call_id = %call_id,
                        dropped = slot.overflowed,
                        "Buffered events were dropped"
                    );
                }
                deliveries.extend(slot.buffered.drain(..).map(|event| Delivery {
                    active: Arc::clone(&active),
                    callback: Arc::clone(&callback),
                    event,
                }));
            }
            slot.subscribers.push(Subscriber {
                id,
                active: Arc::clone(&active),
                callback,
            });
            (id, active)
        };

        for delivery in deliveries {
            delivery.run();
        }
        Some(registration)
    }

    /// Detach one callback; the slot goes away with its last subscriber.
    pub(crate) fn unsubscribe(&self, call_id: &Uuid, subscriber_id: u64) {
        let mut table = self.lock();
        let Some(slot) = table.subscriptions.get_mut(call_id) else {
            return;
        };
        slot.subscribers.retain(|s| {
            if s.id == subscriber_id {
                s.active.store(false, Ordering::SeqCst);
                false
            } else {
                true
            }
        });
        if slot.attached && slot.subscribers.is_empty() {
            table.subscriptions.remove(call_id);
        }
    }

    /// Drop every subscription belonging to `set_name`.
    pub(crate) fn close_set(&self, set_name: &str) {
        let mut table = self.lock();
        table.subscriptions.retain(|_, slot| {
            if slot.set_name == set_name {
                deactivate(slot);
                false
            } else {
                true
            }
        });
    }

    /// Reject every in-flight call, keeping subscriptions.
    pub(crate) fn fail_pending(&self, error: SyncError) {
        let drained: Vec<PendingCall> = {
            let mut table = self.lock();
            table.pending.drain().map(|(_, call)| call).collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), error = %error, "Rejecting pending calls");
        }
        for call in drained {
            call.reject(error.clone());
        }
    }

    /// Reject every in-flight call and drop every subscription.
    pub(crate) fn cancel_all(&self, error: SyncError) {
        self.fail_pending(error);
        let mut table = self.lock();
        for slot in table.subscriptions.values() {
            deactivate(slot);
        }
        table.subscriptions.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().subscriptions.len()
    }
}

fn deactivate(slot: &SubscriptionSlot) {
    for subscriber in &slot.subscribers {
        subscriber.active.store(false, Ordering::SeqCst);
    }
}
