//! Debounced decorator scheduling
//!
//! ```text
//! execute(u1) ─┐
//! execute(u2) ─┼─ debounce ──► run(u3, seq=3) ──► seq still 3? ──► store.update
//! execute(u3) ─┘                                        │
//!                                                       └─ no: discard
//! ```
//!
//! Timers are aborted on re-arm and on cleanup. A run, once started, is
//! never aborted; the sequence check decides whether its result is used.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{Decorator, UpdateDecorators};
use crate::document::{DecoratedDocument, DocumentCollection};
use crate::reducer::UpdateScheduler;
use crate::session::protocol::DocumentUpdate;
use crate::store::DocumentStore;

/// Default quiet period before decorators run
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

type DecoratorsFn = Box<dyn Fn() -> Vec<Arc<dyn Decorator>> + Send + Sync>;
type AccessTokenFn = Box<dyn Fn() -> Option<String> + Send + Sync>;

#[derive(Default)]
struct State {
    pending: Option<(DocumentUpdate, Arc<DecoratedDocument>)>,
    timer: Option<JoinHandle<()>>,
}

struct Shared {
    store: Arc<dyn DocumentStore>,
    decorators: DecoratorsFn,
    access_token: AccessTokenFn,
    runner: Arc<dyn UpdateDecorators>,
    debounce: Duration,
    state: Mutex<State>,
    sequence: AtomicU64,
}

/// Debounced, stale-safe enrichment of updated documents.
pub struct DecoratorScheduler {
    shared: Arc<Shared>,
}

impl DecoratorScheduler {
    /// `decorators` and `access_token` are read when a run starts, so they
    /// always see current values.
    pub fn new<D, T>(
        store: Arc<dyn DocumentStore>,
        decorators: D,
        access_token: T,
        runner: Arc<dyn UpdateDecorators>,
        debounce: Duration,
    ) -> Self
    where
        D: Fn() -> Vec<Arc<dyn Decorator>> + Send + Sync + 'static,
        T: Fn() -> Option<String> + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                store,
                decorators: Box::new(decorators),
                access_token: Box::new(access_token),
                runner,
                debounce,
                state: Mutex::new(State::default()),
                sequence: AtomicU64::new(0),
            }),
        }
    }

    /// Drop the queued update and cancel its timer. In-flight runs finish
    /// but are subject to the usual sequence check.
    pub fn cleanup(&self) {
        let mut state = self.shared.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.pending = None;
    }

    /// Sequence number of the most recent `execute`.
    pub fn latest_sequence(&self) -> u64 {
        self.shared.sequence.load(Ordering::SeqCst)
    }
}

impl UpdateScheduler for DecoratorScheduler {
    fn execute(&self, update: &DocumentUpdate, parent: Option<&Arc<DecoratedDocument>>) {
        let (Some(uuid), Some(parent)) = (update.document_uuid(), parent) else {
            return;
        };
        let Ok(runtime) = Handle::try_current() else {
            warn!(uuid = %uuid, "No runtime for decorator scheduling");
            return;
        };

        let mut state = self.shared.lock();
        let sequence = self.shared.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        state.pending = Some((update.clone(), Arc::clone(parent)));

        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let shared = Arc::clone(&self.shared);
        state.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(shared.debounce).await;
            shared.fire();
        }));

        trace!(uuid = %uuid, sequence, "Decorator run scheduled");
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Timer expiry: start the run for whatever is pending now.
    fn fire(self: &Arc<Self>) {
        let (pending, sequence) = {
            let mut state = self.lock();
            (state.pending.take(), self.sequence.load(Ordering::SeqCst))
        };
        let Some((update, parent)) = pending else {
            return;
        };

        let decorators = (self.decorators)();
        let access_token = (self.access_token)();
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            shared.run(sequence, update, parent, decorators, access_token).await;
        });
    }

    async fn run(
        &self,
        sequence: u64,
        update: DocumentUpdate,
        parent: Arc<DecoratedDocument>,
        decorators: Vec<Arc<dyn Decorator>>,
        access_token: Option<String>,
    ) {
        let uuid = parent.uuid().to_string();
        let decorated = match self.runner.run(parent, update, decorators, access_token).await {
            Ok(decorated) => Arc::new(decorated),
            Err(e) => {
                warn!(uuid = %uuid, error = %e, "Update decorator failed");
                return;
            }
        };

        let mut applied = false;
        self.store.update(&mut |prev: &DocumentCollection| {
            if self.sequence.load(Ordering::SeqCst) != sequence {
                return prev.clone();
            }
            let Some(index) = prev.position(&uuid) else {
                return prev.clone();
            };
            let mut entries = prev.to_entries();
            entries[index] = Arc::clone(&decorated);
            applied = true;
            DocumentCollection::new(entries)
        });

        if applied {
            debug!(uuid = %uuid, sequence, "Decorations applied");
        } else {
            debug!(uuid = %uuid, sequence, "Discarding stale decorations");
        }
    }
}
