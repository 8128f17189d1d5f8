//! Live document sets
//!
//! Glue between a [`SyncSession`] document set, the reducer, a
//! [`SharedCollection`] and a [`DecoratorScheduler`]. Open one, watch its
//! collection, close it when done.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::decorator::{
    Decorator, DecoratorRunner, DecoratorScheduler, UpdateDecorators, DEFAULT_DEBOUNCE,
};
use crate::document::DocumentCollection;
use crate::error::Result;
use crate::reducer;
use crate::session::{GetDocumentsParams, PushEvent, Subscription, SyncSession};
use crate::store::{DocumentStore, SharedCollection};

/// Enrichment settings for a live set.
#[derive(Clone)]
pub struct LiveOptions {
    pub decorators: Vec<Arc<dyn Decorator>>,
    pub runner: Arc<dyn UpdateDecorators>,
    pub debounce: Duration,
}

impl Default for LiveOptions {
    fn default() -> Self {
        Self {
            decorators: Vec::new(),
            runner: Arc::new(DecoratorRunner),
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

/// A document set kept current by push events.
pub struct LiveDocuments {
    session: SyncSession,
    set_name: String,
    call_id: Uuid,
    store: SharedCollection,
    scheduler: Arc<DecoratorScheduler>,
    subscription: Subscription,
}

impl LiveDocuments {
    /// Fetch the set and start folding its push events into a shared store.
    pub async fn open(
        session: &SyncSession,
        params: GetDocumentsParams,
        options: LiveOptions,
    ) -> Result<Self> {
        let resolver = params.resolve_parent_index.clone();
        let set = session.get_documents(params).await?;
        let store = SharedCollection::new(set.documents.clone());

        let decorators = options.decorators;
        let scheduler = Arc::new(DecoratorScheduler::new(
            Arc::new(store.clone()),
            move || decorators.clone(),
            session.token_reader(),
            options.runner,
            options.debounce,
        ));

        let subscription = set.on_update({
            let store = store.clone();
            let scheduler = Arc::clone(&scheduler);
            move |event: PushEvent| {
                store.update(&mut |prev: &DocumentCollection| match (&event, &resolver) {
                    (PushEvent::InclusionBatch(batch), Some(resolve)) => {
                        reducer::handle_inclusion_batch_with(prev, batch, &**resolve)
                    }
                    _ => reducer::apply_push_event(prev, &event, &*scheduler),
                });
            }
        });

        info!(
            set_name = %set.set_name,
            call_id = %set.call_id,
            documents = set.documents.len(),
            "Live document set opened"
        );

        Ok(Self {
            session: session.clone(),
            set_name: set.set_name,
            call_id: set.call_id,
            store,
            scheduler,
            subscription,
        })
    }

    pub fn set_name(&self) -> &str {
        &self.set_name
    }

    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    /// Current collection.
    pub fn documents(&self) -> DocumentCollection {
        self.store.snapshot()
    }

    /// Receiver notified whenever the collection changes.
    pub fn subscribe(&self) -> watch::Receiver<DocumentCollection> {
        self.store.subscribe()
    }

    pub fn store(&self) -> &SharedCollection {
        &self.store
    }

    /// Stop listening, drop queued enrichment and close the set on the server.
    pub async fn close(self) -> Result<()> {
        self.subscription.unsubscribe();
        self.scheduler.cleanup();
        debug!(set_name = %self.set_name, "Closing live document set");
        self.session.close_document_set(&self.set_name).await
    }
}
